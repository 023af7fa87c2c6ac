//! WebDAV mirror adapter.
//!
//! Listing issues `PROPFIND` with `Depth: 1` and walks collections
//! breadth-first; the multistatus XML is parsed with `quick-xml`.  Fetching
//! is a plain `GET` through a staging file.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use url::Url;

use super::{AdapterOptions, ProtocolAdapter, RemoteEntry};
use crate::error::TransferError;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
  </D:prop>
</D:propfind>"#;

pub struct WebdavAdapter {
    base: Url,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl WebdavAdapter {
    pub fn new(
        base_url: String,
        username: Option<String>,
        password: Option<String>,
        opts: AdapterOptions,
    ) -> Result<Self, TransferError> {
        let mut base = Url::parse(&base_url)
            .map_err(|e| TransferError::Validation(format!("invalid url {base_url:?}: {e}")))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let client = reqwest::Client::builder()
            .user_agent("mirrorcache/0.1")
            .connect_timeout(opts.connect_timeout)
            .timeout(opts.fetch_timeout)
            .build()
            .map_err(|e| TransferError::Validation(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base,
            client,
            username,
            password,
        })
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(ref user) = self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        req
    }

    async fn propfind(&self, dir: &str) -> Result<Vec<DavResource>, TransferError> {
        let url = self
            .base
            .join(dir)
            .map_err(|e| TransferError::Validation(format!("bad collection path {dir:?}: {e}")))?;

        let method = reqwest::Method::from_bytes(b"PROPFIND")
            .expect("PROPFIND is a valid method token");
        let resp = self
            .request(method, url.clone())
            .header("Depth", "1")
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;

        if !resp.status().is_success() {
            return Err(TransferError::from_http_status(
                resp.status().as_u16(),
                &format!("PROPFIND {url}"),
            ));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;
        parse_multistatus(&body)
    }
}

// ---------------------------------------------------------------------------
// Multistatus parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DavResource {
    pub href: String,
    pub is_collection: bool,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Parse a `207 Multi-Status` body into resources.
///
/// Namespace prefixes vary between servers, so elements are matched on
/// their local name only.
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<DavResource>, TransferError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut text_target: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "response" => current = Some(DavResource::default()),
                    "href" => text_target = Some("href"),
                    "getcontentlength" => text_target = Some("size"),
                    "getlastmodified" => text_target = Some("mtime"),
                    // Some servers expand <collection/> into a start/end pair.
                    "collection" => {
                        if let Some(ref mut res) = current {
                            res.is_collection = true;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == "collection" {
                    if let Some(ref mut res) = current {
                        res.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(target), Some(res)) = (text_target, current.as_mut()) {
                    let text = t
                        .unescape()
                        .map_err(|e| {
                            TransferError::Connection(format!("bad multistatus text: {e}"))
                        })?
                        .into_owned();
                    match target {
                        "href" => res.href = text,
                        "size" => res.size = text.trim().parse().unwrap_or(0),
                        "mtime" => {
                            res.mtime = DateTime::parse_from_rfc2822(text.trim())
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc));
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "response" => {
                        if let Some(res) = current.take() {
                            resources.push(res);
                        }
                    }
                    "href" | "getcontentlength" | "getlastmodified" => text_target = None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TransferError::Connection(format!(
                    "malformed multistatus XML: {e}"
                )))
            }
            _ => {}
        }
    }

    Ok(resources)
}

fn local_name(name: &[u8]) -> String {
    let raw = String::from_utf8_lossy(name);
    raw.rsplit(':').next().unwrap_or(&raw).to_ascii_lowercase()
}

#[async_trait]
impl ProtocolAdapter for WebdavAdapter {
    #[instrument(skip(self), fields(base = %self.base))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let base_path = self.base.path().to_string();
        let mut entries = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = vec![String::new()];

        while let Some(dir) = queue.pop() {
            if !visited.insert(dir.clone()) {
                continue;
            }

            for resource in self.propfind(&dir).await? {
                // The collection reports itself first; skip it.
                let decoded = percent_decode(&resource.href);
                let Some(rel_raw) = decoded.strip_prefix(base_path.as_str()) else {
                    continue;
                };
                let Some(rel) = super::sanitize_rel_path(rel_raw) else {
                    continue;
                };

                if resource.is_collection {
                    queue.push(format!("{rel}/"));
                } else {
                    entries.push(RemoteEntry {
                        path: rel,
                        size: resource.size,
                        mtime: resource.mtime,
                        hash: None,
                    });
                }
            }
        }

        debug!(count = entries.len(), "webdav listing complete");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        let url = self
            .base
            .join(&entry.path)
            .map_err(|e| TransferError::Validation(format!("bad fetch path: {e}")))?;

        let resp = self
            .request(reqwest::Method::GET, url.clone())
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;
        if !resp.status().is_success() {
            return Err(TransferError::from_http_status(
                resp.status().as_u16(),
                &format!("GET {url}"),
            ));
        }

        let staging = super::prepare_staging(dest).await?;
        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| TransferError::from_io(&e))?;

        let mut transferred: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    super::discard_staging(&staging).await;
                    return Err(TransferError::from_reqwest(&e));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                super::discard_staging(&staging).await;
                return Err(TransferError::from_io(&e));
            }
            transferred += chunk.len() as u64;
        }

        if let Err(e) = file.flush().await {
            super::discard_staging(&staging).await;
            return Err(TransferError::from_io(&e));
        }
        drop(file);

        super::commit_staging(&staging, dest).await?;
        debug!(bytes = transferred, "webdav fetch complete");
        Ok(transferred)
    }
}

/// Minimal percent-decoding for href paths.
fn percent_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
