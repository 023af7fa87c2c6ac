//! HTTP(S) mirror adapter.
//!
//! Listing walks the remote's directory index pages recursively, collecting
//! file links and descending into subdirectory links.  Sizes and
//! modification times come from a `HEAD` per discovered file, since index
//! pages do not reliably carry them.  Fetching streams the body through a
//! hidden staging file and renames into place.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{AdapterOptions, ProtocolAdapter, RemoteEntry};
use crate::error::TransferError;

/// Directory-index recursion ceiling; deeper trees are almost certainly a
/// link cycle the visited-set failed to catch (e.g. rewritten URLs).
const MAX_DEPTH: usize = 16;

pub struct HttpAdapter {
    base: Url,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl HttpAdapter {
    pub fn new(
        base_url: String,
        username: Option<String>,
        password: Option<String>,
        opts: AdapterOptions,
    ) -> Result<Self, TransferError> {
        let mut base = Url::parse(&base_url)
            .map_err(|e| TransferError::Validation(format!("invalid url {base_url:?}: {e}")))?;
        // Directory semantics require a trailing slash for Url::join.
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

    /// Fetch one index page and split its links into subdirectories and
    /// files, both relative to the adapter base.
    async fn read_index(
        &self,
        dir: &str,
    ) -> Result<(Vec<String>, Vec<String>), TransferError> {
        let url = self
            .base
            .join(dir)
            .map_err(|e| TransferError::Validation(format!("bad index path {dir:?}: {e}")))?;

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
        let html = resp
            .text()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for href in parse_index_links(&html) {
            let is_dir = href.ends_with('/');
            let Some(rel) = super::sanitize_rel_path(&href) else {
                continue;
            };
            let full = if dir.is_empty() {
                rel
            } else {
                format!("{dir}{rel}")
            };
            if is_dir {
                dirs.push(format!("{full}/"));
            } else {
                files.push(full);
            }
        }
        Ok((dirs, files))
    }

    /// HEAD one file to learn its size and mtime.
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransferError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| TransferError::Validation(format!("bad file path {path:?}: {e}")))?;
        let resp = self
            .request(reqwest::Method::HEAD, url.clone())
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;
        if !resp.status().is_success() {
            return Err(TransferError::from_http_status(
                resp.status().as_u16(),
                &format!("HEAD {url}"),
            ));
        }

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let mtime = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        Ok(RemoteEntry {
            path: path.to_string(),
            size,
            mtime,
            hash: None,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    #[instrument(skip(self), fields(base = %self.base))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let mut entries = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        // (dir, depth) work queue; "" is the base directory itself.
        let mut queue: Vec<(String, usize)> = vec![(String::new(), 0)];

        while let Some((dir, depth)) = queue.pop() {
            if !visited.insert(dir.clone()) {
                continue;
            }
            if depth > MAX_DEPTH {
                warn!(dir = %dir, "index recursion limit reached, skipping subtree");
                continue;
            }

            let (subdirs, files) = self.read_index(&dir).await?;
            for sub in subdirs {
                queue.push((sub, depth + 1));
            }
            for file in files {
                match self.stat(&file).await {
                    Ok(entry) => entries.push(entry),
                    // A link that 404s between index and HEAD just vanished.
                    Err(TransferError::NotFound(_)) => {
                        debug!(path = %file, "listed file vanished before stat")
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(count = entries.len(), "http listing complete");
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
        debug!(bytes = transferred, "http fetch complete");
        Ok(transferred)
    }
}

// ---------------------------------------------------------------------------
// Index parsing
// ---------------------------------------------------------------------------

/// Extract candidate hrefs from a directory index page.
///
/// Index pages are machine-generated, so a plain anchor scan suffices; we
/// skip parent links, query links, and absolute URLs (which would leave the
/// mirror root).
pub(crate) fn parse_index_links(html: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find("href=\"") {
        rest = &rest[start + 6..];
        let Some(end) = rest.find('"') else { break };
        let href = &rest[..end];
        rest = &rest[end..];

        if href.is_empty()
            || href.starts_with('?')
            || href.starts_with('#')
            || href.starts_with("../")
            || href == "./"
            || href == "/"
            || href.contains("://")
        {
            continue;
        }
        links.push(href.to_string());
    }
    links
}

/// Parse an RFC 2822 `Last-Modified` header value.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_autoindex_links() {
        let html = r#"
<html><body><h1>Index of /dist</h1><pre>
<a href="../">../</a>
<a href="pool/">pool/</a>
<a href="Release">Release</a>
<a href="Release.gpg">Release.gpg</a>
<a href="?C=M;O=A">Sort</a>
<a href="https://elsewhere.example.com/x">off-site</a>
</pre></body></html>"#;
        let links = parse_index_links(html);
        assert_eq!(links, vec!["pool/", "Release", "Release.gpg"]);
    }

    #[test]
    fn parses_http_date() {
        let dt = parse_http_date("Wed, 01 May 2024 12:30:00 GMT").unwrap();
        assert_eq!(dt.timestamp(), 1714566600);
        assert!(parse_http_date("not a date").is_none());
    }
}
