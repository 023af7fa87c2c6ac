//! S3-compatible object store adapter (AWS S3, Alibaba OSS, Tencent COS).
//!
//! Listing paginates `ListObjectsV2` under the configured prefix; fetching
//! streams `GetObject` through a staging file.  A custom `url` on the source
//! becomes the SDK endpoint override, which is how OSS/COS and other
//! S3-compatible stores are addressed.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{ProtocolAdapter, RemoteEntry};
use crate::config::SourceConfig;
use crate::error::TransferError;

pub struct S3Adapter {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Adapter {
    pub async fn new(
        source: &SourceConfig,
        endpoint_url: Option<String>,
    ) -> Result<Self, TransferError> {
        let bucket = source
            .bucket
            .clone()
            .ok_or_else(|| TransferError::Validation("s3 source without bucket".into()))?;

        let mut loader = aws_config::from_env();
        if let Some(ref region) = source.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(true);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url);
        }
        let client = Client::from_conf(builder.build());

        let mut prefix = source.prefix.clone().unwrap_or_default();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }
}

fn classify_sdk<E, R>(err: &SdkError<E, R>) -> TransferError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    if let Some(service_err) = err.as_service_error() {
        let code = service_err.code().unwrap_or_default();
        let detail = format!("S3 {code}: {}", service_err.message().unwrap_or_default());
        return match code {
            "NoSuchKey" | "NoSuchBucket" | "NotFound" => TransferError::NotFound(detail),
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"
            | "ExpiredToken" => TransferError::Auth(detail),
            _ => TransferError::Connection(detail),
        };
    }
    TransferError::Connection(format!("S3 request failed: {err:?}"))
}

#[async_trait]
impl ProtocolAdapter for S3Adapter {
    #[instrument(skip(self), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix);
            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.map_err(|e| classify_sdk(&e))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                let rel = key.strip_prefix(&self.prefix).unwrap_or(key);
                // Zero-byte "directory" placeholder objects end in '/'.
                if rel.ends_with('/') {
                    continue;
                }
                let Some(path) = super::sanitize_rel_path(rel) else {
                    continue;
                };

                let mtime: Option<DateTime<Utc>> = obj
                    .last_modified()
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), 0));
                let hash = obj
                    .e_tag()
                    .map(|etag| etag.trim_matches('"').to_string());

                entries.push(RemoteEntry {
                    path,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    mtime,
                    hash,
                });
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = entries.len(), "s3 listing complete");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        let key = format!("{}{}", self.prefix, entry.path);

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify_sdk(&e))?;

        let staging = super::prepare_staging(dest).await?;
        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| TransferError::from_io(&e))?;

        let mut transferred: u64 = 0;
        let mut body = resp.body;
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        super::discard_staging(&staging).await;
                        return Err(TransferError::from_io(&e));
                    }
                    transferred += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    super::discard_staging(&staging).await;
                    return Err(TransferError::Connection(format!(
                        "S3 body stream error: {e}"
                    )));
                }
            }
        }

        if let Err(e) = file.flush().await {
            super::discard_staging(&staging).await;
            return Err(TransferError::from_io(&e));
        }
        drop(file);

        super::commit_staging(&staging, dest).await?;
        debug!(bytes = transferred, "s3 fetch complete");
        Ok(transferred)
    }
}
