//! Local filesystem adapter.
//!
//! Mirrors one directory tree into another.  Listing is a `walkdir` sweep;
//! fetching hardlinks into the staging path when source and target share a
//! filesystem (zero-copy dedup) and falls back to a plain copy across
//! devices.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{ProtocolAdapter, RemoteEntry};
use crate::config::SourceConfig;
use crate::error::TransferError;

pub struct LocalAdapter {
    root: PathBuf,
}

impl LocalAdapter {
    pub fn new(source: &SourceConfig) -> Result<Self, TransferError> {
        let root = source
            .path
            .clone()
            .ok_or_else(|| TransferError::Validation("local source without path".into()))?;
        Ok(Self {
            root: PathBuf::from(root),
        })
    }
}

#[async_trait]
impl ProtocolAdapter for LocalAdapter {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || {
            if !root.is_dir() {
                return Err(TransferError::NotFound(format!(
                    "source directory not found: {}",
                    root.display()
                )));
            }

            let mut out = Vec::new();
            for item in WalkDir::new(&root).follow_links(false) {
                let item = item.map_err(|e| {
                    TransferError::Connection(format!("walk {}: {e}", root.display()))
                })?;
                if !item.file_type().is_file() {
                    continue;
                }
                let rel = item
                    .path()
                    .strip_prefix(&root)
                    .expect("walkdir yields paths under its root")
                    .to_string_lossy()
                    .replace('\\', "/");
                let Some(path) = super::sanitize_rel_path(&rel) else {
                    continue;
                };

                let meta = item
                    .metadata()
                    .map_err(|e| TransferError::Connection(format!("stat {rel}: {e}")))?;
                let mtime: Option<DateTime<Utc>> =
                    meta.modified().ok().map(DateTime::<Utc>::from);

                out.push(RemoteEntry {
                    path,
                    size: meta.len(),
                    mtime,
                    hash: None,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| TransferError::Connection(format!("walk task panicked: {e}")))??;

        debug!(count = entries.len(), "local listing complete");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        let src = self.root.join(&entry.path);
        let staging = super::prepare_staging(dest).await?;

        // Hardlink first; a cross-device link fails and we copy instead.
        super::discard_staging(&staging).await;
        let transferred = match tokio::fs::hard_link(&src, &staging).await {
            Ok(()) => tokio::fs::metadata(&staging)
                .await
                .map(|m| m.len())
                .unwrap_or(entry.size),
            Err(_) => match tokio::fs::copy(&src, &staging).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    super::discard_staging(&staging).await;
                    return Err(TransferError::from_io(&e));
                }
            },
        };

        super::commit_staging(&staging, dest).await?;
        debug!(bytes = transferred, "local fetch complete");
        Ok(transferred)
    }
}
