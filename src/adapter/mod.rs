//! Protocol adapter abstraction layer.
//!
//! Provides the [`ProtocolAdapter`] trait that encapsulates all
//! transport-specific listing and fetching (HTTP, FTP, SFTP, rsync, Git,
//! S3-compatible object stores, WebDAV, local filesystem).  The sync engine
//! dispatches through this trait so that no transport detail leaks outside
//! this module; adding a backend never touches the engine.

pub mod ftp;
pub mod git;
pub mod http;
pub mod local;
pub mod rsync;
pub mod s3;
pub mod sftp;
pub mod webdav;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{SourceConfig, SourceKind};
use crate::error::TransferError;

// ---------------------------------------------------------------------------
// Remote entry
// ---------------------------------------------------------------------------

/// One listable unit on the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    /// Content identity when the protocol provides one (S3 ETag, git ref
    /// digest).  Used in preference to re-hashing after fetch.
    pub hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Transport capability set: enumerate the remote, fetch one entry.
///
/// `fetch` writes through a temporary sibling path and renames into place on
/// success, so a partial file is never observable at `dest`.  All failures
/// are classified [`TransferError`]s.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Enumerate remote entries.  Re-invocable; a fresh listing is produced
    /// each call.
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError>;

    /// Transfer one entry to `dest`, returning bytes moved.
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError>;
}

// ---------------------------------------------------------------------------
// Shared transfer options
// ---------------------------------------------------------------------------

/// Timeouts handed to every adapter at construction.
#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl AdapterOptions {
    pub fn from_config(config: &crate::config::ConcurrencyConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the adapter for a validated source.
///
/// `endpoint_override` substitutes the connection URL when the health
/// monitor has failed the source over to its fallback; kinds without a URL
/// ignore it.
pub async fn build_adapter(
    source: &SourceConfig,
    endpoint_override: Option<String>,
    opts: AdapterOptions,
) -> Result<Arc<dyn ProtocolAdapter>, TransferError> {
    let url = endpoint_override.or_else(|| source.url.clone());

    let adapter: Arc<dyn ProtocolAdapter> = match source.kind {
        SourceKind::Http => Arc::new(http::HttpAdapter::new(
            url.ok_or_else(|| TransferError::Validation("http source without url".into()))?,
            source.username.clone(),
            source.password.clone(),
            opts,
        )?),
        SourceKind::Webdav => Arc::new(webdav::WebdavAdapter::new(
            url.ok_or_else(|| TransferError::Validation("webdav source without url".into()))?,
            source.username.clone(),
            source.password.clone(),
            opts,
        )?),
        SourceKind::Ftp => Arc::new(ftp::FtpAdapter::new(source, opts)?),
        SourceKind::Sftp => Arc::new(sftp::SftpAdapter::new(source, opts)?),
        SourceKind::Rsync => Arc::new(rsync::RsyncAdapter::new(source, opts)?),
        SourceKind::Git => Arc::new(git::GitAdapter::new(
            url.ok_or_else(|| TransferError::Validation("git source without url".into()))?,
        )),
        SourceKind::S3 => Arc::new(s3::S3Adapter::new(source, url).await?),
        SourceKind::Local => Arc::new(local::LocalAdapter::new(source)?),
    };

    Ok(adapter)
}

// ---------------------------------------------------------------------------
// Atomic commit discipline
// ---------------------------------------------------------------------------

/// Staging path next to `dest`: `.{filename}.part`.
///
/// Hidden and suffixed so an interrupted transfer is never mistaken for the
/// final artifact, and on the same filesystem so the rename is atomic.
pub(crate) fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.part"))
}

/// Create `dest`'s parent directories and return the staging path.
pub(crate) async fn prepare_staging(dest: &Path) -> Result<PathBuf, TransferError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
    }
    Ok(staging_path(dest))
}

/// Atomically move a completed staging file into place.
pub(crate) async fn commit_staging(staging: &Path, dest: &Path) -> Result<(), TransferError> {
    tokio::fs::rename(staging, dest)
        .await
        .map_err(|e| TransferError::from_io(&e))
}

/// Best-effort removal of a staging file after a failed transfer.
pub(crate) async fn discard_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_file(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %staging.display(), error = %e, "failed to remove staging file");
        }
    }
}

// ---------------------------------------------------------------------------
// Path hygiene
// ---------------------------------------------------------------------------

/// Normalize a remote-supplied relative path, rejecting anything that could
/// escape the target directory.
pub(crate) fn sanitize_rel_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_is_hidden_sibling() {
        let staged = staging_path(Path::new("/srv/mirror/pool/pkg.deb"));
        assert_eq!(staged, Path::new("/srv/mirror/pool/.pkg.deb.part"));
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert_eq!(sanitize_rel_path("a/b.txt"), Some("a/b.txt".into()));
        assert_eq!(sanitize_rel_path("/a//b/./c"), Some("a/b/c".into()));
        assert_eq!(sanitize_rel_path("../etc/passwd"), None);
        assert_eq!(sanitize_rel_path("a/../../b"), None);
        assert_eq!(sanitize_rel_path(""), None);
        assert_eq!(sanitize_rel_path("/"), None);
    }
}
