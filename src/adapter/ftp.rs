//! FTP mirror adapter.
//!
//! `suppaftp` is a blocking client, so every operation runs inside
//! `tokio::task::spawn_blocking`.  Listing walks the remote directory tree
//! with `LIST`; fetching streams `RETR` output through a staging file.
//! Connections are per-operation: fetches run concurrently on the engine's
//! worker pool and FTP control channels cannot be shared.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, instrument};

use super::{AdapterOptions, ProtocolAdapter, RemoteEntry};
use crate::config::SourceConfig;
use crate::error::TransferError;

#[derive(Clone)]
struct FtpParams {
    host: String,
    port: u16,
    username: String,
    password: String,
    root: String,
}

pub struct FtpAdapter {
    params: FtpParams,
}

impl FtpAdapter {
    pub fn new(source: &SourceConfig, _opts: AdapterOptions) -> Result<Self, TransferError> {
        let host = source
            .host
            .clone()
            .ok_or_else(|| TransferError::Validation("ftp source without host".into()))?;
        Ok(Self {
            params: FtpParams {
                host,
                port: source.port.unwrap_or(21),
                username: source.username.clone().unwrap_or_else(|| "anonymous".into()),
                password: source.password.clone().unwrap_or_else(|| "anonymous@".into()),
                root: source.path.clone().unwrap_or_else(|| "/".into()),
            },
        })
    }
}

fn classify(err: FtpError) -> TransferError {
    match err {
        FtpError::ConnectionError(io) => TransferError::Connection(io.to_string()),
        FtpError::UnexpectedResponse(resp) => {
            let code = resp.status as u32;
            let body = String::from_utf8_lossy(&resp.body).trim().to_string();
            match code {
                530 | 532 => TransferError::Auth(format!("FTP {code}: {body}")),
                550 => TransferError::NotFound(format!("FTP 550: {body}")),
                452 => TransferError::Capacity(format!("FTP 452: {body}")),
                _ => TransferError::Connection(format!("FTP {code}: {body}")),
            }
        }
        other => TransferError::Connection(other.to_string()),
    }
}

fn connect(params: &FtpParams) -> Result<FtpStream, TransferError> {
    let mut ftp =
        FtpStream::connect((params.host.as_str(), params.port)).map_err(classify)?;
    ftp.login(&params.username, &params.password)
        .map_err(classify)?;
    ftp.transfer_type(FileType::Binary).map_err(classify)?;
    Ok(ftp)
}

/// Join the configured root with a relative entry path.
fn remote_path(root: &str, rel: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), rel)
}

/// Recursive `LIST` walk collecting files under `rel_dir`.
fn walk(
    ftp: &mut FtpStream,
    params: &FtpParams,
    rel_dir: &str,
    out: &mut Vec<RemoteEntry>,
) -> Result<(), TransferError> {
    let dir = if rel_dir.is_empty() {
        params.root.clone()
    } else {
        remote_path(&params.root, rel_dir)
    };
    let lines = ftp.list(Some(&dir)).map_err(classify)?;

    for line in lines {
        let Ok(item) = suppaftp::list::File::try_from(line.as_str()) else {
            continue;
        };
        let name = item.name();
        if name == "." || name == ".." {
            continue;
        }
        let Some(rel) = super::sanitize_rel_path(&if rel_dir.is_empty() {
            name.to_string()
        } else {
            format!("{rel_dir}/{name}")
        }) else {
            continue;
        };

        if item.is_directory() {
            walk(ftp, params, &rel, out)?;
        } else {
            let mtime: Option<DateTime<Utc>> = Some(DateTime::<Utc>::from(item.modified()));
            out.push(RemoteEntry {
                path: rel,
                size: item.size() as u64,
                mtime,
                hash: None,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl ProtocolAdapter for FtpAdapter {
    #[instrument(skip(self), fields(host = %self.params.host))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let params = self.params.clone();
        let entries = tokio::task::spawn_blocking(move || {
            let mut ftp = connect(&params)?;
            let mut out = Vec::new();
            walk(&mut ftp, &params, "", &mut out)?;
            let _ = ftp.quit();
            Ok::<_, TransferError>(out)
        })
        .await
        .map_err(|e| TransferError::Connection(format!("ftp task panicked: {e}")))??;

        debug!(count = entries.len(), "ftp listing complete");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        let params = self.params.clone();
        let remote = remote_path(&params.root, &entry.path);
        let staging = super::prepare_staging(dest).await?;
        let staging_for_task: PathBuf = staging.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut ftp = connect(&params)?;
            let mut reader = ftp.retr_as_stream(&remote).map_err(classify)?;
            let mut file = std::fs::File::create(&staging_for_task)
                .map_err(|e| TransferError::from_io(&e))?;
            let transferred = std::io::copy(&mut reader, &mut file)
                .map_err(|e| TransferError::from_io(&e))?;
            file.flush().map_err(|e| TransferError::from_io(&e))?;
            ftp.finalize_retr_stream(reader).map_err(classify)?;
            let _ = ftp.quit();
            Ok::<_, TransferError>(transferred)
        })
        .await
        .map_err(|e| TransferError::Connection(format!("ftp task panicked: {e}")))?;

        match result {
            Ok(transferred) => {
                super::commit_staging(&staging, dest).await?;
                debug!(bytes = transferred, "ftp fetch complete");
                Ok(transferred)
            }
            Err(e) => {
                super::discard_staging(&staging).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_joins_cleanly() {
        assert_eq!(remote_path("/pub/", "a/b.iso"), "/pub/a/b.iso");
        assert_eq!(remote_path("/pub", "a.iso"), "/pub/a.iso");
    }
}
