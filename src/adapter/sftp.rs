//! SFTP mirror adapter.
//!
//! Built on `ssh2`, which is blocking, so every operation runs inside
//! `tokio::task::spawn_blocking`.  Authentication is password or private
//! key.  Listing is a recursive `readdir`; fetching copies the remote file
//! through a staging file.

use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, Session, Sftp};
use tracing::{debug, instrument};

use super::{AdapterOptions, ProtocolAdapter, RemoteEntry};
use crate::config::SourceConfig;
use crate::error::TransferError;

// libssh2 SFTP status codes we care about.
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

#[derive(Clone)]
struct SftpParams {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<PathBuf>,
    root: String,
    connect_timeout: std::time::Duration,
}

pub struct SftpAdapter {
    params: SftpParams,
}

impl SftpAdapter {
    pub fn new(source: &SourceConfig, opts: AdapterOptions) -> Result<Self, TransferError> {
        let host = source
            .host
            .clone()
            .ok_or_else(|| TransferError::Validation("sftp source without host".into()))?;
        if source.password.is_none() && source.private_key.is_none() {
            return Err(TransferError::Validation(format!(
                "sftp source {:?} needs a password or private_key",
                source.name
            )));
        }
        Ok(Self {
            params: SftpParams {
                host,
                port: source.port.unwrap_or(22),
                username: source.username.clone().unwrap_or_else(|| "anonymous".into()),
                password: source.password.clone(),
                private_key: source.private_key.clone().map(PathBuf::from),
                root: source.path.clone().unwrap_or_else(|| "/".into()),
                connect_timeout: opts.connect_timeout,
            },
        })
    }
}

fn classify(err: ssh2::Error) -> TransferError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => TransferError::NotFound(err.to_string()),
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => TransferError::Auth(err.to_string()),
        _ => TransferError::Connection(err.to_string()),
    }
}

fn connect(params: &SftpParams) -> Result<(Session, Sftp), TransferError> {
    use std::net::ToSocketAddrs;
    let addr = format!("{}:{}", params.host, params.port);
    let sock_addr = addr
        .to_socket_addrs()
        .map_err(|e| TransferError::Connection(format!("resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| TransferError::Connection(format!("no address for {addr}")))?;

    let tcp = TcpStream::connect_timeout(&sock_addr, params.connect_timeout)
        .map_err(|e| TransferError::Connection(format!("connect {addr}: {e}")))?;

    let mut sess = Session::new().map_err(classify)?;
    sess.set_tcp_stream(tcp);
    sess.handshake().map_err(classify)?;

    let auth = match (&params.private_key, &params.password) {
        (Some(key), _) => sess.userauth_pubkey_file(&params.username, None, key, None),
        (None, Some(password)) => sess.userauth_password(&params.username, password),
        (None, None) => unreachable!("validated at construction"),
    };
    auth.map_err(|e| TransferError::Auth(e.to_string()))?;

    let sftp = sess.sftp().map_err(classify)?;
    Ok((sess, sftp))
}

fn remote_path(root: &str, rel: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), rel)
}

fn walk(
    sftp: &Sftp,
    params: &SftpParams,
    rel_dir: &str,
    out: &mut Vec<RemoteEntry>,
) -> Result<(), TransferError> {
    let dir = if rel_dir.is_empty() {
        params.root.clone()
    } else {
        remote_path(&params.root, rel_dir)
    };

    let listing = sftp.readdir(Path::new(&dir)).map_err(classify)?;
    for (entry_path, stat) in listing {
        let Some(name) = entry_path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        let Some(rel) = super::sanitize_rel_path(&if rel_dir.is_empty() {
            name
        } else {
            format!("{rel_dir}/{name}")
        }) else {
            continue;
        };

        if stat.is_dir() {
            walk(sftp, params, &rel, out)?;
        } else {
            let mtime = stat
                .mtime
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));
            out.push(RemoteEntry {
                path: rel,
                size: stat.size.unwrap_or(0),
                mtime,
                hash: None,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl ProtocolAdapter for SftpAdapter {
    #[instrument(skip(self), fields(host = %self.params.host))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let params = self.params.clone();
        let entries = tokio::task::spawn_blocking(move || {
            let (_sess, sftp) = connect(&params)?;
            let mut out = Vec::new();
            walk(&sftp, &params, "", &mut out)?;
            Ok::<_, TransferError>(out)
        })
        .await
        .map_err(|e| TransferError::Connection(format!("sftp task panicked: {e}")))??;

        debug!(count = entries.len(), "sftp listing complete");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        let params = self.params.clone();
        let remote = remote_path(&params.root, &entry.path);
        let staging = super::prepare_staging(dest).await?;
        let staging_for_task = staging.clone();

        let result = tokio::task::spawn_blocking(move || {
            let (_sess, sftp) = connect(&params)?;
            let mut remote_file = sftp.open(Path::new(&remote)).map_err(classify)?;
            let mut file = std::fs::File::create(&staging_for_task)
                .map_err(|e| TransferError::from_io(&e))?;
            let transferred = std::io::copy(&mut remote_file, &mut file)
                .map_err(|e| TransferError::from_io(&e))?;
            file.flush().map_err(|e| TransferError::from_io(&e))?;
            Ok::<_, TransferError>(transferred)
        })
        .await
        .map_err(|e| TransferError::Connection(format!("sftp task panicked: {e}")))?;

        match result {
            Ok(transferred) => {
                super::commit_staging(&staging, dest).await?;
                debug!(bytes = transferred, "sftp fetch complete");
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
    use crate::config::SourceKind;

    #[test]
    fn requires_credentials() {
        let mut source = crate::config::SourceConfig {
            name: "files".into(),
            kind: SourceKind::Sftp,
            url: None,
            host: Some("files.example.com".into()),
            port: None,
            path: Some("/srv/pub".into()),
            username: Some("mirror".into()),
            password: None,
            private_key: None,
            bucket: None,
            prefix: None,
            region: None,
            target: None,
            enabled: true,
            auto_sync: false,
            schedule: None,
            mirror_delete: false,
            fallback_url: None,
        };
        let opts = AdapterOptions {
            connect_timeout: std::time::Duration::from_secs(5),
            fetch_timeout: std::time::Duration::from_secs(60),
        };
        assert!(SftpAdapter::new(&source, opts).is_err());
        source.password = Some("secret".into());
        assert!(SftpAdapter::new(&source, opts).is_ok());
    }
}
