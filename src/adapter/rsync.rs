//! rsync mirror adapter.
//!
//! Shells out to the system `rsync` binary via [`tokio::process::Command`]:
//! `--list-only --recursive` for listing, a per-file copy into a staging
//! path for fetching.  No delta transfer is attempted — a changed file is
//! re-transferred whole — and `--delete` is never passed; orphan removal is
//! the engine's decision.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{AdapterOptions, ProtocolAdapter, RemoteEntry};
use crate::config::SourceConfig;
use crate::error::TransferError;

pub struct RsyncAdapter {
    /// `[user@]host:path/` remote spec.
    remote: String,
    io_timeout_secs: u64,
}

impl RsyncAdapter {
    pub fn new(source: &SourceConfig, opts: AdapterOptions) -> Result<Self, TransferError> {
        let host = source
            .host
            .clone()
            .ok_or_else(|| TransferError::Validation("rsync source without host".into()))?;
        let path = source.path.clone().unwrap_or_else(|| "/".into());
        let host_part = match &source.username {
            Some(user) => format!("{user}@{host}"),
            None => host,
        };
        Ok(Self {
            remote: format!("{host_part}:{}/", path.trim_end_matches('/')),
            io_timeout_secs: opts.fetch_timeout.as_secs().max(1),
        })
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, TransferError> {
        let mut cmd = Command::new("rsync");
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd.output()
            .await
            .map_err(|e| TransferError::Connection(format!("failed to spawn rsync: {e}")))
    }
}

/// Map an rsync exit code onto the transfer taxonomy.
fn classify_exit(code: i32, stderr: &str) -> TransferError {
    let detail = format!("rsync exited {code}: {}", stderr.trim());
    match code {
        5 => TransferError::Auth(detail),
        23 | 24 => TransferError::NotFound(detail),
        10 | 12 | 30 | 35 | 255 => TransferError::Connection(detail),
        1 | 2 => TransferError::Validation(detail),
        _ => TransferError::Connection(detail),
    }
}

/// Parse `rsync --list-only` output.
///
/// Lines look like:
/// `-rw-r--r--          1,234 2024/05/01 12:30:45 pool/main/a.deb`
/// Directories (leading `d`) and specials are skipped.
pub(crate) fn parse_list_output(stdout: &str) -> Vec<RemoteEntry> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let Some(perms) = fields.next() else { continue };
        if !perms.starts_with('-') {
            continue;
        }
        let Some(size_str) = fields.next() else { continue };
        let Ok(size) = size_str.replace(',', "").parse::<u64>() else {
            continue;
        };
        let (Some(date), Some(time)) = (fields.next(), fields.next()) else {
            continue;
        };
        // Path is the remainder of the line, which may contain spaces.
        let prefix_len = line.find(time).map(|i| i + time.len()).unwrap_or(0);
        let raw_path = line[prefix_len..].trim();
        let Some(path) = super::sanitize_rel_path(raw_path) else {
            continue;
        };

        let mtime = NaiveDateTime::parse_from_str(
            &format!("{date} {time}"),
            "%Y/%m/%d %H:%M:%S",
        )
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));

        entries.push(RemoteEntry {
            path,
            size,
            mtime,
            hash: None,
        });
    }
    entries
}

#[async_trait]
impl ProtocolAdapter for RsyncAdapter {
    #[instrument(skip(self), fields(remote = %self.remote))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let args = vec![
            "--list-only".to_string(),
            "--recursive".to_string(),
            format!("--timeout={}", self.io_timeout_secs),
            self.remote.clone(),
        ];
        let output = self.run(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_exit(output.status.code().unwrap_or(-1), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let entries = parse_list_output(&stdout);
        debug!(count = entries.len(), "rsync listing complete");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(path = %entry.path))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        let staging = super::prepare_staging(dest).await?;

        let args = vec![
            "--times".to_string(),
            format!("--timeout={}", self.io_timeout_secs),
            format!("{}{}", self.remote, entry.path),
            staging.to_string_lossy().into_owned(),
        ];
        let output = self.run(&args).await?;

        if !output.status.success() {
            super::discard_staging(&staging).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_exit(output.status.code().unwrap_or(-1), &stderr));
        }

        let transferred = tokio::fs::metadata(&staging)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        super::commit_staging(&staging, dest).await?;
        debug!(bytes = transferred, "rsync fetch complete");
        Ok(transferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_output() {
        let stdout = "\
drwxr-xr-x          4,096 2024/05/01 12:00:00 .
-rw-r--r--          1,234 2024/05/01 12:30:45 Release
drwxr-xr-x          4,096 2024/05/01 12:00:00 pool
-rw-r--r--     12,345,678 2024/05/02 08:15:00 pool/main file.deb
";
        let entries = parse_list_output(stdout);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "Release");
        assert_eq!(entries[0].size, 1234);
        assert!(entries[0].mtime.is_some());
        assert_eq!(entries[1].path, "pool/main file.deb");
        assert_eq!(entries[1].size, 12_345_678);
    }

    #[test]
    fn exit_code_classification() {
        assert!(matches!(classify_exit(5, ""), TransferError::Auth(_)));
        assert!(matches!(classify_exit(23, ""), TransferError::NotFound(_)));
        assert!(matches!(classify_exit(30, ""), TransferError::Connection(_)));
        assert!(matches!(classify_exit(2, ""), TransferError::Validation(_)));
    }
}
