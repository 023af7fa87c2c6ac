//! Git mirror adapter.
//!
//! Shells out to the system `git` binary.  A repository is one logical
//! entry: `list` digests `git ls-remote` output so the manifest sees a
//! stable content hash, and `fetch` either shallow-clones into a staging
//! directory (renamed into place) or fetches into the existing bare mirror.
//! Ref updates inside an existing repo are atomic on git's side, so no
//! partial artifact is ever visible at the final path.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ProtocolAdapter, RemoteEntry};
use crate::error::TransferError;

pub struct GitAdapter {
    url: String,
    repo_name: String,
}

impl GitAdapter {
    pub fn new(url: String) -> Self {
        let repo_name = repo_name_from_url(&url);
        Self { url, repo_name }
    }

    async fn run_git(&self, args: &[&str]) -> Result<std::process::Output, TransferError> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd.output()
            .await
            .map_err(|e| TransferError::Connection(format!("failed to spawn git: {e}")))
    }
}

/// Last path segment of the clone URL, `.git` suffix stripped.
pub(crate) fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repository");
    format!("{}.git", last.trim_end_matches(".git"))
}

fn classify_git_failure(stderr: &str) -> TransferError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
    {
        TransferError::Auth(stderr.trim().to_string())
    } else if lower.contains("not found") || lower.contains("does not exist") {
        TransferError::NotFound(stderr.trim().to_string())
    } else {
        TransferError::Connection(stderr.trim().to_string())
    }
}

/// Digest `git ls-remote` output into a single content hash.
///
/// Lines are `<oid>\t<refname>`; sorting makes the digest independent of
/// server-side orderings.
pub(crate) fn digest_refs(ls_remote_stdout: &str) -> String {
    let mut lines: Vec<&str> = ls_remote_stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[async_trait]
impl ProtocolAdapter for GitAdapter {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
        let output = self.run_git(&["ls-remote", &self.url]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let digest = digest_refs(&stdout);
        debug!(refs = stdout.lines().count(), "git ls-remote complete");

        Ok(vec![RemoteEntry {
            path: self.repo_name.clone(),
            size: 0,
            mtime: None,
            hash: Some(digest),
        }])
    }

    #[instrument(skip(self, _entry), fields(url = %self.url))]
    async fn fetch(&self, _entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
        if dest.join("HEAD").is_file() {
            // Existing bare mirror: fetch all refs in place.
            let dest_str = dest.to_string_lossy();
            let output = self
                .run_git(&[
                    "-C",
                    &dest_str,
                    "fetch",
                    "--prune",
                    "--force",
                    "--depth",
                    "1",
                    &self.url,
                    "+refs/*:refs/*",
                ])
                .await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(classify_git_failure(&stderr));
            }
            debug!("git fetch complete");
            return Ok(0);
        }

        // Fresh mirror: shallow-clone into a staging directory and rename.
        let staging = super::prepare_staging(dest).await?;
        if staging.exists() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        let staging_str = staging.to_string_lossy().into_owned();

        let output = self
            .run_git(&[
                "clone",
                "--bare",
                "--depth",
                "1",
                "--no-tags",
                &self.url,
                &staging_str,
            ])
            .await?;
        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure(&stderr));
        }

        tokio::fs::rename(&staging, dest)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
        debug!("git clone complete");
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_extraction() {
        assert_eq!(
            repo_name_from_url("https://github.com/torvalds/linux.git"),
            "linux.git"
        );
        assert_eq!(
            repo_name_from_url("https://git.example.com/mirrors/kernel/"),
            "kernel.git"
        );
        assert_eq!(repo_name_from_url("git@example.com:team/app"), "app.git");
    }

    #[test]
    fn ref_digest_is_order_independent() {
        let a = "abc\trefs/heads/main\ndef\trefs/tags/v1\n";
        let b = "def\trefs/tags/v1\nabc\trefs/heads/main\n";
        assert_eq!(digest_refs(a), digest_refs(b));
        assert_ne!(digest_refs(a), digest_refs("abc\trefs/heads/main\n"));
    }

    #[test]
    fn failure_classification() {
        assert!(matches!(
            classify_git_failure("fatal: Authentication failed for 'https://…'"),
            TransferError::Auth(_)
        ));
        assert!(matches!(
            classify_git_failure("fatal: repository 'x' not found"),
            TransferError::NotFound(_)
        ));
        assert!(matches!(
            classify_git_failure("fatal: unable to access: Could not resolve host"),
            TransferError::Connection(_)
        ));
    }
}
