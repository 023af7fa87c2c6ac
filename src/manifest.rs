//! Per-target sync manifest.
//!
//! The manifest is the sole source of truth for "is this file already
//! synced" — the engine never trusts filesystem mtimes without it.  One
//! manifest lives inside each target directory as a versioned JSON document,
//! written via temp-file + atomic rename so a crash never leaves a torn
//! manifest behind.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapter::RemoteEntry;

/// Bumped whenever the on-disk layout changes shape.
pub const MANIFEST_VERSION: u32 = 1;

/// File name of the manifest inside a target directory.
pub const MANIFEST_FILE: &str = ".mirrorcache-manifest.json";

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Record of one previously synced file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    /// Path relative to the target directory.
    pub path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    /// SHA-256 of the content, hex-encoded.  Recomputed only when size or
    /// mtime changed, never on every pass.
    pub hash: Option<String>,
    pub last_synced_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Diff result
// ---------------------------------------------------------------------------

/// Classification of one sync pass before any bytes move.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Remote entries whose manifest record still matches.
    pub unchanged: Vec<RemoteEntry>,
    /// New or changed remote entries that need fetching.
    pub pending: Vec<RemoteEntry>,
    /// Manifest paths with no remote counterpart.  Deleted only when the
    /// source's mirror-delete flag is enabled.
    pub orphans: Vec<String>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Manifest {
    fn file_path(target_dir: &Path) -> PathBuf {
        target_dir.join(MANIFEST_FILE)
    }

    /// Load the manifest for `target_dir`.  A missing file yields an empty
    /// manifest; a manifest written by a newer version is an error rather
    /// than silently reinterpreted.
    pub fn load(target_dir: &Path) -> Result<Self> {
        let path = Self::file_path(target_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse manifest: {}", path.display()))?;
        anyhow::ensure!(
            manifest.schema_version <= MANIFEST_VERSION,
            "manifest {} has schema version {} but this build understands up to {}",
            path.display(),
            manifest.schema_version,
            MANIFEST_VERSION
        );
        Ok(manifest)
    }

    /// Persist the manifest atomically into `target_dir`.
    pub fn save(&self, target_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(target_dir)
            .with_context(|| format!("failed to create target dir: {}", target_dir.display()))?;
        let path = Self::file_path(target_dir);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self).context("failed to encode manifest")?;
        std::fs::write(&tmp, contents)
            .with_context(|| format!("failed to write manifest temp file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to commit manifest: {}", path.display()))?;
        Ok(())
    }

    /// Record a successful fetch.
    pub fn record(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    /// Classify remote entries against the manifest.
    pub fn diff(&self, remote: &[RemoteEntry]) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let mut seen = std::collections::HashSet::with_capacity(remote.len());

        for entry in remote {
            seen.insert(entry.path.as_str());
            match self.entries.get(&entry.path) {
                Some(known) if !entry_changed(known, entry) => {
                    plan.unchanged.push(entry.clone());
                }
                _ => plan.pending.push(entry.clone()),
            }
        }

        for path in self.entries.keys() {
            if !seen.contains(path.as_str()) {
                plan.orphans.push(path.clone());
            }
        }

        plan
    }
}

/// Whether a remote entry differs from its manifest record.
///
/// Size is the primary signal; mtime uses a one-second slack to absorb
/// filesystems and protocols with coarser timestamps.  Hashes are compared
/// only when both sides carry one.
fn entry_changed(known: &ManifestEntry, remote: &RemoteEntry) -> bool {
    if known.size != remote.size {
        return true;
    }
    if let (Some(known_hash), Some(remote_hash)) = (&known.hash, &remote.hash) {
        return known_hash != remote_hash;
    }
    if let (Some(known_mtime), Some(remote_mtime)) = (known.mtime, remote.mtime) {
        let delta = (remote_mtime - known_mtime).num_seconds().abs();
        return delta > 1;
    }
    false
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// SHA-256 of a file's content, hex-encoded.  Blocking; callers on the
/// async runtime wrap this in `spawn_blocking`.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
