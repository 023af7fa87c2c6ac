//! One sync pass for one source.
//!
//! The engine owns no long-lived state: it is handed an adapter, a target
//! directory, and a task record, runs the
//! list → diff → fetch-pool → manifest-update pipeline once, and reports
//! the outcome.  Entry-level failures are tolerated and aggregated; only a
//! `list()` failure aborts the pass.  A stop request is honored between
//! fetch units, never mid-transfer, and the atomic staging discipline in
//! the adapters guarantees no partial file is ever visible.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{ProtocolAdapter, RemoteEntry};
use crate::error::TransferError;
use crate::health::HealthMonitor;
use crate::manifest::{hash_file, Manifest, ManifestEntry};
use crate::sync::task::{SyncTask, TaskStatus};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Fetch worker pool size for this pass.
    pub workers: usize,
    /// Attempts per entry for transient failures.
    pub retry_attempts: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_base_delay: Duration,
    /// Delete local files with no remote counterpart.
    pub mirror_delete: bool,
}

impl EngineOptions {
    pub fn from_config(config: &crate::config::ConcurrencyConfig, mirror_delete: bool) -> Self {
        Self {
            workers: config.fetch_workers.max(1),
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            mirror_delete,
        }
    }
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Run one pass.  The caller holds the source's exclusive run slot; this
/// function never runs twice concurrently for the same source.
pub async fn run_pass(
    source_name: &str,
    target_dir: &Path,
    adapter: Arc<dyn ProtocolAdapter>,
    options: EngineOptions,
    cancel: CancellationToken,
    task: Arc<Mutex<SyncTask>>,
    health: Option<Arc<HealthMonitor>>,
) -> TaskStatus {
    task.lock().expect("task lock poisoned").mark_running();

    // A listing failure aborts the whole pass and flags the source.
    let remote = match adapter.list().await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(source = source_name, error = %e, "listing failed, aborting pass");
            if let Some(ref health) = health {
                health.record_failure(source_name, &e.to_string());
            }
            let mut t = task.lock().expect("task lock poisoned");
            t.mark_failed(format!("list failed: {e}"));
            return TaskStatus::Failed;
        }
    };

    let mut manifest = match Manifest::load(target_dir) {
        Ok(m) => m,
        Err(e) => {
            let mut t = task.lock().expect("task lock poisoned");
            t.mark_failed(format!("manifest load failed: {e}"));
            return TaskStatus::Failed;
        }
    };

    let plan = manifest.diff(&remote);
    {
        let mut t = task.lock().expect("task lock poisoned");
        t.counts.total = remote.len() as u64;
        t.counts.unchanged = plan.unchanged.len() as u64;
    }
    debug!(
        source = source_name,
        total = remote.len(),
        unchanged = plan.unchanged.len(),
        pending = plan.pending.len(),
        orphans = plan.orphans.len(),
        "pass classified"
    );

    // Orphans are destructive; only the explicit opt-in touches them.
    if options.mirror_delete && !plan.orphans.is_empty() {
        let deleted = delete_orphans(target_dir, &plan.orphans, &mut manifest).await;
        if deleted > 0 {
            if let Err(e) = manifest.save(target_dir) {
                warn!(source = source_name, error = %e, "manifest save after orphan removal failed");
            }
        }
        task.lock().expect("task lock poisoned").counts.deleted = deleted;
    } else if !plan.orphans.is_empty() {
        debug!(
            source = source_name,
            orphans = plan.orphans.len(),
            "orphans retained (mirror_delete disabled)"
        );
    }

    // Fetch pool.  Workers check the cancel flag before starting each unit;
    // in-flight transfers run to completion.
    let semaphore = Arc::new(Semaphore::new(options.workers));
    let mut pool: JoinSet<(RemoteEntry, Result<(u64, Option<String>), TransferError>)> =
        JoinSet::new();

    let pending_total = plan.pending.len();
    for entry in plan.pending {
        let adapter = Arc::clone(&adapter);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let task = Arc::clone(&task);
        let options = options.clone();
        let dest = target_dir.join(&entry.path);

        pool.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return (entry, Err(TransferError::Cancelled)),
            };
            if cancel.is_cancelled() {
                return (entry, Err(TransferError::Cancelled));
            }
            {
                let mut t = task.lock().expect("task lock poisoned");
                t.current_path = Some(entry.path.clone());
            }
            let result = fetch_entry(&*adapter, &entry, &dest, &options, &cancel).await;
            (entry, result)
        });
    }

    let mut completed_units = 0usize;
    while let Some(joined) = pool.join_next().await {
        let (entry, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(source = source_name, error = %e, "fetch worker panicked");
                continue;
            }
        };

        match result {
            Ok((bytes, hash)) => {
                completed_units += 1;
                let previously_known = manifest.entries.contains_key(&entry.path);
                manifest.record(ManifestEntry {
                    path: entry.path.clone(),
                    size: entry.size.max(bytes),
                    mtime: entry.mtime,
                    hash,
                    last_synced_at: Utc::now(),
                });
                // Persist immediately so a later crash cannot forget a
                // completed fetch.
                if let Err(e) = manifest.save(target_dir) {
                    warn!(source = source_name, error = %e, "manifest save failed");
                }
                let mut t = task.lock().expect("task lock poisoned");
                if previously_known {
                    t.counts.updated += 1;
                } else {
                    t.counts.added += 1;
                }
                t.bytes_transferred += bytes;
            }
            Err(TransferError::Cancelled) => {}
            Err(TransferError::NotFound(detail)) => {
                // The entry vanished between listing and fetch; not a pass
                // failure.
                completed_units += 1;
                debug!(source = source_name, path = %entry.path, detail, "remote entry vanished, skipped");
            }
            Err(e) => {
                completed_units += 1;
                let mut t = task.lock().expect("task lock poisoned");
                t.record_failure(&entry.path, e.to_string());
            }
        }
    }

    let status = {
        let mut t = task.lock().expect("task lock poisoned");
        t.current_path = None;
        if cancel.is_cancelled() && completed_units < pending_total {
            t.mark_cancelled();
        } else {
            t.mark_completed();
        }
        t.status
    };

    let t = task.lock().expect("task lock poisoned");
    info!(
        source = source_name,
        status = ?status,
        synced = t.counts.synced(),
        unchanged = t.counts.unchanged,
        deleted = t.counts.deleted,
        failed = t.counts.failed,
        bytes = t.bytes_transferred,
        duration_secs = t.duration_secs(),
        "pass finished"
    );

    status
}

/// Fetch one entry with retry-on-transient and post-fetch hashing.
async fn fetch_entry(
    adapter: &dyn ProtocolAdapter,
    entry: &RemoteEntry,
    dest: &Path,
    options: &EngineOptions,
    cancel: &CancellationToken,
) -> Result<(u64, Option<String>), TransferError> {
    let mut attempt = 0u32;
    let bytes = loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match adapter.fetch(entry, dest).await {
            Ok(bytes) => break bytes,
            Err(e) if e.is_transient() && attempt < options.retry_attempts => {
                let delay = options.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                debug!(path = %entry.path, attempt, error = %e, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    };

    // Prefer the identity the protocol already gave us; hash the payload
    // only when it changed and the listing carried none.
    let hash = match &entry.hash {
        Some(h) => Some(h.clone()),
        None => {
            let path: PathBuf = dest.to_path_buf();
            if tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                tokio::task::spawn_blocking(move || hash_file(&path).ok())
                    .await
                    .ok()
                    .flatten()
            } else {
                None
            }
        }
    };

    Ok((bytes, hash))
}

/// Remove orphaned files and their manifest records, returning how many
/// went away.
async fn delete_orphans(target_dir: &Path, orphans: &[String], manifest: &mut Manifest) -> u64 {
    let mut deleted = 0u64;
    for path in orphans {
        let Some(rel) = crate::adapter::sanitize_rel_path(path) else {
            continue;
        };
        let full = target_dir.join(&rel);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {
                manifest.remove(path);
                deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                manifest.remove(path);
                deleted += 1;
            }
            Err(e) => {
                warn!(path = %full.display(), error = %e, "orphan removal failed");
            }
        }
    }
    deleted
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory adapter with fetch counting and scripted failures.
    struct FakeAdapter {
        files: BTreeMap<String, Vec<u8>>,
        fetch_count: AtomicU32,
        /// Path → number of times it fails transiently before succeeding.
        flaky: Mutex<BTreeMap<String, u32>>,
        /// Paths that always fail with an auth error.
        denied: Vec<String>,
        /// Cancel this token once `fetch_count` reaches the limit.
        cancel_after: Option<(u32, CancellationToken)>,
    }

    impl FakeAdapter {
        fn new(files: BTreeMap<String, Vec<u8>>) -> Self {
            Self {
                files,
                fetch_count: AtomicU32::new(0),
                flaky: Mutex::new(BTreeMap::new()),
                denied: Vec::new(),
                cancel_after: None,
            }
        }

        fn fetches(&self) -> u32 {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProtocolAdapter for FakeAdapter {
        async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
            Ok(self
                .files
                .iter()
                .map(|(path, data)| RemoteEntry {
                    path: path.clone(),
                    size: data.len() as u64,
                    mtime: None,
                    hash: None,
                })
                .collect())
        }

        async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64, TransferError> {
            let count = self.fetch_count.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, ref token)) = self.cancel_after {
                if count >= limit {
                    token.cancel();
                }
            }

            if self.denied.contains(&entry.path) {
                return Err(TransferError::Auth("credentials rejected".into()));
            }
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(remaining) = flaky.get_mut(&entry.path) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(TransferError::Connection("flaky".into()));
                    }
                }
            }

            let data = self
                .files
                .get(&entry.path)
                .ok_or_else(|| TransferError::NotFound(entry.path.clone()))?;

            let staging = crate::adapter::prepare_staging(dest).await?;
            tokio::fs::write(&staging, data)
                .await
                .map_err(|e| TransferError::from_io(&e))?;
            crate::adapter::commit_staging(&staging, dest).await?;
            Ok(data.len() as u64)
        }
    }

    fn options() -> EngineOptions {
        EngineOptions {
            workers: 4,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            mirror_delete: false,
        }
    }

    async fn run(
        adapter: Arc<FakeAdapter>,
        target: &Path,
        opts: EngineOptions,
        cancel: CancellationToken,
    ) -> (TaskStatus, SyncTask) {
        let task = Arc::new(Mutex::new(SyncTask::new("test")));
        let status = run_pass(
            "test",
            target,
            adapter,
            opts,
            cancel,
            Arc::clone(&task),
            None,
        )
        .await;
        let snapshot = task.lock().unwrap().clone();
        (status, snapshot)
    }

    fn corpus(n: usize) -> BTreeMap<String, Vec<u8>> {
        (0..n)
            .map(|i| (format!("pool/file-{i:03}.bin"), vec![i as u8; 64 + i]))
            .collect()
    }

    #[tokio::test]
    async fn rerun_without_changes_fetches_nothing() {
        let target = tempfile::tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter::new(corpus(12)));

        let (status, t) = run(
            Arc::clone(&adapter),
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(t.counts.added, 12);
        let after_first = adapter.fetches();

        let (status, t) = run(
            Arc::clone(&adapter),
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(t.counts.unchanged, 12);
        assert_eq!(t.counts.synced(), 0);
        assert_eq!(adapter.fetches(), after_first, "idempotent rerun refetched");
    }

    #[tokio::test]
    async fn hundred_file_pass_reconciles() {
        let target = tempfile::tempdir().unwrap();

        // Seed 15 files, then change 5 of them and add 85 more: the second
        // pass must see 10 unchanged, 5 changed, 85 new.
        let mut files = corpus(15);
        let adapter = Arc::new(FakeAdapter::new(files.clone()));
        let (status, _) = run(
            adapter,
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(status, TaskStatus::Completed);

        for i in 0..5 {
            files.insert(format!("pool/file-{i:03}.bin"), vec![0xFF; 999 + i]);
        }
        for i in 15..100 {
            files.insert(format!("pool/file-{i:03}.bin"), vec![i as u8; 64 + i]);
        }
        let adapter = Arc::new(FakeAdapter::new(files));
        let (status, t) = run(
            adapter,
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(t.counts.total, 100);
        assert_eq!(t.counts.unchanged, 10);
        assert_eq!(t.counts.updated, 5);
        assert_eq!(t.counts.added, 85);
        assert_eq!(t.counts.synced(), 90);
        assert_eq!(t.counts.synced() + t.counts.unchanged, 100);
    }

    #[tokio::test]
    async fn entry_failures_do_not_abort_the_pass() {
        let target = tempfile::tempdir().unwrap();
        let mut adapter = FakeAdapter::new(corpus(6));
        adapter.denied.push("pool/file-002.bin".to_string());
        let adapter = Arc::new(adapter);

        let (status, t) = run(
            adapter,
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(t.counts.added, 5);
        assert_eq!(t.counts.failed, 1);
        assert_eq!(t.failures.len(), 1);
        assert_eq!(t.failures[0].path, "pool/file-002.bin");
        // The failed entry never reached the manifest.
        let manifest = Manifest::load(target.path()).unwrap();
        assert!(!manifest.entries.contains_key("pool/file-002.bin"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let target = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(corpus(3));
        adapter
            .flaky
            .lock()
            .unwrap()
            .insert("pool/file-001.bin".to_string(), 2);
        let adapter = Arc::new(adapter);

        let (status, t) = run(
            Arc::clone(&adapter),
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(t.counts.added, 3);
        assert_eq!(t.counts.failed, 0);
        // 3 entries plus 2 retries.
        assert_eq!(adapter.fetches(), 5);
    }

    #[tokio::test]
    async fn retries_exhaust_into_failure() {
        let target = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(corpus(2));
        adapter
            .flaky
            .lock()
            .unwrap()
            .insert("pool/file-000.bin".to_string(), 99);
        let adapter = Arc::new(adapter);

        let (status, t) = run(
            adapter,
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(t.counts.added, 1);
        assert_eq!(t.counts.failed, 1);
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_work_and_no_partials() {
        let target = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let mut adapter = FakeAdapter::new(corpus(100));
        // One worker, so fetches are strictly sequential and the 50th
        // transfer cancels the token before unit 51 starts.
        adapter.cancel_after = Some((50, token.clone()));
        let adapter = Arc::new(adapter);

        let mut opts = options();
        opts.workers = 1;
        let (status, t) = run(adapter, target.path(), opts, token).await;

        assert_eq!(status, TaskStatus::Cancelled);
        assert_eq!(t.counts.added, 50);
        assert!(t.counts.added < 100);

        // Completed entries are in the manifest; none of the rest are, and
        // no staging residue exists anywhere in the tree.
        let manifest = Manifest::load(target.path()).unwrap();
        assert_eq!(manifest.entries.len(), 50);
        for item in walkdir::WalkDir::new(target.path()) {
            let item = item.unwrap();
            let name = item.file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".part"), "partial file left behind: {name}");
        }
    }

    #[tokio::test]
    async fn orphans_removed_only_with_mirror_delete() {
        let target = tempfile::tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter::new(corpus(4)));
        run(
            Arc::clone(&adapter),
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;

        // Remote shrinks to 2 files.
        let shrunk: BTreeMap<String, Vec<u8>> = corpus(2);
        let adapter = Arc::new(FakeAdapter::new(shrunk.clone()));
        let (_, t) = run(
            Arc::clone(&adapter),
            target.path(),
            options(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(t.counts.deleted, 0);
        assert!(target.path().join("pool/file-003.bin").exists());

        let adapter = Arc::new(FakeAdapter::new(shrunk));
        let mut opts = options();
        opts.mirror_delete = true;
        let (_, t) = run(adapter, target.path(), opts, CancellationToken::new()).await;
        assert_eq!(t.counts.deleted, 2);
        assert!(!target.path().join("pool/file-003.bin").exists());
        let manifest = Manifest::load(target.path()).unwrap();
        assert_eq!(manifest.entries.len(), 2);
    }

    #[tokio::test]
    async fn list_failure_fails_the_pass() {
        struct BrokenList;
        #[async_trait]
        impl ProtocolAdapter for BrokenList {
            async fn list(&self) -> Result<Vec<RemoteEntry>, TransferError> {
                Err(TransferError::Connection("index unreachable".into()))
            }
            async fn fetch(&self, _: &RemoteEntry, _: &Path) -> Result<u64, TransferError> {
                unreachable!("fetch must not run when listing fails")
            }
        }

        let target = tempfile::tempdir().unwrap();
        let task = Arc::new(Mutex::new(SyncTask::new("test")));
        let status = run_pass(
            "test",
            target.path(),
            Arc::new(BrokenList),
            options(),
            CancellationToken::new(),
            Arc::clone(&task),
            None,
        )
        .await;
        assert_eq!(status, TaskStatus::Failed);
        assert!(task.lock().unwrap().error.as_ref().unwrap().contains("list failed"));
    }
}
