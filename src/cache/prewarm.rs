//! Cache prewarm queue.
//!
//! A priority queue of URLs expected to be popular, drained by a fixed pool
//! of background workers that fetch through [`CacheManager`]'s coalescing
//! path.  Ordering is (priority, enqueue order); a URL is never queued
//! twice while pending, and URLs already cached are skipped.  Outcomes land
//! in a bounded history ring.  A periodic popularity scan drains the cache
//! manager's miss-frequency table and enqueues the most frequently missed
//! URLs at elevated priority.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::manager::CacheManager;
use crate::config::PrewarmConfig;

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrewarmPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Fetching,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrewarmItem {
    pub url: String,
    /// Source namespace used for the cache entry (e.g. `pypi`, `npm`).
    pub namespace: String,
    pub priority: PrewarmPriority,
    pub status: ItemStatus,
    pub attempts: u32,
    pub added_at: DateTime<Utc>,
}

/// Heap ordering: highest priority first, oldest enqueue first within a
/// priority.
struct QueuedItem {
    priority: PrewarmPriority,
    seq: u64,
    item: PrewarmItem,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedItem {}
impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Completed-item record for the history ring.
#[derive(Debug, Clone, Serialize)]
pub struct PrewarmRecord {
    pub url: String,
    pub namespace: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PrewarmStats {
    pub queued: usize,
    pub fetching: usize,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct PrewarmState {
    heap: BinaryHeap<QueuedItem>,
    /// URLs currently queued or fetching; the dedupe set.
    pending_urls: HashSet<String>,
    fetching: usize,
    done: u64,
    failed: u64,
    skipped: u64,
    history: VecDeque<PrewarmRecord>,
    seq: u64,
}

pub struct PrewarmQueue {
    cache: Arc<CacheManager>,
    config: PrewarmConfig,
    state: Mutex<PrewarmState>,
    notify: Notify,
}

impl PrewarmQueue {
    pub fn new(cache: Arc<CacheManager>, config: PrewarmConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            config,
            state: Mutex::new(PrewarmState {
                heap: BinaryHeap::new(),
                pending_urls: HashSet::new(),
                fetching: 0,
                done: 0,
                failed: 0,
                skipped: 0,
                history: VecDeque::new(),
                seq: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Queue a URL for prewarming.  Returns false when it is already
    /// pending or already cached.
    pub fn enqueue(&self, url: &str, namespace: &str, priority: PrewarmPriority) -> bool {
        if self.cache.contains(url) {
            return false;
        }
        {
            let mut state = self.state.lock().expect("prewarm state poisoned");
            if !state.pending_urls.insert(url.to_string()) {
                return false;
            }
            state.seq += 1;
            let seq = state.seq;
            state.heap.push(QueuedItem {
                priority,
                seq,
                item: PrewarmItem {
                    url: url.to_string(),
                    namespace: namespace.to_string(),
                    priority,
                    status: ItemStatus::Queued,
                    attempts: 0,
                    added_at: Utc::now(),
                },
            });
        }
        debug!(url, ?priority, "prewarm enqueued");
        self.notify.notify_one();
        true
    }

    /// Drain the cache's miss-frequency table and enqueue the most
    /// frequently missed URLs at elevated priority.
    pub fn scan_popular(&self) -> usize {
        let top = self.cache.take_top_missed(self.config.popular_top_n);
        let mut enqueued = 0;
        for (url, misses) in top {
            if self.enqueue(&url, "popular", PrewarmPriority::High) {
                debug!(url, misses, "popularity scan enqueued");
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!(enqueued, "popularity scan complete");
        }
        enqueued
    }

    pub fn stats(&self) -> PrewarmStats {
        let state = self.state.lock().expect("prewarm state poisoned");
        PrewarmStats {
            queued: state.heap.len(),
            fetching: state.fetching,
            done: state.done,
            failed: state.failed,
            skipped: state.skipped,
        }
    }

    /// Most recent outcomes, newest last.
    pub fn history(&self, limit: usize) -> Vec<PrewarmRecord> {
        let state = self.state.lock().expect("prewarm state poisoned");
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Drop everything still queued.  Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let mut guard = self.state.lock().expect("prewarm state poisoned");
        let state = &mut *guard;
        let dropped = state.heap.len();
        for queued in state.heap.drain() {
            state.pending_urls.remove(&queued.item.url);
        }
        info!(dropped, "prewarm queue cleared");
        dropped
    }

    fn pop_next(&self) -> Option<PrewarmItem> {
        let mut state = self.state.lock().expect("prewarm state poisoned");
        let queued = state.heap.pop()?;
        state.fetching += 1;
        let mut item = queued.item;
        item.status = ItemStatus::Fetching;
        Some(item)
    }

    /// Process one dequeued item: skip if cached meanwhile, otherwise fetch
    /// through the coalescing path and record the outcome.
    async fn process(&self, mut item: PrewarmItem) {
        if self.cache.contains(&item.url) {
            let mut state = self.state.lock().expect("prewarm state poisoned");
            state.fetching -= 1;
            state.skipped += 1;
            state.pending_urls.remove(&item.url);
            return;
        }

        item.attempts += 1;
        let started = std::time::Instant::now();
        let result = self.cache.ensure(&item.url, &item.namespace, &item.url).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut state = self.state.lock().expect("prewarm state poisoned");
        state.fetching -= 1;
        match result {
            Ok(_) => {
                state.done += 1;
                state.pending_urls.remove(&item.url);
                push_history(
                    &mut state.history,
                    self.config.history_limit,
                    PrewarmRecord {
                        url: item.url,
                        namespace: item.namespace,
                        success: true,
                        error: None,
                        attempts: item.attempts,
                        duration_ms,
                        finished_at: Utc::now(),
                    },
                );
            }
            Err(e) if item.attempts < self.config.max_attempts => {
                // Re-queue at the back of its priority band.
                state.seq += 1;
                let seq = state.seq;
                debug!(url = %item.url, attempts = item.attempts, error = %e, "prewarm retrying");
                item.status = ItemStatus::Queued;
                state.heap.push(QueuedItem {
                    priority: item.priority,
                    seq,
                    item,
                });
                drop(state);
                self.notify.notify_one();
            }
            Err(e) => {
                warn!(url = %item.url, attempts = item.attempts, error = %e, "prewarm failed");
                state.failed += 1;
                state.pending_urls.remove(&item.url);
                push_history(
                    &mut state.history,
                    self.config.history_limit,
                    PrewarmRecord {
                        url: item.url,
                        namespace: item.namespace,
                        success: false,
                        error: Some(e.to_string()),
                        attempts: item.attempts,
                        duration_ms,
                        finished_at: Utc::now(),
                    },
                );
            }
        }
    }

    async fn run_worker(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            // The notified future must exist before the emptiness check or
            // an enqueue between check and await would be lost.
            let notified = self.notify.notified();
            if let Some(item) = self.pop_next() {
                self.process(item).await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = notified => {}
            }
        }
    }

    async fn run_popularity_scan(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = std::time::Duration::from_secs(self.config.scan_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.scan_popular();
                }
            }
        }
    }

    /// Spawn the worker pool and (when enabled) the popularity scan.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        for _ in 0..self.config.workers.max(1) {
            tokio::spawn(Arc::clone(self).run_worker(shutdown.clone()));
        }
        if self.config.scan_interval_secs > 0 {
            tokio::spawn(Arc::clone(self).run_popularity_scan(shutdown.clone()));
        }
        info!(workers = self.config.workers, "prewarm queue started");
    }
}

fn push_history(history: &mut VecDeque<PrewarmRecord>, limit: usize, record: PrewarmRecord) {
    history.push_back(record);
    while history.len() > limit.max(1) {
        history.pop_front();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
