//! Bounded on-disk content cache with coalesced fetch-through.
//!
//! Content lives under `{root}/{namespace}/{shard}/{key-hash}` with a
//! versioned JSON index at the root, reloaded on startup so a restart never
//! re-fetches content that is already present.  Concurrent misses for the
//! same key attach to one in-flight upstream fetch and all receive its
//! result, success or error alike.  Before a fetched entry is committed,
//! least-recently-used entries are evicted (ties broken by oldest
//! `created_at`) until it fits; an entry larger than the whole cache is
//! rejected outright and never partially stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheConfig;
use crate::error::TransferError;

pub const CACHE_INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = "cache-index.json";
const STAGING_DIR: &str = ".staging";

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Backing file, relative to the cache root.
    pub rel_path: String,
    pub size: u64,
    /// Source namespace the key belongs to (e.g. `pypi`, `npm`, `docker`).
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Entry TTL in seconds; `None` never expires.
    pub ttl_secs: Option<u64>,
}

impl CacheEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            Some(ttl) => now - self.created_at > chrono::Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

/// What `ensure` hands back: the committed backing file.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub path: PathBuf,
    pub size: u64,
    pub namespace: String,
}

type FetchOutcome = Result<CachedObject, TransferError>;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub expired: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanReport {
    pub removed: usize,
    pub bytes_freed: u64,
}

// ---------------------------------------------------------------------------
// Upstream fetcher
// ---------------------------------------------------------------------------

/// Upstream transfer used on a cache miss.  Injectable so the coalescing
/// and eviction machinery is testable without a network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TransferError>;
}

/// Default fetcher: plain HTTP GET streamed to disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(fetch_timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("mirrorcache/0.1")
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TransferError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;
        if !resp.status().is_success() {
            return Err(TransferError::from_http_status(
                resp.status().as_u16(),
                &format!("GET {url}"),
            ));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
        let mut transferred = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::from_reqwest(&e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::from_io(&e))?;
            transferred += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| TransferError::from_io(&e))?;
        Ok(transferred)
    }
}

// ---------------------------------------------------------------------------
// Index persistence
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct CacheIndex {
    schema_version: u32,
    entries: Vec<CacheEntry>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    expired: u64,
    /// Rolling miss frequency per URL, drained by the prewarm popularity
    /// scan.
    miss_counts: HashMap<String, u64>,
}

pub struct CacheManager {
    root: PathBuf,
    max_bytes: u64,
    default_ttl_secs: Option<u64>,
    state: Mutex<CacheState>,
    /// Keyed table of in-flight fetches; waiters clone the receiver.
    inflight: tokio::sync::Mutex<HashMap<String, watch::Receiver<Option<FetchOutcome>>>>,
    fetcher: Box<dyn Fetcher>,
}

impl CacheManager {
    /// Open the cache, reloading the persisted index.  Index entries whose
    /// backing file has vanished are dropped.
    pub fn open(config: &CacheConfig, fetcher: Box<dyn Fetcher>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("failed to create cache dir: {}", config.dir.display()))?;
        std::fs::create_dir_all(config.dir.join(STAGING_DIR))
            .context("failed to create cache staging dir")?;

        let mut entries = HashMap::new();
        let mut total_bytes = 0u64;
        let index_path = config.dir.join(INDEX_FILE);
        if index_path.exists() {
            let contents = std::fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read cache index: {}", index_path.display()))?;
            let index: CacheIndex = serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse cache index: {}", index_path.display()))?;
            anyhow::ensure!(
                index.schema_version <= CACHE_INDEX_VERSION,
                "cache index schema version {} is newer than supported {}",
                index.schema_version,
                CACHE_INDEX_VERSION
            );
            for entry in index.entries {
                if config.dir.join(&entry.rel_path).is_file() {
                    total_bytes += entry.size;
                    entries.insert(entry.key.clone(), entry);
                } else {
                    debug!(key = %entry.key, "dropping index entry with missing backing file");
                }
            }
        }

        info!(
            entries = entries.len(),
            total_bytes,
            max_bytes = config.max_bytes,
            "cache opened"
        );

        Ok(Self {
            root: config.dir.clone(),
            max_bytes: config.max_bytes,
            default_ttl_secs: (config.default_ttl_secs > 0).then_some(config.default_ttl_secs),
            state: Mutex::new(CacheState {
                entries,
                total_bytes,
                hits: 0,
                misses: 0,
                expired: 0,
                miss_counts: HashMap::new(),
            }),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            fetcher,
        })
    }

    // -----------------------------------------------------------------------
    // ensure
    // -----------------------------------------------------------------------

    /// Return the cached content for `key`, fetching `url` through the
    /// coalescing path on a miss.
    pub async fn ensure(
        &self,
        key: &str,
        namespace: &str,
        url: &str,
    ) -> Result<CachedObject, TransferError> {
        self.ensure_with_ttl(key, namespace, url, self.default_ttl_secs)
            .await
    }

    #[instrument(skip(self))]
    pub async fn ensure_with_ttl(
        &self,
        key: &str,
        namespace: &str,
        url: &str,
        ttl_secs: Option<u64>,
    ) -> Result<CachedObject, TransferError> {
        loop {
            // Hit path: bump bookkeeping and hand back the backing file.
            if let Some(object) = self.try_hit(key, url) {
                return Ok(object);
            }

            // Miss: attach to an in-flight fetch for this key, or lead one.
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(key) {
                let mut rx = rx.clone();
                drop(inflight);

                // The leader sends exactly once, then the channel closes.
                if rx.changed().await.is_err() && rx.borrow().is_none() {
                    return Err(TransferError::Connection(
                        "in-flight fetch aborted without a result".into(),
                    ));
                }
                let outcome = rx.borrow().clone();
                match outcome {
                    Some(result) => return result,
                    // Spurious wake without a value; retry from the top.
                    None => continue,
                }
            }

            let (tx, rx) = watch::channel(None);
            inflight.insert(key.to_string(), rx);
            drop(inflight);

            let outcome = self.lead_fetch(key, namespace, url, ttl_secs).await;

            // Publish before dropping the in-flight slot: waiters that
            // attached while we fetched read the channel, later arrivals
            // hit the committed entry.
            let _ = tx.send(Some(outcome.clone()));
            self.inflight.lock().await.remove(key);
            return outcome;
        }
    }

    /// Hit bookkeeping; expired entries are dropped and counted.
    fn try_hit(&self, key: &str, url: &str) -> Option<CachedObject> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("cache state poisoned");

        let is_expired = state
            .entries
            .get(key)
            .map(|entry| entry.expired(now))
            .unwrap_or(false);
        if is_expired {
            let stale = state.entries.remove(key).expect("entry just observed");
            state.total_bytes = state.total_bytes.saturating_sub(stale.size);
            state.expired += 1;
            let path = self.root.join(&stale.rel_path);
            // Removal is best-effort; a reopened index would drop it too.
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove expired entry");
                }
            }
        }

        let object = state.entries.get_mut(key).map(|entry| {
            entry.last_accessed_at = now;
            entry.access_count += 1;
            CachedObject {
                path: self.root.join(&entry.rel_path),
                size: entry.size,
                namespace: entry.namespace.clone(),
            }
        });

        match object {
            Some(object) => {
                state.hits += 1;
                Some(object)
            }
            None => {
                state.misses += 1;
                *state.miss_counts.entry(url.to_string()).or_default() += 1;
                None
            }
        }
    }

    /// The single upstream fetch for a key: download to staging, make room,
    /// commit, index.
    async fn lead_fetch(
        &self,
        key: &str,
        namespace: &str,
        url: &str,
        ttl_secs: Option<u64>,
    ) -> FetchOutcome {
        let key_hash = hash_key(key);
        let staging = self.root.join(STAGING_DIR).join(&key_hash);

        if let Err(e) = self.fetcher.fetch(url, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(&staging)
            .await
            .map(|m| m.len())
            .map_err(|e| TransferError::from_io(&e))?;

        if size > self.max_bytes {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TransferError::Capacity(format!(
                "entry of {size} bytes exceeds cache capacity of {} bytes",
                self.max_bytes
            )));
        }

        // Make room, then commit.  Victim files are deleted outside the
        // state lock.
        let victims = {
            let mut state = self.state.lock().expect("cache state poisoned");
            let mut victims = Vec::new();
            if state.total_bytes + size > self.max_bytes {
                let needed = state.total_bytes + size - self.max_bytes;
                let mut freed = 0u64;
                for victim_key in eviction_order(&state.entries) {
                    if freed >= needed {
                        break;
                    }
                    let victim = state
                        .entries
                        .remove(&victim_key)
                        .expect("ordered key exists");
                    state.total_bytes = state.total_bytes.saturating_sub(victim.size);
                    freed += victim.size;
                    victims.push(victim);
                }
            }
            victims
        };
        for victim in &victims {
            let path = self.root.join(&victim.rel_path);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove evicted entry");
                }
            }
            debug!(key = %victim.key, size = victim.size, "evicted");
        }

        let rel_path = format!("{namespace}/{}/{}", &key_hash[..2], key_hash);
        let final_path = self.root.join(&rel_path);
        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(TransferError::from_io(&e));
            }
        }
        if let Err(e) = tokio::fs::rename(&staging, &final_path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TransferError::from_io(&e));
        }

        let now = Utc::now();
        {
            let mut state = self.state.lock().expect("cache state poisoned");
            if let Some(old) = state.entries.insert(
                key.to_string(),
                CacheEntry {
                    key: key.to_string(),
                    rel_path: rel_path.clone(),
                    size,
                    namespace: namespace.to_string(),
                    created_at: now,
                    last_accessed_at: now,
                    access_count: 1,
                    ttl_secs,
                },
            ) {
                state.total_bytes = state.total_bytes.saturating_sub(old.size);
            }
            state.total_bytes += size;
        }
        self.persist_index();

        debug!(key, size, evicted = victims.len(), "cache entry committed");
        Ok(CachedObject {
            path: final_path,
            size,
            namespace: namespace.to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance operations
    // -----------------------------------------------------------------------

    /// Whether `key` is present and unexpired, without touching access
    /// bookkeeping.  Used by the prewarm queue to skip warm entries.
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().expect("cache state poisoned");
        state
            .entries
            .get(key)
            .map(|e| !e.expired(Utc::now()))
            .unwrap_or(false)
    }

    /// Remove entries whose key contains `pattern` and/or that were last
    /// accessed more than `older_than` ago.
    pub fn clean(
        &self,
        pattern: Option<&str>,
        older_than: Option<chrono::Duration>,
    ) -> CleanReport {
        let now = Utc::now();
        let removed: Vec<CacheEntry> = {
            let mut state = self.state.lock().expect("cache state poisoned");
            let keys: Vec<String> = state
                .entries
                .values()
                .filter(|entry| {
                    let matches_pattern =
                        pattern.map(|p| entry.key.contains(p)).unwrap_or(true);
                    let matches_age = older_than
                        .map(|age| now - entry.last_accessed_at > age)
                        .unwrap_or(true);
                    matches_pattern && matches_age
                })
                .map(|entry| entry.key.clone())
                .collect();

            keys.into_iter()
                .filter_map(|key| {
                    let entry = state.entries.remove(&key)?;
                    state.total_bytes = state.total_bytes.saturating_sub(entry.size);
                    Some(entry)
                })
                .collect()
        };

        let mut bytes_freed = 0u64;
        for entry in &removed {
            bytes_freed += entry.size;
            let path = self.root.join(&entry.rel_path);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove cleaned entry");
                }
            }
        }
        self.persist_index();

        info!(removed = removed.len(), bytes_freed, "cache clean");
        CleanReport {
            removed: removed.len(),
            bytes_freed,
        }
    }

    /// Remove everything, reporting the previous totals.
    pub fn clear(&self) -> CleanReport {
        self.clean(None, None)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache state poisoned");
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.max_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            expired: state.expired,
        }
    }

    /// Drain the rolling miss-frequency table, returning the `top_n` most
    /// frequently missed URLs.  Feeds the prewarm popularity scan.
    pub fn take_top_missed(&self, top_n: usize) -> Vec<(String, u64)> {
        let mut state = self.state.lock().expect("cache state poisoned");
        let mut missed: Vec<(String, u64)> = state.miss_counts.drain().collect();
        missed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        missed.truncate(top_n);
        missed
    }

    /// Write the index; failures are logged, not fatal, since the index can
    /// be rebuilt from a later save.
    fn persist_index(&self) {
        let index = {
            let state = self.state.lock().expect("cache state poisoned");
            CacheIndex {
                schema_version: CACHE_INDEX_VERSION,
                entries: state.entries.values().cloned().collect(),
            }
        };
        let path = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        let result = serde_json::to_string(&index)
            .map_err(std::io::Error::other)
            .and_then(|contents| std::fs::write(&tmp, contents))
            .and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist cache index");
        }
    }

    #[cfg(test)]
    fn set_entry_times(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        last_accessed_at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().expect("cache state poisoned");
        if let Some(entry) = state.entries.get_mut(key) {
            entry.created_at = created_at;
            entry.last_accessed_at = last_accessed_at;
        }
    }
}

/// Keys in eviction order: least recently used first, ties broken by
/// oldest creation time.
fn eviction_order(entries: &HashMap<String, CacheEntry>) -> Vec<String> {
    let mut order: Vec<(&String, DateTime<Utc>, DateTime<Utc>)> = entries
        .values()
        .map(|e| (&e.key, e.last_accessed_at, e.created_at))
        .collect();
    order.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));
    order.into_iter().map(|(key, _, _)| key.clone()).collect()
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scripted fetcher: serves `url.len()`-independent content of a size
    /// encoded in the URL (`mem://<size>/<tag>`), counting invocations.
    struct MemFetcher {
        calls: AtomicU32,
        fail: bool,
        delay: Option<std::time::Duration>,
    }

    impl MemFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: false,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Fetcher for MemFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(TransferError::Connection("upstream down".into()));
            }
            let size: usize = url
                .strip_prefix("mem://")
                .and_then(|rest| rest.split('/').next())
                .and_then(|s| s.parse().ok())
                .unwrap_or(16);
            tokio::fs::write(dest, vec![0xAB; size])
                .await
                .map_err(|e| TransferError::from_io(&e))?;
            Ok(size as u64)
        }
    }

    fn cache_with(
        dir: &Path,
        max_bytes: u64,
        fetcher: Box<dyn Fetcher>,
    ) -> CacheManager {
        let config = CacheConfig {
            dir: dir.to_path_buf(),
            max_bytes,
            default_ttl_secs: 0,
        };
        CacheManager::open(&config, fetcher).unwrap()
    }

    #[tokio::test]
    async fn hit_after_miss_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), 1024, Box::new(MemFetcher::new()));

        let first = cache.ensure("k1", "pypi", "mem://100/k1").await.unwrap();
        assert_eq!(first.size, 100);
        assert!(first.path.is_file());

        let second = cache.ensure("k1", "pypi", "mem://100/k1").await.unwrap();
        assert_eq!(second.path, first.path);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn size_never_exceeds_max_after_insert() {
        let dir = tempfile::tempdir().unwrap();
        // 100 MB cache, in miniature: 100 bytes.
        let cache = cache_with(dir.path(), 100, Box::new(MemFetcher::new()));

        cache.ensure("a", "ns", "mem://60/a").await.unwrap();
        assert_eq!(cache.stats().total_bytes, 60);

        cache.ensure("b", "ns", "mem://60/b").await.unwrap();
        let stats = cache.stats();
        assert!(stats.total_bytes <= 100, "cache over budget: {stats:?}");
        // The first entry was the only eviction candidate.
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[tokio::test]
    async fn oversized_entry_rejected_not_partially_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), 100, Box::new(MemFetcher::new()));

        let err = cache.ensure("huge", "ns", "mem://500/huge").await;
        assert!(matches!(err, Err(TransferError::Capacity(_))));
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);
        // Nothing left in staging either.
        let staged: Vec<_> = std::fs::read_dir(dir.path().join(STAGING_DIR))
            .unwrap()
            .collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn lru_evicts_oldest_access_with_created_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), 100, Box::new(MemFetcher::new()));

        cache.ensure("a", "ns", "mem://30/a").await.unwrap();
        cache.ensure("b", "ns", "mem://30/b").await.unwrap();
        cache.ensure("c", "ns", "mem://30/c").await.unwrap();

        // Same last-access instant for all three; "a" is the oldest by
        // creation and must go first.
        let access = Utc::now();
        let t0 = access - chrono::Duration::seconds(30);
        cache.set_entry_times("a", t0, access);
        cache.set_entry_times("b", t0 + chrono::Duration::seconds(5), access);
        cache.set_entry_times("c", t0 + chrono::Duration::seconds(10), access);

        cache.ensure("d", "ns", "mem://30/d").await.unwrap();
        assert!(!cache.contains("a"), "LRU tie-break should evict 'a' first");
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert!(cache.stats().total_bytes <= 100);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MemFetcher::new();
        fetcher.delay = Some(std::time::Duration::from_millis(50));
        let fetcher = Arc::new(fetcher);

        struct Shared(Arc<MemFetcher>);
        #[async_trait]
        impl Fetcher for Shared {
            async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TransferError> {
                self.0.fetch(url, dest).await
            }
        }

        let cache = Arc::new(cache_with(
            dir.path(),
            4096,
            Box::new(Shared(Arc::clone(&fetcher))),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.ensure("shared", "ns", "mem://64/shared").await
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            let object = handle.await.unwrap().unwrap();
            paths.push(object.path);
        }

        assert_eq!(
            fetcher.calls.load(Ordering::SeqCst),
            1,
            "coalescing must collapse concurrent misses into one upstream fetch"
        );
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn coalesced_error_reaches_every_waiter_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MemFetcher::new();
        fetcher.fail = true;
        fetcher.delay = Some(std::time::Duration::from_millis(30));
        let cache = Arc::new(cache_with(dir.path(), 4096, Box::new(fetcher)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.ensure("broken", "ns", "mem://64/broken").await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(TransferError::Connection(_))));
        }
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn ttl_expiry_counts_and_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), 4096, Box::new(MemFetcher::new()));

        cache
            .ensure_with_ttl("k", "ns", "mem://32/k", Some(60))
            .await
            .unwrap();
        // Age the entry past its TTL.
        let past = Utc::now() - chrono::Duration::seconds(3600);
        cache.set_entry_times("k", past, past);
        assert!(!cache.contains("k"));

        cache
            .ensure_with_ttl("k", "ns", "mem://32/k", Some(60))
            .await
            .unwrap();
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn clean_by_pattern_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), 4096, Box::new(MemFetcher::new()));

        cache.ensure("pypi/requests", "pypi", "mem://10/r").await.unwrap();
        cache.ensure("pypi/flask", "pypi", "mem://20/f").await.unwrap();
        cache.ensure("npm/react", "npm", "mem://30/n").await.unwrap();

        let report = cache.clean(Some("pypi/"), None);
        assert_eq!(report.removed, 2);
        assert_eq!(report.bytes_freed, 30);
        assert!(cache.contains("npm/react"));

        let report = cache.clear();
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_freed, 30);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = cache_with(dir.path(), 4096, Box::new(MemFetcher::new()));
            cache.ensure("persist", "ns", "mem://42/p").await.unwrap();
        }

        let fetcher = MemFetcher::new();
        let cache = cache_with(dir.path(), 4096, Box::new(fetcher));
        assert!(cache.contains("persist"));
        let object = cache.ensure("persist", "ns", "mem://42/p").await.unwrap();
        assert_eq!(object.size, 42);
        // Served from disk, no upstream fetch.
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn miss_frequency_feeds_popularity_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MemFetcher::new();
        fetcher.fail = true;
        let cache = cache_with(dir.path(), 4096, Box::new(fetcher));

        for _ in 0..3 {
            let _ = cache.ensure("hot", "ns", "mem://1/hot").await;
        }
        let _ = cache.ensure("cold", "ns", "mem://1/cold").await;

        let top = cache.take_top_missed(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "mem://1/hot");
        assert_eq!(top[0].1, 3);
        // Drained: the table is rolling.
        assert!(cache.take_top_missed(5).is_empty());
    }
}
