//! Per-source sync orchestration.
//!
//! The scheduler owns the source registry and a per-source state machine
//! (`idle → running → idle`, `running → stopping → idle` on a stop request,
//! `idle → error` on an aborted pass, recoverable by the next successful
//! trigger).  A global semaphore bounds concurrent passes across all
//! sources.  Trigger evaluation is driven by `tick(now)` against the pure
//! schedule functions, so tests inject timestamps instead of sleeping.
//!
//! The registry is persisted as a versioned JSON document so sources added
//! at runtime survive a restart.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{build_adapter, AdapterOptions};
use crate::config::{validate_source, Config, ConcurrencyConfig, SourceConfig};
use crate::error::TransferError;
use crate::health::HealthMonitor;
use crate::sync::engine::{run_pass, EngineOptions};
use crate::sync::schedule::Schedule;
use crate::sync::task::{PassSummary, SyncTask, TaskStatus};

pub const REGISTRY_VERSION: u32 = 1;
const REGISTRY_FILE: &str = "sources.json";
const HISTORY_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Idle,
    Running,
    /// Stop requested; the engine acknowledges between fetch units.
    Stopping,
    /// The last pass aborted (listing or setup failure).  Recoverable by
    /// the next successful trigger.
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceTotals {
    pub passes: u64,
    pub files_synced: u64,
    pub bytes_transferred: u64,
}

struct SourceState {
    config: SourceConfig,
    schedule: Option<Schedule>,
    status: SourceStatus,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
    /// Current or most recent task.
    task: Option<Arc<Mutex<SyncTask>>>,
    history: VecDeque<PassSummary>,
    totals: SourceTotals,
}

impl SourceState {
    fn new(config: SourceConfig) -> Self {
        let schedule = parse_schedule(&config);
        Self {
            config,
            schedule,
            status: SourceStatus::Idle,
            last_sync: None,
            last_error: None,
            last_error_at: None,
            cancel: None,
            task: None,
            history: VecDeque::new(),
            totals: SourceTotals::default(),
        }
    }
}

fn parse_schedule(config: &SourceConfig) -> Option<Schedule> {
    let spec = config.schedule.as_deref()?;
    match Schedule::parse(spec) {
        Ok(schedule) => Some(schedule),
        Err(e) => {
            warn!(source = %config.name, error = %e, "ignoring unparseable schedule");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Derived progress figures for an in-flight task.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TaskProgress {
    pub percent: f64,
    pub throughput_bytes_per_sec: f64,
    pub eta_secs: Option<f64>,
}

/// Point-in-time view of one source for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub kind: &'static str,
    pub target: String,
    pub enabled: bool,
    pub auto_sync: bool,
    pub schedule: Option<String>,
    pub status: SourceStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub totals: SourceTotals,
    /// The in-flight (or most recent) task, with live counts.
    pub current_task: Option<SyncTask>,
    pub progress: Option<TaskProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: usize,
    pub sources: Vec<SourceInfo>,
}

// ---------------------------------------------------------------------------
// Registry persistence
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct SourceRegistry {
    schema_version: u32,
    sources: Vec<SourceConfig>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct SchedulerInner {
    base_dir: PathBuf,
    state_dir: PathBuf,
    concurrency: ConcurrencyConfig,
    adapter_opts: AdapterOptions,
    sources: RwLock<HashMap<String, SourceState>>,
    global_permits: Arc<Semaphore>,
    health: Arc<HealthMonitor>,
}

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    /// Build the scheduler: persisted registry first, then the config
    /// file's sources (config wins on a name collision).
    pub fn new(config: &Config, health: Arc<HealthMonitor>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.base_dir)?;
        std::fs::create_dir_all(&config.state_dir)?;

        let mut sources: HashMap<String, SourceState> = HashMap::new();

        let registry_path = config.state_dir.join(REGISTRY_FILE);
        if registry_path.exists() {
            let contents = std::fs::read_to_string(&registry_path)?;
            match serde_json::from_str::<SourceRegistry>(&contents) {
                Ok(registry) if registry.schema_version <= REGISTRY_VERSION => {
                    for source in registry.sources {
                        sources.insert(source.name.clone(), SourceState::new(source));
                    }
                }
                Ok(registry) => anyhow::bail!(
                    "source registry schema version {} is newer than supported {}",
                    registry.schema_version,
                    REGISTRY_VERSION
                ),
                Err(e) => warn!(error = %e, "source registry unreadable, starting fresh"),
            }
        }

        for source in &config.sources {
            sources.insert(source.name.clone(), SourceState::new(source.clone()));
        }

        for state in sources.values() {
            health.register(
                &state.config.name,
                state.config.probe_url().map(str::to_string),
                state.config.fallback_url.clone(),
            );
        }

        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                base_dir: config.base_dir.clone(),
                state_dir: config.state_dir.clone(),
                concurrency: config.concurrency.clone(),
                adapter_opts: AdapterOptions::from_config(&config.concurrency),
                sources: RwLock::new(sources),
                global_permits: Arc::new(Semaphore::new(
                    config.concurrency.max_concurrent_syncs.max(1),
                )),
                health,
            }),
        };
        scheduler.persist_registry();

        info!(
            sources = scheduler.inner.sources.read().expect("sources lock").len(),
            "scheduler initialised"
        );
        Ok(scheduler)
    }

    // -----------------------------------------------------------------------
    // Source CRUD
    // -----------------------------------------------------------------------

    pub fn create_source(&self, config: SourceConfig) -> Result<(), TransferError> {
        validate_source(&config)?;
        if config.schedule.is_some() {
            // Surface schedule errors at registration, not at trigger time.
            Schedule::parse(config.schedule.as_deref().unwrap_or_default())?;
        }

        let mut sources = self.inner.sources.write().expect("sources lock");
        if sources.contains_key(&config.name) {
            return Err(TransferError::Validation(format!(
                "source {:?} already exists",
                config.name
            )));
        }
        self.inner.health.register(
            &config.name,
            config.probe_url().map(str::to_string),
            config.fallback_url.clone(),
        );
        info!(source = %config.name, kind = config.kind.as_str(), "source created");
        sources.insert(config.name.clone(), SourceState::new(config));
        drop(sources);

        self.persist_registry();
        Ok(())
    }

    pub fn update_source(&self, config: SourceConfig) -> Result<(), TransferError> {
        validate_source(&config)?;
        if let Some(spec) = config.schedule.as_deref() {
            Schedule::parse(spec)?;
        }

        let mut sources = self.inner.sources.write().expect("sources lock");
        let state = sources.get_mut(&config.name).ok_or_else(|| {
            TransferError::NotFound(format!("source {:?} not found", config.name))
        })?;
        if matches!(state.status, SourceStatus::Running | SourceStatus::Stopping) {
            return Err(TransferError::Validation(format!(
                "source {:?} is running; stop it before updating",
                config.name
            )));
        }

        self.inner.health.register(
            &config.name,
            config.probe_url().map(str::to_string),
            config.fallback_url.clone(),
        );
        state.schedule = parse_schedule(&config);
        state.config = config;
        info!(source = %state.config.name, "source updated");
        drop(sources);

        self.persist_registry();
        Ok(())
    }

    /// Remove a source.  Only permitted while it is not running.
    pub fn delete_source(&self, name: &str) -> Result<(), TransferError> {
        let mut sources = self.inner.sources.write().expect("sources lock");
        let state = sources
            .get(name)
            .ok_or_else(|| TransferError::NotFound(format!("source {name:?} not found")))?;
        if matches!(state.status, SourceStatus::Running | SourceStatus::Stopping) {
            return Err(TransferError::Validation(format!(
                "source {name:?} is running; stop it before deleting"
            )));
        }
        sources.remove(name);
        drop(sources);

        self.inner.health.unregister(name);
        self.persist_registry();
        info!(source = name, "source deleted");
        Ok(())
    }

    pub fn list_sources(&self) -> Vec<SourceInfo> {
        let now = Utc::now();
        let sources = self.inner.sources.read().expect("sources lock");
        let mut list: Vec<SourceInfo> = sources.values().map(|s| source_info(s, now)).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn source_info(&self, name: &str) -> Option<SourceInfo> {
        let sources = self.inner.sources.read().expect("sources lock");
        sources.get(name).map(|s| source_info(s, Utc::now()))
    }

    pub fn history(&self, name: &str, limit: usize) -> Vec<PassSummary> {
        let sources = self.inner.sources.read().expect("sources lock");
        sources
            .get(name)
            .map(|s| s.history.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Trigger a pass.  Fails fast when the source is already running; the
    /// per-source mutual exclusion lives here, in the state machine.
    pub fn start(&self, name: &str) -> Result<String, TransferError> {
        let (config, task, token) = {
            let mut sources = self.inner.sources.write().expect("sources lock");
            let state = sources
                .get_mut(name)
                .ok_or_else(|| TransferError::NotFound(format!("source {name:?} not found")))?;

            if !state.config.enabled {
                return Err(TransferError::Validation(format!(
                    "source {name:?} is disabled"
                )));
            }
            if matches!(state.status, SourceStatus::Running | SourceStatus::Stopping) {
                return Err(TransferError::Validation(format!(
                    "source {name:?} is already running"
                )));
            }

            let task = Arc::new(Mutex::new(SyncTask::new(name)));
            let token = CancellationToken::new();
            state.status = SourceStatus::Running;
            state.cancel = Some(token.clone());
            state.task = Some(Arc::clone(&task));
            (state.config.clone(), task, token)
        };

        let task_id = task.lock().expect("task lock poisoned").id.clone();
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_one(config, task, token).await;
        });

        debug!(source = name, task_id = %task_id, "pass started");
        Ok(task_id)
    }

    pub fn start_all(&self) -> Vec<(String, Result<String, TransferError>)> {
        let names: Vec<String> = {
            let sources = self.inner.sources.read().expect("sources lock");
            sources.keys().cloned().collect()
        };
        names
            .into_iter()
            .map(|name| {
                let result = self.start(&name);
                (name, result)
            })
            .collect()
    }

    /// Request a cooperative stop.  The running pass acknowledges between
    /// fetch units and the source returns to idle.
    pub fn stop(&self, name: &str) -> Result<(), TransferError> {
        let mut sources = self.inner.sources.write().expect("sources lock");
        let state = sources
            .get_mut(name)
            .ok_or_else(|| TransferError::NotFound(format!("source {name:?} not found")))?;
        match state.status {
            SourceStatus::Running => {
                state.status = SourceStatus::Stopping;
                if let Some(ref cancel) = state.cancel {
                    cancel.cancel();
                }
                info!(source = name, "stop requested");
                Ok(())
            }
            SourceStatus::Stopping => Ok(()),
            _ => Err(TransferError::Validation(format!(
                "source {name:?} is not running"
            ))),
        }
    }

    pub fn stop_all(&self) {
        let names: Vec<String> = {
            let sources = self.inner.sources.read().expect("sources lock");
            sources.keys().cloned().collect()
        };
        for name in names {
            let _ = self.stop(&name);
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        let sources = self.inner.sources.read().expect("sources lock");
        let mut infos: Vec<SourceInfo> = sources.values().map(|s| source_info(s, now)).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        SchedulerStatus {
            running: infos
                .iter()
                .filter(|s| {
                    matches!(s.status, SourceStatus::Running | SourceStatus::Stopping)
                })
                .count(),
            sources: infos,
        }
    }

    // -----------------------------------------------------------------------
    // Trigger evaluation
    // -----------------------------------------------------------------------

    /// Evaluate schedules at `now` and start whatever is due.  Pure with
    /// respect to the injected timestamp.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<String> = {
            let sources = self.inner.sources.read().expect("sources lock");
            sources
                .values()
                .filter(|state| {
                    state.config.enabled
                        && state.config.auto_sync
                        && matches!(state.status, SourceStatus::Idle | SourceStatus::Error)
                        && state
                            .schedule
                            .as_ref()
                            .map(|s| s.due(state.last_sync, now))
                            .unwrap_or(false)
                })
                .map(|state| state.config.name.clone())
                .collect()
        };

        let mut started = 0;
        for name in due {
            match self.start(&name) {
                Ok(_) => started += 1,
                Err(e) => debug!(source = %name, error = %e, "due source not started"),
            }
        }
        started
    }

    /// Scheduler loop: boot-start `auto_sync` sources without a schedule,
    /// then evaluate triggers until shutdown.
    pub async fn run(&self, tick_interval: std::time::Duration, shutdown: CancellationToken) {
        let boot: Vec<String> = {
            let sources = self.inner.sources.read().expect("sources lock");
            sources
                .values()
                .filter(|s| s.config.enabled && s.config.auto_sync && s.schedule.is_none())
                .map(|s| s.config.name.clone())
                .collect()
        };
        for name in boot {
            if let Err(e) = self.start(&name) {
                warn!(source = %name, error = %e, "boot sync not started");
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick_interval) => {
                    self.tick(Utc::now());
                }
            }
        }
        debug!("scheduler loop stopped");
    }

    /// Stop everything and wait for running passes to drain.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.stop_all();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let busy = {
                let sources = self.inner.sources.read().expect("sources lock");
                sources.values().any(|s| {
                    matches!(s.status, SourceStatus::Running | SourceStatus::Stopping)
                })
            };
            if !busy {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace period expired with passes still draining");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        info!("scheduler drained");
    }

    // -----------------------------------------------------------------------
    // Pass execution
    // -----------------------------------------------------------------------

    async fn run_one(
        &self,
        config: SourceConfig,
        task: Arc<Mutex<SyncTask>>,
        token: CancellationToken,
    ) {
        // Global bound on concurrent passes across all sources.
        let _permit = match self.inner.global_permits.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };

        let endpoint = self
            .inner
            .health
            .effective_url(&config.name, config.url.as_deref());

        let status = match build_adapter(&config, endpoint, self.inner.adapter_opts).await {
            Ok(adapter) => {
                let target_dir = self.inner.base_dir.join(config.target_name());
                let options =
                    EngineOptions::from_config(&self.inner.concurrency, config.mirror_delete);
                run_pass(
                    &config.name,
                    &target_dir,
                    adapter,
                    options,
                    token,
                    Arc::clone(&task),
                    Some(Arc::clone(&self.inner.health)),
                )
                .await
            }
            Err(e) => {
                warn!(source = %config.name, error = %e, "adapter construction failed");
                task.lock()
                    .expect("task lock poisoned")
                    .mark_failed(format!("adapter setup failed: {e}"));
                TaskStatus::Failed
            }
        };

        self.finish(&config.name, &task, status);
    }

    fn finish(&self, name: &str, task: &Arc<Mutex<SyncTask>>, status: TaskStatus) {
        let mut sources = self.inner.sources.write().expect("sources lock");
        let Some(state) = sources.get_mut(name) else {
            return;
        };

        let snapshot = task.lock().expect("task lock poisoned").clone();
        state.history.push_back(PassSummary::from(&snapshot));
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.totals.passes += 1;
        state.totals.files_synced += snapshot.counts.synced();
        state.totals.bytes_transferred += snapshot.bytes_transferred;
        state.last_sync = Some(Utc::now());
        state.cancel = None;

        state.status = match status {
            TaskStatus::Failed => {
                state.last_error = snapshot.error.clone();
                state.last_error_at = Some(Utc::now());
                SourceStatus::Error
            }
            _ => SourceStatus::Idle,
        };
    }

    // -----------------------------------------------------------------------
    // Registry persistence
    // -----------------------------------------------------------------------

    fn persist_registry(&self) {
        let registry = {
            let sources = self.inner.sources.read().expect("sources lock");
            let mut configs: Vec<SourceConfig> =
                sources.values().map(|s| s.config.clone()).collect();
            configs.sort_by(|a, b| a.name.cmp(&b.name));
            SourceRegistry {
                schema_version: REGISTRY_VERSION,
                sources: configs,
            }
        };

        let path = self.inner.state_dir.join(REGISTRY_FILE);
        let tmp = self.inner.state_dir.join(format!("{REGISTRY_FILE}.tmp"));
        let result = serde_json::to_string_pretty(&registry)
            .map_err(std::io::Error::other)
            .and_then(|contents| std::fs::write(&tmp, contents))
            .and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist source registry");
        }
    }
}

fn source_info(state: &SourceState, now: DateTime<Utc>) -> SourceInfo {
    SourceInfo {
        name: state.config.name.clone(),
        kind: state.config.kind.as_str(),
        target: state.config.target_name().to_string(),
        enabled: state.config.enabled,
        auto_sync: state.config.auto_sync,
        schedule: state.config.schedule.clone(),
        status: state.status,
        last_sync: state.last_sync,
        last_error: state.last_error.clone(),
        last_error_at: state.last_error_at,
        next_run: state
            .schedule
            .as_ref()
            .and_then(|s| s.next_run(state.last_sync, now)),
        totals: state.totals,
        current_task: state
            .task
            .as_ref()
            .map(|t| t.lock().expect("task lock poisoned").clone()),
        progress: state.task.as_ref().map(|t| {
            let task = t.lock().expect("task lock poisoned");
            TaskProgress {
                percent: task.progress_percent(),
                throughput_bytes_per_sec: task.throughput_bytes_per_sec(),
                eta_secs: task.eta_secs(),
            }
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, SourceKind};
    use crate::health::HealthMonitor;

    fn local_source(name: &str, path: &std::path::Path) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            kind: SourceKind::Local,
            url: None,
            host: None,
            port: None,
            path: Some(path.to_string_lossy().into_owned()),
            username: None,
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
        }
    }

    fn test_config(root: &std::path::Path) -> Config {
        Config {
            base_dir: root.join("mirror"),
            state_dir: root.join("state"),
            cache: CacheConfig {
                dir: root.join("cache"),
                max_bytes: 1024,
                default_ttl_secs: 0,
            },
            concurrency: ConcurrencyConfig::default(),
            prewarm: Default::default(),
            health: Default::default(),
            tick_interval_secs: 10,
            sources: Vec::new(),
        }
    }

    fn scheduler(root: &std::path::Path) -> SyncScheduler {
        let health = Arc::new(HealthMonitor::new(Default::default()));
        SyncScheduler::new(&test_config(root), health).unwrap()
    }

    async fn wait_idle(s: &SyncScheduler, name: &str) {
        for _ in 0..400 {
            let info = s.source_info(name).unwrap();
            if matches!(info.status, SourceStatus::Idle | SourceStatus::Error) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("source {name} never settled");
    }

    #[tokio::test]
    async fn start_syncs_a_local_source() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.join("b.txt"), b"beta").unwrap();

        let s = scheduler(root.path());
        s.create_source(local_source("docs", &src)).unwrap();
        s.start("docs").unwrap();
        wait_idle(&s, "docs").await;

        let info = s.source_info("docs").unwrap();
        assert_eq!(info.status, SourceStatus::Idle);
        assert_eq!(info.totals.files_synced, 2);
        assert!(root.path().join("mirror/docs/a.txt").exists());

        let history = s.history("docs", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn second_start_fails_fast_while_running() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();

        let s = scheduler(root.path());
        s.create_source(local_source("docs", &src)).unwrap();
        s.start("docs").unwrap();

        // The state machine flips to running synchronously, so a second
        // start is rejected regardless of how fast the pass finishes.
        assert!(matches!(
            s.start("docs"),
            Err(TransferError::Validation(_))
        ));
        wait_idle(&s, "docs").await;
        assert!(s.start("docs").is_ok());
        wait_idle(&s, "docs").await;
    }

    #[tokio::test]
    async fn crud_guards() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        let s = scheduler(root.path());
        s.create_source(local_source("a", &src)).unwrap();
        assert!(matches!(
            s.create_source(local_source("a", &src)),
            Err(TransferError::Validation(_))
        ));
        assert!(matches!(
            s.delete_source("missing"),
            Err(TransferError::NotFound(_))
        ));

        let mut bad = local_source("bad", &src);
        bad.path = None;
        assert!(matches!(
            s.create_source(bad),
            Err(TransferError::Validation(_))
        ));

        let mut scheduled = local_source("b", &src);
        scheduled.schedule = Some("not a cron".into());
        assert!(matches!(
            s.create_source(scheduled),
            Err(TransferError::Validation(_))
        ));

        s.delete_source("a").unwrap();
        assert!(s.source_info("a").is_none());
    }

    #[tokio::test]
    async fn registry_survives_restart() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        {
            let s = scheduler(root.path());
            s.create_source(local_source("persisted", &src)).unwrap();
        }
        let s = scheduler(root.path());
        let info = s.source_info("persisted").unwrap();
        assert_eq!(info.kind, "local");
    }

    #[tokio::test]
    async fn tick_starts_due_interval_sources() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();

        let s = scheduler(root.path());
        let mut source = local_source("auto", &src);
        source.auto_sync = true;
        source.schedule = Some("interval:3600".into());
        s.create_source(source).unwrap();

        // Never run: due immediately.
        assert_eq!(s.tick(Utc::now()), 1);
        wait_idle(&s, "auto").await;

        // Just ran: not due again within the interval.
        assert_eq!(s.tick(Utc::now()), 0);
        // Due again once the interval elapses.
        assert_eq!(s.tick(Utc::now() + chrono::Duration::seconds(3601)), 1);
        wait_idle(&s, "auto").await;
    }

    #[tokio::test]
    async fn disabled_and_manual_sources_are_not_ticked() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        let s = scheduler(root.path());
        let mut disabled = local_source("disabled", &src);
        disabled.enabled = false;
        disabled.auto_sync = true;
        disabled.schedule = Some("interval:1".into());
        s.create_source(disabled).unwrap();

        let mut manual = local_source("manual", &src);
        manual.schedule = Some("interval:1".into());
        s.create_source(manual).unwrap();

        assert_eq!(s.tick(Utc::now()), 0);
        assert!(matches!(
            s.start("disabled"),
            Err(TransferError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn error_state_recovers_on_successful_pass() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        // Source path does not exist yet: listing fails, source errors.
        let s = scheduler(root.path());
        s.create_source(local_source("flaky", &src)).unwrap();
        s.start("flaky").unwrap();
        wait_idle(&s, "flaky").await;
        let info = s.source_info("flaky").unwrap();
        assert_eq!(info.status, SourceStatus::Error);
        assert!(info.last_error.is_some());

        // Create the directory; the next trigger recovers the source.
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        s.start("flaky").unwrap();
        wait_idle(&s, "flaky").await;
        assert_eq!(s.source_info("flaky").unwrap().status, SourceStatus::Idle);
    }
}
