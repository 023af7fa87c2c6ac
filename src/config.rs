use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

// ---------------------------------------------------------------------------
// Source kind
// ---------------------------------------------------------------------------

/// Which transport a sync source speaks.
///
/// Each kind maps to one [`crate::adapter::ProtocolAdapter`] implementation;
/// adding a kind never touches the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Http,
    Ftp,
    Sftp,
    Rsync,
    Git,
    S3,
    Webdav,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
            Self::Rsync => "rsync",
            Self::Git => "git",
            Self::S3 => "s3",
            Self::Webdav => "webdav",
            Self::Local => "local",
        }
    }
}

// ---------------------------------------------------------------------------
// Source configuration
// ---------------------------------------------------------------------------

/// One sync source: connection parameters plus scheduling flags.
///
/// Connection fields are optional at the serde level; [`validate_source`]
/// enforces the per-kind requirements before a source ever reaches the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name; also the default target directory name.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,

    /// Base URL (http, webdav, git, s3 endpoint override).
    #[serde(default)]
    pub url: Option<String>,
    /// Remote host (ftp, sftp, rsync).
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Remote directory (ftp, sftp, rsync) or local source path (local).
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to an SSH private key (sftp).
    #[serde(default)]
    pub private_key: Option<String>,
    /// Bucket name (s3).
    #[serde(default)]
    pub bucket: Option<String>,
    /// Object key prefix (s3).
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,

    /// Directory under `base_dir` the mirror is written into.  Defaults to
    /// the source name.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Whether the scheduler triggers this source on its schedule.
    #[serde(default)]
    pub auto_sync: bool,
    /// `"interval:SECS"` or a 5-field cron expression.  Absent = manual only.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Delete local files with no remote counterpart.  Destructive, so it is
    /// an explicit opt-in.
    #[serde(default)]
    pub mirror_delete: bool,
    /// Fallback endpoint used when the health monitor fails this source over.
    #[serde(default)]
    pub fallback_url: Option<String>,
}

fn bool_true() -> bool {
    true
}

impl SourceConfig {
    /// Target directory name for this source.
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }

    /// Primary endpoint used for health probing, if the kind has one.
    pub fn probe_url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

/// Per-kind connection-parameter validation.
///
/// Rejection here is a [`TransferError::Validation`]; invalid sources never
/// reach the engine.
pub fn validate_source(source: &SourceConfig) -> Result<(), TransferError> {
    if source.name.is_empty() {
        return Err(TransferError::Validation("source name is empty".into()));
    }
    if source.name.contains('/') || source.name.contains("..") {
        return Err(TransferError::Validation(format!(
            "source name {:?} must not contain path separators",
            source.name
        )));
    }

    let missing = |field: &str| {
        TransferError::Validation(format!(
            "source {:?} (type {}): missing required field {:?}",
            source.name,
            source.kind.as_str(),
            field
        ))
    };

    match source.kind {
        SourceKind::Http | SourceKind::Webdav | SourceKind::Git => {
            if source.url.is_none() {
                return Err(missing("url"));
            }
        }
        SourceKind::Ftp | SourceKind::Sftp | SourceKind::Rsync => {
            if source.host.is_none() {
                return Err(missing("host"));
            }
        }
        SourceKind::S3 => {
            if source.bucket.is_none() {
                return Err(missing("bucket"));
            }
        }
        SourceKind::Local => {
            if source.path.is_none() {
                return Err(missing("path"));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory.
    pub dir: PathBuf,
    /// Hard ceiling for total cached bytes.
    #[serde(default = "default_max_cache_bytes")]
    pub max_bytes: u64,
    /// Default entry TTL in seconds; 0 disables expiry.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

fn default_max_cache_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cache_ttl() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Concurrency / retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Global ceiling on concurrently running sync passes.
    #[serde(default = "default_global_syncs")]
    pub max_concurrent_syncs: usize,
    /// Per-pass fetch worker pool size.
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    /// Per-connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-fetch timeout in seconds.  Expiry is a transient failure.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Attempts per entry for transient failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff delay in milliseconds, doubled per attempt.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: default_global_syncs(),
            fetch_workers: default_fetch_workers(),
            connect_timeout_secs: default_connect_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

fn default_global_syncs() -> usize {
    3
}

fn default_fetch_workers() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Prewarm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmConfig {
    #[serde(default = "default_prewarm_workers")]
    pub workers: usize,
    /// Completed-item history ring size.
    #[serde(default = "default_prewarm_history")]
    pub history_limit: usize,
    /// Attempts per item before it is marked failed.
    #[serde(default = "default_prewarm_attempts")]
    pub max_attempts: u32,
    /// How many frequently-missed URLs each popularity scan enqueues.
    #[serde(default = "default_popular_top_n")]
    pub popular_top_n: usize,
    /// Seconds between popularity scans; 0 disables the scan.
    #[serde(default = "default_popular_scan_interval")]
    pub scan_interval_secs: u64,
}

impl Default for PrewarmConfig {
    fn default() -> Self {
        Self {
            workers: default_prewarm_workers(),
            history_limit: default_prewarm_history(),
            max_attempts: default_prewarm_attempts(),
            popular_top_n: default_popular_top_n(),
            scan_interval_secs: default_popular_scan_interval(),
        }
    }
}

fn default_prewarm_workers() -> usize {
    4
}

fn default_prewarm_history() -> usize {
    256
}

fn default_prewarm_attempts() -> u32 {
    3
}

fn default_popular_top_n() -> usize {
    20
}

fn default_popular_scan_interval() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Per-probe timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Rolling window size in probes.
    #[serde(default = "default_probe_window")]
    pub window: usize,
    /// Success rate at or above which a source is healthy.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    /// Success rate below which a source is unhealthy.
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// Consecutive failures that force a source unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful probes required to leave unhealthy.
    #[serde(default = "default_recovery_checks")]
    pub recovery_checks: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            window: default_probe_window(),
            high_threshold: default_high_threshold(),
            low_threshold: default_low_threshold(),
            failure_threshold: default_failure_threshold(),
            recovery_checks: default_recovery_checks(),
        }
    }
}

fn default_probe_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_window() -> usize {
    20
}

fn default_high_threshold() -> f64 {
    0.9
}

fn default_low_threshold() -> f64 {
    0.5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_checks() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for mirrored trees; each source targets a
    /// subdirectory of it.
    pub base_dir: PathBuf,
    /// Directory for the engine's own persisted state (source registry).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    pub cache: CacheConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub prewarm: PrewarmConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Seconds between scheduler evaluations of cron/interval triggers.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_tick_interval() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.health.high_threshold > config.health.low_threshold,
        "health.high_threshold must be greater than health.low_threshold"
    );
    anyhow::ensure!(
        config.health.high_threshold <= 1.0 && config.health.low_threshold >= 0.0,
        "health thresholds must be in range [0.0, 1.0]"
    );
    anyhow::ensure!(
        config.concurrency.max_concurrent_syncs >= 1,
        "concurrency.max_concurrent_syncs must be at least 1"
    );
    anyhow::ensure!(
        config.concurrency.fetch_workers >= 1,
        "concurrency.fetch_workers must be at least 1"
    );
    anyhow::ensure!(config.cache.max_bytes > 0, "cache.max_bytes must be non-zero");

    let mut seen = std::collections::HashSet::new();
    for source in &config.sources {
        anyhow::ensure!(
            seen.insert(source.name.as_str()),
            "duplicate source name: {}",
            source.name
        );
        validate_source(source)
            .map_err(|e| anyhow::anyhow!("invalid source {:?}: {e}", source.name))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn minimal_source(kind: SourceKind) -> SourceConfig {
        SourceConfig {
            name: "test".into(),
            kind,
            url: None,
            host: None,
            port: None,
            path: None,
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

    #[test]
    fn http_source_requires_url() {
        let mut source = minimal_source(SourceKind::Http);
        assert!(matches!(
            validate_source(&source),
            Err(TransferError::Validation(_))
        ));
        source.url = Some("https://mirror.example.com/dist".into());
        assert!(validate_source(&source).is_ok());
    }

    #[test]
    fn sftp_source_requires_host() {
        let mut source = minimal_source(SourceKind::Sftp);
        assert!(validate_source(&source).is_err());
        source.host = Some("files.example.com".into());
        assert!(validate_source(&source).is_ok());
    }

    #[test]
    fn source_name_must_not_traverse() {
        let mut source = minimal_source(SourceKind::Local);
        source.path = Some("/srv/data".into());
        source.name = "../escape".into();
        assert!(validate_source(&source).is_err());
    }

    #[test]
    fn config_parses_with_defaults() {
        let yaml = r#"
base_dir: /srv/mirror
cache:
  dir: /srv/mirror/.cache
sources:
  - name: ubuntu
    type: http
    url: https://archive.ubuntu.com/ubuntu
    auto_sync: true
    schedule: "0 3 * * *"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.concurrency.max_concurrent_syncs, 3);
        assert_eq!(config.sources[0].target_name(), "ubuntu");
        assert!(!config.sources[0].mirror_delete);
    }

    #[test]
    fn duplicate_source_names_rejected() {
        let yaml = r#"
base_dir: /srv/mirror
cache:
  dir: /srv/mirror/.cache
sources:
  - name: a
    type: local
    path: /tmp/a
  - name: a
    type: local
    path: /tmp/b
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
