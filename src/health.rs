//! Source health monitoring and failover.
//!
//! Probes each registered source endpoint with a `HEAD` request on an
//! interval, keeps a rolling window of outcomes, and classifies each source
//! healthy / degraded / unhealthy.  Transitions are deliberately sticky:
//! a source only becomes unhealthy after the consecutive-failure threshold
//! (or its windowed success rate drops below the low threshold), and only
//! recovers after the configured streak of passing probes — alternating
//! pass/fail probes can never flip the status in either direction.
//!
//! When an unhealthy source has a configured fallback endpoint, subsequent
//! sync and fetch-through operations are redirected to the fallback until
//! the primary recovers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not probed yet.
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

// ---------------------------------------------------------------------------
// Per-source state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Probe {
    ok: bool,
    latency_ms: f64,
}

#[derive(Debug)]
struct HealthState {
    probe_url: Option<String>,
    fallback_url: Option<String>,
    window: VecDeque<Probe>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    status: HealthStatus,
    failed_over: bool,
    last_error: Option<String>,
    last_check: Option<DateTime<Utc>>,
}

impl HealthState {
    fn new(probe_url: Option<String>, fallback_url: Option<String>) -> Self {
        Self {
            probe_url,
            fallback_url,
            window: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            status: HealthStatus::Unknown,
            failed_over: false,
            last_error: None,
            last_check: None,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|p| p.ok).count();
        ok as f64 / self.window.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        let succeeded: Vec<f64> = self
            .window
            .iter()
            .filter(|p| p.ok)
            .map(|p| p.latency_ms)
            .collect();
        if succeeded.is_empty() {
            return 0.0;
        }
        succeeded.iter().sum::<f64>() / succeeded.len() as f64
    }
}

/// Status snapshot for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub failed_over: bool,
    pub fallback_url: Option<String>,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    config: HealthConfig,
    states: Mutex<HashMap<String, HealthState>>,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("mirrorcache/0.1")
            .timeout(std::time::Duration::from_secs(config.probe_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            client,
        }
    }

    /// Register (or re-register) a source for probing.
    pub fn register(
        &self,
        name: &str,
        probe_url: Option<String>,
        fallback_url: Option<String>,
    ) {
        let mut states = self.states.lock().expect("health state poisoned");
        states.insert(
            name.to_string(),
            HealthState::new(probe_url, fallback_url),
        );
    }

    pub fn unregister(&self, name: &str) {
        self.states
            .lock()
            .expect("health state poisoned")
            .remove(name);
    }

    /// Record one probe outcome and run the status transition.
    pub fn record_outcome(&self, name: &str, ok: bool, latency_ms: f64, error: Option<String>) {
        let mut states = self.states.lock().expect("health state poisoned");
        let Some(state) = states.get_mut(name) else {
            return;
        };

        state.window.push_back(Probe { ok, latency_ms });
        while state.window.len() > self.config.window {
            state.window.pop_front();
        }
        if ok {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            state.last_error = error.clone();
        }
        state.last_check = Some(Utc::now());

        let before = state.status;
        apply_transition(state, &self.config);

        if before != state.status {
            if state.status == HealthStatus::Unhealthy {
                warn!(
                    source = name,
                    consecutive_failures = state.consecutive_failures,
                    failed_over = state.failed_over,
                    "source became unhealthy"
                );
            } else {
                info!(source = name, status = ?state.status, "source health changed");
            }
        }
    }

    /// Called by the sync engine when `list()` fails; counts as a failed
    /// probe so repeated listing failures drive failover.
    pub fn record_failure(&self, name: &str, error: &str) {
        self.record_outcome(name, false, 0.0, Some(error.to_string()));
    }

    /// Resolve the endpoint to use for a source: the fallback while failed
    /// over, the primary otherwise.
    pub fn effective_url(&self, name: &str, primary: Option<&str>) -> Option<String> {
        let states = self.states.lock().expect("health state poisoned");
        if let Some(state) = states.get(name) {
            if state.failed_over {
                if let Some(ref fallback) = state.fallback_url {
                    return Some(fallback.clone());
                }
            }
        }
        primary.map(str::to_string)
    }

    /// Manually fail a source over to its fallback.  Returns false when the
    /// source is unknown or has no fallback configured.
    pub fn force_failover(&self, name: &str) -> bool {
        let mut states = self.states.lock().expect("health state poisoned");
        let Some(state) = states.get_mut(name) else {
            return false;
        };
        if state.fallback_url.is_none() {
            return false;
        }
        state.failed_over = true;
        state.status = HealthStatus::Unhealthy;
        state.consecutive_successes = 0;
        info!(source = name, "manual failover triggered");
        true
    }

    pub fn status(&self, name: &str) -> Option<SourceHealth> {
        let states = self.states.lock().expect("health state poisoned");
        states.get(name).map(|s| snapshot(name, s))
    }

    pub fn snapshot(&self) -> Vec<SourceHealth> {
        let states = self.states.lock().expect("health state poisoned");
        let mut all: Vec<SourceHealth> =
            states.iter().map(|(name, s)| snapshot(name, s)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Probe every registered source once.
    pub async fn probe_all(&self) {
        let targets: Vec<(String, String)> = {
            let states = self.states.lock().expect("health state poisoned");
            states
                .iter()
                .filter_map(|(name, s)| s.probe_url.clone().map(|u| (name.clone(), u)))
                .collect()
        };

        for (name, url) in targets {
            let started = std::time::Instant::now();
            let result = self.client.head(&url).send().await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                    debug!(source = %name, latency_ms, "probe ok");
                    self.record_outcome(&name, true, latency_ms, None);
                }
                Ok(resp) => {
                    let err = format!("HEAD {url} returned {}", resp.status());
                    self.record_outcome(&name, false, latency_ms, Some(err));
                }
                Err(e) => {
                    let err = format!("HEAD {url} failed: {e}");
                    self.record_outcome(&name, false, latency_ms, Some(err));
                }
            }
        }
    }

    /// Probe loop; runs until `shutdown` fires.
    pub async fn run(&self, shutdown: tokio_util::sync::CancellationToken) {
        let interval = std::time::Duration::from_secs(self.config.probe_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.probe_all().await,
            }
        }
        debug!("health probe loop stopped");
    }
}

/// Status transition.  Leaving `Unhealthy` requires the recovery streak at
/// a success rate back above the high threshold; entering it requires the
/// consecutive-failure threshold or a windowed rate below the low
/// threshold.
fn apply_transition(state: &mut HealthState, config: &HealthConfig) {
    let rate = state.success_rate();

    if state.status == HealthStatus::Unhealthy {
        if state.consecutive_successes >= config.recovery_checks
            && rate >= config.high_threshold
        {
            state.status = HealthStatus::Healthy;
            state.failed_over = false;
        }
        return;
    }

    let window_full_enough = state.window.len() >= config.failure_threshold as usize;
    if state.consecutive_failures >= config.failure_threshold
        || (window_full_enough && rate < config.low_threshold)
    {
        state.status = HealthStatus::Unhealthy;
        state.consecutive_successes = 0;
        if state.fallback_url.is_some() {
            state.failed_over = true;
        }
    } else if rate >= config.high_threshold {
        state.status = HealthStatus::Healthy;
    } else {
        state.status = HealthStatus::Degraded;
    }
}

fn snapshot(name: &str, state: &HealthState) -> SourceHealth {
    SourceHealth {
        name: name.to_string(),
        status: state.status,
        success_rate: state.success_rate(),
        avg_latency_ms: state.avg_latency_ms(),
        consecutive_failures: state.consecutive_failures,
        failed_over: state.failed_over,
        fallback_url: state.fallback_url.clone(),
        last_error: state.last_error.clone(),
        last_check: state.last_check,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    #[test]
    fn becomes_unhealthy_only_after_threshold() {
        let m = monitor();
        m.register("mirror", None, None);

        m.record_outcome("mirror", false, 10.0, Some("down".into()));
        m.record_outcome("mirror", false, 10.0, Some("down".into()));
        assert_ne!(m.status("mirror").unwrap().status, HealthStatus::Unhealthy);

        m.record_outcome("mirror", false, 10.0, Some("down".into()));
        assert_eq!(m.status("mirror").unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn recovery_requires_hysteresis_streak() {
        let m = monitor();
        m.register("mirror", None, None);
        for _ in 0..3 {
            m.record_outcome("mirror", false, 10.0, None);
        }
        assert_eq!(m.status("mirror").unwrap().status, HealthStatus::Unhealthy);

        // Two passing probes are not enough.
        m.record_outcome("mirror", true, 5.0, None);
        m.record_outcome("mirror", true, 5.0, None);
        assert_eq!(m.status("mirror").unwrap().status, HealthStatus::Unhealthy);

        // The rate also has to climb back above the high threshold, so keep
        // probing; the streak requirement is satisfied first.
        for _ in 0..20 {
            m.record_outcome("mirror", true, 5.0, None);
        }
        assert_eq!(m.status("mirror").unwrap().status, HealthStatus::Healthy);
    }

    #[test]
    fn alternating_probes_never_flip_status() {
        let m = monitor();
        m.register("mirror", None, None);

        // Start healthy.
        for _ in 0..5 {
            m.record_outcome("mirror", true, 5.0, None);
        }
        assert_eq!(m.status("mirror").unwrap().status, HealthStatus::Healthy);

        // Alternating single pass/fail: consecutive failures never reach the
        // threshold and the rate hovers at ~0.5, so the source may degrade
        // but never goes unhealthy.
        for i in 0..40 {
            m.record_outcome("mirror", i % 2 == 0, 5.0, None);
            assert_ne!(
                m.status("mirror").unwrap().status,
                HealthStatus::Unhealthy,
                "flipped unhealthy at probe {i}"
            );
        }

        // And once unhealthy, alternating probes never recover it.
        for _ in 0..3 {
            m.record_outcome("mirror", false, 5.0, None);
        }
        assert_eq!(m.status("mirror").unwrap().status, HealthStatus::Unhealthy);
        for i in 0..40 {
            m.record_outcome("mirror", i % 2 == 0, 5.0, None);
            assert_eq!(
                m.status("mirror").unwrap().status,
                HealthStatus::Unhealthy,
                "recovered early at probe {i}"
            );
        }
    }

    #[test]
    fn failover_redirects_until_recovery() {
        let m = monitor();
        m.register(
            "mirror",
            Some("https://primary.example.com".into()),
            Some("https://fallback.example.com".into()),
        );

        assert_eq!(
            m.effective_url("mirror", Some("https://primary.example.com")),
            Some("https://primary.example.com".to_string())
        );

        for _ in 0..3 {
            m.record_failure("mirror", "connect timeout");
        }
        assert!(m.status("mirror").unwrap().failed_over);
        assert_eq!(
            m.effective_url("mirror", Some("https://primary.example.com")),
            Some("https://fallback.example.com".to_string())
        );

        // Sustained recovery returns traffic to the primary.
        for _ in 0..25 {
            m.record_outcome("mirror", true, 5.0, None);
        }
        assert!(!m.status("mirror").unwrap().failed_over);
        assert_eq!(
            m.effective_url("mirror", Some("https://primary.example.com")),
            Some("https://primary.example.com".to_string())
        );
    }

    #[test]
    fn manual_failover_requires_fallback() {
        let m = monitor();
        m.register("with", Some("https://p".into()), Some("https://f".into()));
        m.register("without", Some("https://p".into()), None);

        assert!(m.force_failover("with"));
        assert!(m.status("with").unwrap().failed_over);
        assert!(!m.force_failover("without"));
        assert!(!m.force_failover("unknown"));
    }
}
