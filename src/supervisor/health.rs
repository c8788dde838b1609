//! Health checks: one [`Probe`] capability, three probe kinds, one debounce rule.
//!
//! A probe only answers "did this check pass". Debouncing lives in
//! [`HealthState`], which sits on the process record so its counters are
//! reset together with the rest of the runtime fields on every start.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::SupervisorError;
use super::record::ProcessRecord;
use super::registry::Registry;
use super::ProcessStatus;
use crate::config::{HealthCheckConfig, HealthPolicy};

/// Executes a single health probe.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run one probe. Every transport error, timeout or bad answer is `false`.
    async fn probe(&self) -> bool;

    /// Short target description for logs.
    fn target(&self) -> String;
}

/// TCP connect probe.
pub struct PortProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl PortProbe {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for PortProbe {
    async fn probe(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Port probe {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                tracing::debug!("Port probe {} timed out", addr);
                false
            }
        }
    }

    fn target(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// HTTP GET probe; any 2xx passes.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SupervisorError> {
        Ok(Self {
            client: probe_client(timeout)?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!("HTTP probe {} returned {}", self.url, resp.status());
                false
            }
            Err(e) => {
                tracing::debug!("HTTP probe {} failed: {}", self.url, e);
                false
            }
        }
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

/// Application health endpoint probe: expects HTTP 200 with `{"status": "UP"}`.
///
/// Anything else, including transport errors, is read as `DOWN`.
pub struct EndpointProbe {
    client: reqwest::Client,
    url: String,
}

impl EndpointProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SupervisorError> {
        Ok(Self {
            client: probe_client(timeout)?,
            url: url.to_string(),
        })
    }

    async fn read_status(&self) -> String {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("Health endpoint {} unreachable: {}", self.url, e);
                return "DOWN".to_string();
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            tracing::debug!("Health endpoint {} returned {}", self.url, resp.status());
            return "DOWN".to_string();
        }
        match resp.json::<serde_json::Value>().await {
            Ok(body) => body
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("DOWN")
                .to_string(),
            Err(e) => {
                tracing::debug!("Health endpoint {} sent an unreadable body: {}", self.url, e);
                "DOWN".to_string()
            }
        }
    }
}

#[async_trait]
impl Probe for EndpointProbe {
    async fn probe(&self) -> bool {
        self.read_status().await.eq_ignore_ascii_case("UP")
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

fn probe_client(timeout: Duration) -> Result<reqwest::Client, SupervisorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow::Error::new(e).context("cannot build health probe HTTP client").into())
}

/// Construct the probe selected by the configuration.
pub fn build_probe(config: &HealthCheckConfig) -> Result<Arc<dyn Probe>, SupervisorError> {
    let timeout = config.policy().timeout();
    Ok(match config {
        HealthCheckConfig::Port { host, port, .. } => Arc::new(PortProbe::new(host, *port, timeout)),
        HealthCheckConfig::Http { url, .. } => Arc::new(HttpProbe::new(url, timeout)?),
        HealthCheckConfig::Endpoint { url, .. } => Arc::new(EndpointProbe::new(url, timeout)?),
    })
}

/// Debounce counters plus the last verdict that was published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// `None` until a threshold has been crossed for the first time.
    pub healthy: Option<bool>,
}

impl HealthState {
    /// Fold one probe result in. Returns the status to publish when the verdict flips.
    pub fn observe(&mut self, passed: bool, policy: &HealthPolicy) -> Option<ProcessStatus> {
        if passed {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if self.consecutive_successes >= policy.success_threshold && self.healthy != Some(true) {
                self.healthy = Some(true);
                return Some(ProcessStatus::Healthy);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.consecutive_failures >= policy.failure_threshold && self.healthy != Some(false) {
                self.healthy = Some(false);
                return Some(ProcessStatus::Unhealthy);
            }
        }
        None
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Probe result folded in; carries the published status on a flip.
    Applied(Option<ProcessStatus>),
    /// The record moved on (stopped, exited, restarted). The schedule should end.
    Stale,
}

/// Periodic health checking for one run of one process.
pub struct HealthMonitor {
    probe: Arc<dyn Probe>,
    policy: HealthPolicy,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn Probe>, policy: HealthPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Result<Self, SupervisorError> {
        Ok(Self::new(build_probe(config)?, *config.policy()))
    }

    /// Probe once and apply the result to `record` if it is still on `run_id` and alive.
    pub async fn tick(&self, registry: &Registry, record: &ProcessRecord, run_id: u64) -> TickOutcome {
        let passed = self.probe.probe().await;
        tracing::debug!(
            "[{}] health probe {} -> {}",
            record.name(),
            self.probe.target(),
            if passed { "pass" } else { "fail" }
        );

        let mut stale = false;
        let policy = self.policy;
        let event = registry.update(record, |state| {
            // 중지/재시작된 레코드에는 결과를 반영하지 않음
            if state.run_id != run_id || !state.status().is_alive() {
                stale = true;
                return None;
            }
            state.health.observe(passed, &policy)
        });

        if stale {
            TickOutcome::Stale
        } else {
            TickOutcome::Applied(event.map(|e| e.new_status))
        }
    }

    /// Run `tick` every `interval_secs` (first tick after one interval) until
    /// `cancel` fires or the record goes stale.
    pub fn spawn(
        self,
        registry: Arc<Registry>,
        record: Arc<ProcessRecord>,
        run_id: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.policy.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                "[{}] health check armed: {} every {:?}",
                record.name(),
                self.probe.target(),
                period
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // A stop may land while the probe is in flight; the run check inside tick covers it.
                        if self.tick(&registry, &record, run_id).await == TickOutcome::Stale {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("[{}] health check for run {} ended", record.name(), run_id);
        })
    }
}
