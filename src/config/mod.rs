use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/procwarden.toml";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("process entry #{0} has no name")]
    MissingName(usize),
    #[error("process '{0}' is defined more than once")]
    DuplicateName(String),
    #[error("process '{0}' has no command")]
    MissingCommand(String),
    #[error("process '{name}': {reason}")]
    InvalidHealthCheck { name: String, reason: String },
    #[error("group '{group}' references unknown process '{process}'")]
    UnknownGroupMember { group: String, process: String },
}

/// Global supervisor settings plus every supervised process.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Start every `auto_start` process at boot.
    #[serde(default)]
    pub auto_start: bool,
    /// Delay between order buckets during bulk start.
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

/// Static specification of one supervised process.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub stdout_log: Option<PathBuf>,
    pub stderr_log: Option<PathBuf>,
    /// Append to log files instead of truncating them on each start.
    #[serde(default = "default_true")]
    pub append_logs: bool,
    /// Send stderr to the stdout destination.
    #[serde(default)]
    pub merge_stderr: bool,
    #[serde(default)]
    pub auto_start: bool,
    /// Carried for a restart policy layer; the lifecycle engine never acts on it.
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    pub shutdown_url: Option<String>,
    pub health_check: Option<HealthCheckConfig>,
}

/// Health-check selection. The `type` tag picks the probe.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheckConfig {
    Port {
        #[serde(default = "default_probe_host")]
        host: String,
        port: u16,
        #[serde(flatten)]
        policy: HealthPolicy,
    },
    Http {
        url: String,
        #[serde(flatten)]
        policy: HealthPolicy,
    },
    /// JSON health endpoint reporting `{"status": "UP"}`.
    Endpoint {
        url: String,
        #[serde(flatten)]
        policy: HealthPolicy,
    },
}

/// Schedule and debounce settings shared by every probe type.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HealthCheckConfig {
    pub fn policy(&self) -> &HealthPolicy {
        match self {
            Self::Port { policy, .. } | Self::Http { policy, .. } | Self::Endpoint { policy, .. } => policy,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidHealthCheck {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let policy = self.policy();
        if policy.success_threshold == 0 || policy.failure_threshold == 0 {
            return Err(invalid("health check thresholds must be at least 1"));
        }
        if policy.interval_secs == 0 {
            return Err(invalid("health check interval must be at least 1 second"));
        }
        if policy.timeout_secs == 0 {
            return Err(invalid("health check timeout must be at least 1 second"));
        }
        match self {
            Self::Port { port: 0, .. } => Err(invalid("health check port must not be 0")),
            Self::Http { url, .. } | Self::Endpoint { url, .. } if url.trim().is_empty() => {
                Err(invalid("health check url is empty"))
            }
            _ => Ok(()),
        }
    }
}

impl ProcessConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            stdout_log: None,
            stderr_log: None,
            append_logs: true,
            merge_stderr: false,
            auto_start: false,
            auto_restart: false,
            order: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            shutdown_url: None,
            health_check: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_health_check(mut self, check: HealthCheckConfig) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName(index));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand(self.name.clone()));
        }
        if let Some(check) = &self.health_check {
            check.validate(&self.name)?;
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            auto_start: false,
            start_delay_ms: default_start_delay_ms(),
            groups: BTreeMap::new(),
            processes: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Load from `PROCWARDEN_CONFIG` or the default path.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("PROCWARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.validate()?;
        tracing::info!("Loaded {} process definitions from {}", cfg.processes.len(), path.display());
        Ok(cfg)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, process) in self.processes.iter().enumerate() {
            process.validate(index)?;
            if !seen.insert(process.name.as_str()) {
                return Err(ConfigError::DuplicateName(process.name.clone()));
            }
        }
        for (group, members) in &self.groups {
            if let Some(missing) = members.iter().find(|m| !seen.contains(m.as_str())) {
                return Err(ConfigError::UnknownGroupMember {
                    group: group.clone(),
                    process: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Group name -> member names, as a lookup map.
    pub fn group_map(&self) -> HashMap<String, Vec<String>> {
        self.groups.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_start_delay_ms() -> u64 {
    5_000
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_interval_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}
