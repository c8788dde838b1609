use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::HealthState;
use super::process::ProcessHandle;
use super::ProcessStatus;
use crate::config::ProcessConfig;

/// Mutable runtime fields of a record. Only reachable through the record's lock.
#[derive(Debug, Default)]
pub struct RecordState {
    status: ProcessStatus,
    /// Bumped on every start attempt; late tasks compare against it.
    pub run_id: u64,
    pub pid: Option<u32>,
    pub handle: Option<ProcessHandle>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub health: HealthState,
    pub health_task: Option<CancellationToken>,
    pub watcher: Option<JoinHandle<()>>,
    /// A stop gave up waiting (its caller went away) while the process was still alive.
    pub stop_abandoned: bool,
}

impl RecordState {
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Swap the status. Only the registry's choke point calls this.
    pub(super) fn replace_status(&mut self, status: ProcessStatus) -> ProcessStatus {
        std::mem::replace(&mut self.status, status)
    }

    /// Clear per-run fields before a new start attempt and return the new run id.
    pub fn begin_run(&mut self) -> u64 {
        self.run_id += 1;
        self.pid = None;
        self.handle = None;
        self.start_time = None;
        self.end_time = None;
        self.exit_code = None;
        self.last_error = None;
        self.health = HealthState::default();
        self.cancel_health_check();
        self.watcher = None;
        self.stop_abandoned = false;
        self.run_id
    }

    pub fn cancel_health_check(&mut self) {
        if let Some(token) = self.health_task.take() {
            token.cancel();
        }
    }

    pub fn uptime_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or(now);
        Some((end - start).num_milliseconds().max(0))
    }
}

/// One supervised process: immutable configuration plus guarded runtime state.
#[derive(Debug)]
pub struct ProcessRecord {
    config: Arc<ProcessConfig>,
    state: Mutex<RecordState>,
    /// Serializes start/stop on this record (held across awaits, unlike `state`).
    ops: tokio::sync::Mutex<()>,
}

impl ProcessRecord {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Mutex::new(RecordState::default()),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Short critical section over the runtime fields. Never hold across an await.
    pub fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        // RecordState는 문장 단위로 일관성이 유지되므로 poison 복구 가능
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub fn status(&self) -> ProcessStatus {
        self.lock_state().status()
    }

    /// Whether a live OS handle is attached.
    pub fn is_alive(&self) -> bool {
        self.lock_state().handle.is_some()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let state = self.lock_state();
        let config = self.config();
        ProcessSnapshot {
            name: config.name.clone(),
            status: state.status(),
            pid: state.pid,
            alive: state.handle.is_some(),
            start_time: state.start_time,
            end_time: state.end_time,
            exit_code: state.exit_code,
            uptime_ms: state.uptime_ms(Utc::now()),
            last_error: state.last_error.clone(),
            health: config.health_check.as_ref().map(|_| state.health),
            command: config.command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            order: config.order,
            auto_start: config.auto_start,
            auto_restart: config.auto_restart,
        }
    }
}

/// Point-in-time copy of a record for callers outside the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub alive: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub uptime_ms: Option<i64>,
    pub last_error: Option<String>,
    pub health: Option<HealthState>,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub order: i32,
    pub auto_start: bool,
    pub auto_restart: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn begin_run_resets_runtime_fields() {
        let record = ProcessRecord::new(ProcessConfig::new("svc", "true"));
        let token = CancellationToken::new();
        {
            let mut state = record.lock_state();
            state.pid = Some(10);
            state.start_time = Some(Utc::now());
            state.end_time = Some(Utc::now());
            state.exit_code = Some(1);
            state.last_error = Some("boom".into());
            state.health.consecutive_failures = 4;
            state.health_task = Some(token.clone());
            state.stop_abandoned = true;
            assert_eq!(state.begin_run(), 1);
            assert_eq!(state.begin_run(), 2);
        }

        let state = record.lock_state();
        assert!(state.pid.is_none());
        assert!(state.start_time.is_none());
        assert!(state.exit_code.is_none());
        assert!(state.last_error.is_none());
        assert!(!state.stop_abandoned);
        assert_eq!(state.health, HealthState::default());
        assert!(token.is_cancelled(), "previous health schedule is cancelled");
    }

    #[test]
    fn uptime_uses_end_time_when_present() {
        let mut state = RecordState::default();
        assert_eq!(state.uptime_ms(Utc::now()), None);

        let start = Utc::now();
        state.start_time = Some(start);
        state.end_time = Some(start + Duration::milliseconds(1500));
        assert_eq!(state.uptime_ms(start + Duration::seconds(60)), Some(1500));

        state.end_time = None;
        assert_eq!(state.uptime_ms(start + Duration::seconds(2)), Some(2000));
    }

    #[test]
    fn snapshot_copies_config_and_state() {
        let record = ProcessRecord::new(
            ProcessConfig::new("svc", "/bin/svc").with_args(["-v"]).with_order(3),
        );
        record.lock_state().pid = Some(99);
        let snap = record.snapshot();
        assert_eq!(snap.name, "svc");
        assert_eq!(snap.status, ProcessStatus::NotStarted);
        assert_eq!(snap.pid, Some(99));
        assert!(!snap.alive);
        assert_eq!(snap.order, 3);
        assert_eq!(snap.args, vec!["-v"]);
        assert!(snap.health.is_none());
    }
}
