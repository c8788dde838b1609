//! Start, stop and restart of a single named process.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::SupervisorError;
use super::health::HealthMonitor;
use super::process::{self, ExitState, ProcessHandle, WaitOutcome};
use super::record::ProcessRecord;
use super::registry::Registry;
use super::{watcher, ProcessStatus};
use crate::config::ProcessConfig;

/// How long to wait for the kernel to reap a child after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Shutdown POST timeout when no health check supplies one.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LifecycleManager {
    registry: Arc<Registry>,
    http: reqwest::Client,
}

impl LifecycleManager {
    pub fn new(registry: Arc<Registry>) -> Result<Self, SupervisorError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::Error::new(e).context("cannot build shutdown HTTP client"))?;
        Ok(Self { registry, http })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Launch `name` unless it already has a live process.
    ///
    /// Returns once the process is running (or has been marked
    /// `failed_to_start`); it does not wait for the process to finish. Launch
    /// failures are recorded on the record, not returned.
    pub async fn start_process(&self, name: &str) -> Result<(), SupervisorError> {
        let record = self.registry.get(name)?;
        let _ops = record.lock_ops().await;

        let live_pid = record.lock_state().handle.as_ref().map(|h| h.pid());
        if let Some(pid) = live_pid {
            tracing::warn!("[{}] start ignored: already running with pid {}", name, pid);
            return Ok(());
        }

        let mut run_id = 0;
        self.registry.update(&record, |state| {
            run_id = state.begin_run();
            Some(ProcessStatus::Starting)
        });

        // 헬스체크 구성 실패도 실행 실패로 기록
        let prepared = match &record.config().health_check {
            Some(check) => HealthMonitor::from_config(check).map(Some),
            None => Ok(None),
        };
        let launched = prepared.and_then(|monitor| Ok((monitor, spawn_child(record.config())?)));
        let (monitor, child) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!("{}", e);
                let reason = e.to_string();
                self.registry.update(&record, |state| {
                    state.last_error = Some(reason);
                    Some(ProcessStatus::FailedToStart)
                });
                return Ok(());
            }
        };

        let pid = child.id().unwrap_or_default();
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        self.registry.update(&record, |state| {
            state.pid = Some(pid);
            state.start_time = Some(Utc::now());
            state.handle = Some(ProcessHandle::new(pid, exit_rx));
            Some(ProcessStatus::Running)
        });
        tracing::info!("[{}] started with pid {} (run {})", name, pid, run_id);

        if let Some(monitor) = monitor {
            let token = CancellationToken::new();
            monitor.spawn(
                self.registry.clone(),
                record.clone(),
                run_id,
                token.clone(),
            );
            record.lock_state().health_task = Some(token);
        }

        let task = watcher::spawn(self.registry.clone(), record.clone(), child, run_id, exit_tx);
        let mut state = record.lock_state();
        // 프로세스가 이미 종료되어 watcher가 끝났다면 핸들을 보관하지 않음
        if state.run_id == run_id && state.handle.is_some() {
            state.watcher = Some(task);
        }
        Ok(())
    }

    /// Gracefully stop `name`, escalating to a forced kill after `shutdown_timeout`.
    ///
    /// The shutdown request (URL POST or SIGTERM) counts against
    /// `shutdown_timeout`, so escalation starts at most `shutdown_timeout`
    /// after the call. No-op when nothing is running. Returns after the
    /// handle is cleared. If the returned future is dropped mid-wait the
    /// record is settled as `unknown`.
    pub async fn stop_process(&self, name: &str) -> Result<(), SupervisorError> {
        let record = self.registry.get(name)?;
        let _ops = record.lock_ops().await;

        let mut handle = None;
        let mut run_id = 0;
        self.registry.update(&record, |state| {
            handle = state.handle.clone();
            handle.as_ref()?;
            run_id = state.run_id;
            state.cancel_health_check();
            Some(ProcessStatus::Stopping)
        });
        let Some(handle) = handle else {
            tracing::info!("[{}] stop ignored: not running", name);
            return Ok(());
        };
        let mut guard = AbandonedStop {
            registry: &self.registry,
            record: &record,
            run_id,
            armed: true,
        };

        let config = record.config();
        let pid = handle.pid();
        let shutdown_timeout = config.shutdown_timeout();
        let deadline = Instant::now() + shutdown_timeout;
        tracing::info!(
            "[{}] stopping pid {} (shutdown timeout {:?})",
            name,
            pid,
            shutdown_timeout
        );
        self.request_shutdown(config, pid, shutdown_timeout).await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let (status, code) = match handle.wait_exit(remaining).await {
            WaitOutcome::Exited(code) => (ProcessStatus::Stopped, code),
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    "[{}] pid {} still alive after {:?}, killing",
                    name,
                    pid,
                    shutdown_timeout
                );
                if let Err(e) = process::force_kill(pid) {
                    tracing::warn!("[{}] {}", name, e);
                }
                match handle.wait_exit(KILL_GRACE).await {
                    WaitOutcome::Exited(code) => (ProcessStatus::Aborted, code),
                    _ => {
                        // Dropping the child (kill_on_drop) is the last resort.
                        let watcher = record.lock_state().watcher.take();
                        if let Some(task) = watcher {
                            task.abort();
                        }
                        (ProcessStatus::Aborted, None)
                    }
                }
            }
            WaitOutcome::Lost => {
                tracing::warn!("[{}] lost track of pid {} while stopping", name, pid);
                (ProcessStatus::Unknown, None)
            }
        };

        guard.armed = false;
        self.registry.update(&record, |state| {
            if state.end_time.is_none() {
                state.end_time = Some(Utc::now());
            }
            if state.exit_code.is_none() {
                state.exit_code = code;
            }
            state.handle = None;
            state.watcher = None;
            Some(status)
        });
        Ok(())
    }

    /// `stop_process` followed by `start_process`.
    pub async fn restart_process(&self, name: &str) -> Result<(), SupervisorError> {
        self.stop_process(name).await?;
        self.start_process(name).await
    }

    /// POST to the configured shutdown URL, falling back to SIGTERM.
    /// The POST never outlasts `budget`.
    async fn request_shutdown(&self, config: &ProcessConfig, pid: u32, budget: Duration) {
        if let Some(url) = &config.shutdown_url {
            let timeout = config
                .health_check
                .as_ref()
                .map(|check| check.policy().timeout())
                .unwrap_or(SHUTDOWN_REQUEST_TIMEOUT)
                .min(budget);
            match self.http.post(url).timeout(timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!("[{}] shutdown requested via {}", config.name, url);
                    return;
                }
                Ok(resp) => tracing::warn!(
                    "[{}] shutdown url {} answered {}, falling back to signal",
                    config.name,
                    url,
                    resp.status()
                ),
                Err(e) => tracing::warn!(
                    "[{}] shutdown url {} failed: {}, falling back to signal",
                    config.name,
                    url,
                    e
                ),
            }
        }
        if let Err(e) = process::terminate(pid) {
            tracing::warn!("[{}] {}", config.name, e);
        }
    }
}

/// Settles a stop whose future was dropped before it recorded a result.
///
/// The record moves to `unknown`. If the process already exited the handle is
/// cleared here; otherwise the completion watcher clears it on exit.
struct AbandonedStop<'a> {
    registry: &'a Registry,
    record: &'a ProcessRecord,
    run_id: u64,
    armed: bool,
}

impl Drop for AbandonedStop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let run_id = self.run_id;
        let settled = self.registry.update(self.record, |state| {
            if state.run_id != run_id || state.status() != ProcessStatus::Stopping {
                return None;
            }
            // watcher는 lock 전에 종료를 알리므로 여기서 읽은 상태가 기준
            match state.handle.as_ref().map(|h| h.exit_state()) {
                Some(ExitState::Exited(code)) => {
                    if state.end_time.is_none() {
                        state.end_time = Some(Utc::now());
                    }
                    if state.exit_code.is_none() {
                        state.exit_code = code;
                    }
                    state.handle = None;
                    state.watcher = None;
                }
                Some(ExitState::Running) => state.stop_abandoned = true,
                None => return None,
            }
            Some(ProcessStatus::Unknown)
        });
        if settled.is_some() {
            tracing::warn!(
                "[{}] stop was interrupted before the process exit was confirmed",
                self.record.name()
            );
        }
    }
}

/// Build and spawn the child described by `config`.
fn spawn_child(config: &ProcessConfig) -> Result<Child, SupervisorError> {
    let launch_error = |reason: String| SupervisorError::Launch {
        name: config.name.clone(),
        reason,
    };

    let stdout = match &config.stdout_log {
        Some(path) => Some(open_log(path, config.append_logs).map_err(&launch_error)?),
        None => None,
    };
    let stderr = if config.merge_stderr {
        match &stdout {
            Some(file) => Some(
                file.try_clone()
                    .map_err(|e| launch_error(format!("cannot share stdout log with stderr: {}", e)))?,
            ),
            None => None,
        }
    } else {
        match &config.stderr_log {
            Some(path) => Some(open_log(path, config.append_logs).map_err(&launch_error)?),
            None => None,
        }
    };

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(stdout.map(Stdio::from).unwrap_or_else(Stdio::null))
        .stderr(stderr.map(Stdio::from).unwrap_or_else(Stdio::null))
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    crate::utils::apply_creation_flags(&mut cmd);

    cmd.spawn()
        .map_err(|e| launch_error(format!("cannot execute '{}': {}", config.command, e)))
}

fn open_log(path: &Path, append: bool) -> Result<File, String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create log directory {}: {}", parent.display(), e))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .map_err(|e| format!("cannot open log file {}: {}", path.display(), e))
}
