//! Completion watcher: the only task that reaps a supervised child.

use chrono::Utc;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::process::ExitState;
use super::record::ProcessRecord;
use super::registry::Registry;
use super::ProcessStatus;

/// Logs if the watcher is dropped before it saw the exit (runtime shutdown or abort).
struct CancelGuard {
    name: String,
    pid: u32,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                "[{}] completion watcher for pid {} cancelled before the process exited",
                self.name,
                self.pid
            );
        }
    }
}

/// Spawn the watcher for one run.
///
/// On exit it publishes the code on `exit_tx`, then, under the record lock,
/// stores end time and exit code, clears the handle and cancels the health
/// check. The status is mapped from the exit code unless a stop is in
/// progress or already settled the run, in which case the stop owns the
/// final status.
pub fn spawn(
    registry: Arc<Registry>,
    record: Arc<ProcessRecord>,
    mut child: Child,
    run_id: u64,
    exit_tx: watch::Sender<ExitState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = child.id().unwrap_or_default();
        let mut guard = CancelGuard {
            name: record.name().to_string(),
            pid,
            armed: true,
        };

        let code = match child.wait().await {
            Ok(status) => {
                let code = crate::utils::exit_code(status);
                tracing::info!("[{}] pid {} exited with {}", record.name(), pid, status);
                code
            }
            Err(e) => {
                tracing::error!("[{}] failed to wait for pid {}: {}", record.name(), pid, e);
                None
            }
        };
        guard.armed = false;

        let _ = exit_tx.send(ExitState::Exited(code));

        registry.update(&record, |state| {
            // 새 실행이 시작되었거나 stop이 이미 결과를 기록함
            if state.run_id != run_id || state.handle.is_none() {
                return None;
            }
            state.end_time = Some(Utc::now());
            state.exit_code = code;
            if state.status() == ProcessStatus::Stopping {
                return None;
            }
            state.handle = None;
            state.watcher = None;
            state.cancel_health_check();
            if state.stop_abandoned {
                // The abandoned stop already published `unknown`.
                return None;
            }
            Some(ProcessStatus::from_exit_code(code))
        });
    })
}
