use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// What the completion watcher has observed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// The process is gone. `None` when the wait failed and the code is unknown.
    Exited(Option<i32>),
}

/// Result of a bounded wait on a [`ProcessHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(Option<i32>),
    TimedOut,
    /// The watcher went away without reporting an exit.
    Lost,
}

/// The record's view of a live OS process.
///
/// The `Child` itself is owned by the completion watcher, which is the only
/// task that reaps it; the handle carries the PID for signalling and a watch
/// receiver to observe the exit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exit_rx: watch::Receiver<ExitState>,
}

impl ProcessHandle {
    pub fn new(pid: u32, exit_rx: watch::Receiver<ExitState>) -> Self {
        Self { pid, exit_rx }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_state(&self) -> ExitState {
        *self.exit_rx.borrow()
    }

    /// Wait up to `timeout` for the watcher to report an exit.
    pub async fn wait_exit(&self, timeout: Duration) -> WaitOutcome {
        let mut rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let seen = *rx.borrow_and_update();
                if let ExitState::Exited(code) = seen {
                    return WaitOutcome::Exited(code);
                }
                if rx.changed().await.is_err() {
                    // Sender dropped; one last look in case the final value landed.
                    return match *rx.borrow() {
                        ExitState::Exited(code) => WaitOutcome::Exited(code),
                        ExitState::Running => WaitOutcome::Lost,
                    };
                }
            }
        })
        .await;
        waited.unwrap_or(WaitOutcome::TimedOut)
    }
}

/// Ask the process (group) to terminate. Graceful: SIGTERM on unix.
pub fn terminate(pid: u32) -> Result<(), SignalError> {
    send_signal(pid, false)
}

/// Force-kill the process (group). SIGKILL on unix.
pub fn force_kill(pid: u32) -> Result<(), SignalError> {
    send_signal(pid, true)
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> Result<(), SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    tracing::debug!("Sending {} to process group {}", sig, pid);

    // The child leads its own process group (see utils::apply_creation_flags).
    match signal::killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        // 이미 종료된 프로세스
        Err(Errno::ESRCH) => Ok(()),
        Err(_) => signal::kill(Pid::from_raw(pid as i32), sig).or_else(|e| match e {
            Errno::ESRCH => Ok(()),
            other => Err(SignalError::SignalFailed {
                pid,
                reason: other.to_string(),
            }),
        }),
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, _force: bool) -> Result<(), SignalError> {
    // Windows has no graceful signal for arbitrary processes; both paths terminate.
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(SignalError::SignalFailed {
                pid,
                reason: "OpenProcess failed".to_string(),
            });
        }
        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if result == 0 {
            return Err(SignalError::SignalFailed {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_exit_reports_exit_code() {
        let (tx, rx) = watch::channel(ExitState::Running);
        let handle = ProcessHandle::new(42, rx);
        assert_eq!(handle.pid(), 42);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(ExitState::Exited(Some(0)));
        });
        assert_eq!(handle.wait_exit(Duration::from_secs(2)).await, WaitOutcome::Exited(Some(0)));
        assert_eq!(handle.exit_state(), ExitState::Exited(Some(0)));
    }

    #[tokio::test]
    async fn wait_exit_times_out() {
        let (_tx, rx) = watch::channel(ExitState::Running);
        let handle = ProcessHandle::new(1, rx);
        assert_eq!(handle.wait_exit(Duration::from_millis(30)).await, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn wait_exit_detects_lost_watcher() {
        let (tx, rx) = watch::channel(ExitState::Running);
        let handle = ProcessHandle::new(1, rx);
        drop(tx);
        assert_eq!(handle.wait_exit(Duration::from_secs(1)).await, WaitOutcome::Lost);
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_vanished_pid_is_not_an_error() {
        // pid_max on Linux is far below this
        assert!(terminate(2_000_000_000).is_ok());
        assert!(force_kill(2_000_000_000).is_ok());
    }
}
