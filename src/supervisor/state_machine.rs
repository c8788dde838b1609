use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NotStarted,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Aborted,
    Finished,
    Failed,
    FailedToStart,
    Unknown,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 12] = [
        Self::NotStarted,
        Self::Starting,
        Self::Running,
        Self::Healthy,
        Self::Unhealthy,
        Self::Stopping,
        Self::Stopped,
        Self::Aborted,
        Self::Finished,
        Self::Failed,
        Self::FailedToStart,
        Self::Unknown,
    ];

    /// Map a process exit code to the status the completion watcher reports.
    ///
    /// Signal deaths arrive as `128 + signal`, so SIGTERM is 143 and SIGKILL 137.
    /// A missing code means the wait itself was interrupted.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::Finished,
            Some(1) => Self::Failed,
            Some(143) => Self::Stopped,
            Some(137) => Self::Aborted,
            _ => Self::Unknown,
        }
    }

    /// 실행 중으로 간주되는 상태 (health 상태 포함)
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Healthy | Self::Unhealthy)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished
                | Self::Failed
                | Self::FailedToStart
                | Self::Stopped
                | Self::Aborted
                | Self::Unknown
        )
    }

    /// A new start is accepted from these states.
    pub fn can_start(self) -> bool {
        self == Self::NotStarted || self.is_terminal()
    }

    /// Whether `self -> to` is one of the documented transitions.
    pub fn can_transition(self, to: ProcessStatus) -> bool {
        use ProcessStatus::*;
        match (self, to) {
            (from, Starting) => from.can_start(),
            (Starting, Running) | (Starting, FailedToStart) => true,
            (from, Healthy) | (from, Unhealthy) => from.is_alive(),
            (from, Stopping) => from.is_alive(),
            (Stopping, Stopped) | (Stopping, Aborted) | (Stopping, Unknown) => true,
            (from, Finished | Failed | Stopped | Aborted | Unknown) => from.is_alive(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::FailedToStart => "failed_to_start",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("unknown process status '{}'", s))
    }
}
