//! Supervisor errors. Callers (REST layer, CLI) match on the variant or use
//! `error_code()` to map failures onto their own responses.

/// Errors surfaced synchronously by supervisor operations.
///
/// Per-process runtime failures (launch errors, probe failures, timeouts) are
/// never returned here; they are folded into status transitions instead.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Process '{0}' not found")]
    NoSuchProcess(String),

    #[error("Group '{0}' not found")]
    NoSuchGroup(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to launch '{name}': {reason}")]
    Launch { name: String, reason: String },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSuchProcess(_) => "NO_SUCH_PROCESS",
            Self::NoSuchGroup(_) => "NO_SUCH_GROUP",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Launch { .. } => "LAUNCH_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON error body for collaborators that speak JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl From<crate::config::ConfigError> for SupervisorError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
