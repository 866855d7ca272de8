//! Response Types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ACTION ERRORS
// ============================================================================

/// Why an action executor could not do its job. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum ActionError {
    #[error("target not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
}

impl ActionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::NotFound(_) => "not_found",
            ActionError::PermissionDenied(_) => "permission_denied",
            ActionError::Unsupported(_) => "unsupported",
            ActionError::IoError(_) => "io_error",
            ActionError::InvalidTarget(_) => "invalid_target",
            ActionError::CommandFailed(_) => "command_failed",
        }
    }

    /// Map an io::Error from a file operation; a missing file is NotFound, anything else IoError
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ActionError::NotFound(format!("{}: {}", context, err)),
            _ => ActionError::IoError(format!("{}: {}", context, err)),
        }
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        detail: String,
    },
    Failure {
        error: ActionError,
        /// The failure itself says something about the attack (e.g. a locked file)
        evidentiary: bool,
    },
    Skipped {
        reason: String,
    },
}

impl Outcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Outcome::Success {
            detail: detail.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    /// `Unsupported` is a skip, `IoError` is evidentiary, the rest are plain failures
    pub fn from_error(error: ActionError) -> Self {
        match error {
            ActionError::Unsupported(reason) => Outcome::Skipped {
                reason: format!("unsupported: {}", reason),
            },
            ActionError::IoError(_) => Outcome::Failure {
                error,
                evidentiary: true,
            },
            other => Outcome::Failure {
                error: other,
                evidentiary: false,
            },
        }
    }

    pub fn from_result(result: Result<String, ActionError>) -> Self {
        match result {
            Ok(detail) => Outcome::success(detail),
            Err(e) => Outcome::from_error(e),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Skipped { .. } => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success { detail } => write!(f, "success: {}", detail),
            Outcome::Failure { error, evidentiary } => {
                write!(f, "failure: {}", error)?;
                if *evidentiary {
                    write!(f, " [evidentiary]")?;
                }
                Ok(())
            }
            Outcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

// ============================================================================
// ACTION RESULT
// ============================================================================

/// One executed (or skipped) action, appended to the alert's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub alert_id: u64,
    pub playbook: String,
    pub action_idx: usize,
    pub kind: String,
    pub target: Option<String>,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

// ============================================================================
// QUARANTINE TYPES
// ============================================================================

/// Quarantine entry, persisted as JSON next to the quarantined file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: String,
    pub original_path: PathBuf,
    pub quarantine_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub sha256: String,
    pub modified_time: Option<i64>,
    pub quarantine_time: i64,
    pub reason: String,
    pub alert_id: Option<u64>,
    pub can_restore: bool,
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Message written to the notification bus by `notify` actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub alert_id: u64,
    pub playbook: String,
    pub severity: crate::logic::detection::Severity,
    pub title: String,
    pub message: String,
    pub host: String,
    pub timestamp: DateTime<Utc>,
}
