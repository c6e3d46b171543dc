use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle shared by transfers and their chunks
///
/// ```text
/// Pending ──► InProgress ──► Complete
///    │  ▲         │  ▲  └───► Failed ──┐
///    │  │         ▼  │                 │ retry
///    │  └─────── Paused                ▼
///    └──────────────┴──────► Canceled ─► Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Not yet picked up by a worker
    Pending,

    /// At least one chunk operation has started
    InProgress,

    /// No new chunk operations are dequeued
    Paused,

    /// Every chunk completed and the finalize operation ran
    Complete,

    /// A chunk failed permanently; retryable on request
    Failed,

    /// Explicitly canceled; retryable on request
    Canceled,

    /// The record no longer exists
    Deleted,
}

impl TransferState {
    /// Terminal until an explicit retry (or forever, for complete/deleted)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Canceled | Self::Deleted
        )
    }

    /// Complete and deleted can never be left
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Complete | Self::Deleted)
    }

    /// Whether a pause request is meaningful
    pub fn is_pauseable(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Whether a resume request is meaningful
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Whether an explicit retry can move this state back to pending
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// Pending or in progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Whether `cancel` applies to this state
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::InProgress | Self::Paused | Self::Failed
        )
    }

    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Deleted => "deleted",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which way the bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who paused a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PauseReason {
    /// Explicit `pause` call; only `resume` lifts it
    User,

    /// Imposed by the network gate; only the gate lifts it
    Policy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(TransferState::Pending.is_pauseable());
        assert!(TransferState::InProgress.is_pauseable());
        assert!(!TransferState::Paused.is_pauseable());

        assert!(TransferState::Paused.is_resumable());
        assert!(!TransferState::Failed.is_resumable());

        assert!(TransferState::Failed.is_retryable());
        assert!(TransferState::Canceled.is_retryable());
        assert!(!TransferState::Complete.is_retryable());

        assert!(TransferState::Complete.is_final());
        assert!(TransferState::Deleted.is_final());
        assert!(!TransferState::Failed.is_final());
        assert!(TransferState::Failed.is_terminal());
    }

    #[test]
    fn test_display_uses_snake_case_name() {
        assert_eq!(TransferState::InProgress.to_string(), "in_progress");
        assert_eq!(TransferState::InProgress.label(), "In Progress");
        assert_eq!(Direction::Download.to_string(), "download");
    }
}
