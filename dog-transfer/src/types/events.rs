use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Direction, PauseReason, TransferId, TransferRecord, TransferState};

/// Point-in-time copy of a transfer handed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub direction: Direction,
    pub state: TransferState,
    pub pause_reason: Option<PauseReason>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,

    /// False once a persistence write for this transfer has failed
    pub durable: bool,
}

impl TransferSnapshot {
    pub fn from_record(record: &TransferRecord, durable: bool) -> Self {
        Self {
            id: record.id.clone(),
            direction: record.direction,
            state: record.state,
            pause_reason: record.pause_reason,
            bytes_transferred: record.bytes_transferred,
            total_bytes: record.total_bytes,
            error: record.last_error.clone(),
            durable,
        }
    }
}

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferEventKind {
    /// Transfer record was created
    Created,

    /// Transfer moved between lifecycle states
    StateChanged {
        from: TransferState,
        to: TransferState,
    },

    /// A paused transfer changed hands between the user and the network gate
    PauseReasonChanged { reason: PauseReason },

    /// A chunk completed and the byte counter advanced
    Progress { chunk_index: u32, chunk_bytes: u64 },

    /// A chunk attempt failed and was re-queued
    Retrying {
        chunk_index: u32,
        attempt: u32,
        error: String,
    },

    /// A store write failed; the transfer keeps running in memory
    PersistenceWarning { error: String },

    /// Record was removed from the engine and the store
    Removed,
}

impl TransferEventKind {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StateChanged { .. } => "state_changed",
            Self::PauseReasonChanged { .. } => "pause_reason_changed",
            Self::Progress { .. } => "progress",
            Self::Retrying { .. } => "retrying",
            Self::PersistenceWarning { .. } => "persistence_warning",
            Self::Removed => "removed",
        }
    }
}

/// Notification delivered to every registered observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Strictly increasing in generation order across all transfers
    pub seq: u64,
    pub kind: TransferEventKind,
    pub snapshot: TransferSnapshot,
    pub at: DateTime<Utc>,
}

impl TransferEvent {
    /// Get the transfer ID this event is about
    pub fn transfer_id(&self) -> &TransferId {
        &self.snapshot.id
    }

    pub fn event_name(&self) -> &'static str {
        self.kind.event_name()
    }

    /// True when the event moved the transfer into `state`
    pub fn entered(&self, state: TransferState) -> bool {
        matches!(self.kind, TransferEventKind::StateChanged { to, .. } if to == state)
    }
}
