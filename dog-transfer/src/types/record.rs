use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::{ByteRange, Direction, PauseReason, RestorationId, TransferId, TransferState};

/// Location of a blob on the remote service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub container: String,
    pub blob: String,
}

impl RemoteRef {
    pub fn new(container: impl Into<String>, blob: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            blob: blob.into(),
        }
    }

    /// Path component used by URL-based transports: `container/blob`
    pub fn path(&self) -> String {
        format!("{}/{}", self.container, self.blob)
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.blob)
    }
}

/// Transfer record - one row per blob move
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Unique transfer identifier
    pub id: TransferId,

    pub direction: Direction,

    pub remote: RemoteRef,

    pub local: PathBuf,

    /// Unknown for downloads until the first chunk response arrives
    pub total_bytes: Option<u64>,

    /// Sum of bytes over complete chunks
    pub bytes_transferred: u64,

    pub state: TransferState,

    /// Set while `state == Paused`
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,

    /// Engine instance that owns this transfer
    pub restoration_id: RestorationId,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Last chunk error, copied here when the transfer fails
    pub last_error: Option<String>,

    /// Chunk size used to plan this transfer
    pub chunk_size: u64,

    /// Payload alignment used to plan this transfer
    #[serde(default)]
    pub alignment: u64,

    /// ETag pinned by the first download response
    #[serde(default)]
    pub etag: Option<String>,
}

impl TransferRecord {
    /// Create a new pending transfer record
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        remote: RemoteRef,
        local: PathBuf,
        total_bytes: Option<u64>,
        restoration_id: RestorationId,
        chunk_size: u64,
        alignment: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransferId::new(),
            direction,
            remote,
            local,
            total_bytes,
            bytes_transferred: 0,
            state: TransferState::Pending,
            pause_reason: None,
            restoration_id,
            created_at: now,
            updated_at: now,
            last_error: None,
            chunk_size,
            alignment,
            etag: None,
        }
    }

    /// Update the state and timestamp
    pub fn update_state(&mut self, state: TransferState, now: DateTime<Utc>) {
        self.state = state;
        if state != TransferState::Paused {
            self.pause_reason = None;
        }
        self.updated_at = now;
    }

    /// Pause with the given reason
    pub fn pause(&mut self, reason: PauseReason, now: DateTime<Utc>) {
        self.state = TransferState::Paused;
        self.pause_reason = Some(reason);
        self.updated_at = now;
    }

    pub fn is_policy_paused(&self) -> bool {
        self.state == TransferState::Paused && self.pause_reason == Some(PauseReason::Policy)
    }

    /// Fraction of known bytes transferred, if the size is known
    pub fn progress(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_transferred as f64 / total as f64),
            None => None,
        }
    }
}

/// Chunk record - one row per byte range of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Owning transfer (plain ID lookup, never a back-pointer)
    pub transfer_id: TransferId,

    /// Zero-based position in the plan
    pub index: u32,

    pub start: u64,

    /// Exclusive
    pub end: u64,

    pub state: TransferState,

    pub bytes_transferred: u64,

    /// Failed attempts spent since the last explicit retry
    pub retry_count: u32,

    /// Upload block identifier committed by the finalize step
    #[serde(default)]
    pub block_id: Option<String>,

    #[serde(default)]
    pub last_error: Option<String>,
}

impl ChunkRecord {
    pub fn new(transfer_id: TransferId, index: u32, range: ByteRange) -> Self {
        Self {
            transfer_id,
            index,
            start: range.start,
            end: range.end,
            state: TransferState::Pending,
            bytes_transferred: 0,
            retry_count: 0,
            block_id: None,
            last_error: None,
        }
    }

    pub fn with_block_id(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }

    pub fn len(&self) -> u64 {
        self.range().len()
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Complete
    }

    /// Put the chunk back to pending after an explicit retry request
    pub fn reset_for_retry(&mut self) {
        self.state = TransferState::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.bytes_transferred = 0;
    }
}
