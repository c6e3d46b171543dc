//! Live transfer table and the transfer state machine.
//!
//! All record mutation happens here, under one lock. Events are emitted while
//! the lock is held so that event sequence order matches mutation order.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chunk_io::ChunkContext;
use crate::clock::Clock;
use crate::error::{TransferError, TransferResult};
use crate::observer::ObserverHub;
use crate::planner;
use crate::types::{
    ChunkRecord, Direction, PauseReason, RemoteRef, TransferEventKind, TransferFilter, TransferId,
    TransferRecord, TransferSnapshot, TransferState,
};

struct TransferEntry {
    record: TransferRecord,
    chunks: Vec<ChunkRecord>,
    cancel_requested: bool,
    durable: bool,
}

impl TransferEntry {
    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot::from_record(&self.record, self.durable)
    }

    fn chunk_mut(&mut self, index: u32) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|chunk| chunk.index == index)
    }

    /// Chunks that still need to run, as `(index, attempts spent)`
    fn unsettled_chunks(&self) -> Vec<(u32, u32)> {
        self.chunks
            .iter()
            .filter(|chunk| {
                matches!(
                    chunk.state,
                    TransferState::Pending | TransferState::InProgress | TransferState::Paused
                )
            })
            .map(|chunk| (chunk.index, chunk.retry_count))
            .collect()
    }

    /// State a transfer returns to when it is resumed or retried
    fn running_state(&self) -> TransferState {
        let started = self.chunks.iter().any(|chunk| {
            matches!(chunk.state, TransferState::InProgress | TransferState::Complete)
        });
        if started {
            TransferState::InProgress
        } else {
            TransferState::Pending
        }
    }
}

/// Result of [`TransferTable::begin_chunk`]
pub(crate) enum ChunkStart {
    Run(ChunkRecord, ChunkContext),
    AlreadyComplete,
    Canceled,
}

/// Result of size discovery on the first download response
pub(crate) enum Discovery {
    /// Zero-length blob; the provisional chunk was dropped
    Empty,

    /// Newly planned chunks after the provisional one
    Remainder(Vec<ChunkRecord>),
}

/// What finalize has to do next
pub(crate) enum FinalizeStep {
    /// The transfer is gone
    Nothing,

    /// Chunks still need to run (added by a retry after finalize was queued)
    Reschedule(Vec<(u32, u32)>),

    /// Upload chunks are all staged; the block list must be committed
    Commit {
        remote: RemoteRef,
        block_ids: Vec<String>,
    },

    /// Transfer reached a terminal state
    Settled(TransferState),
}

/// Which chunk rows a persistence write should carry
pub(crate) enum ChunkRows<'a> {
    All,
    Only(&'a [u32]),
}

pub(crate) struct TransferTable {
    entries: Mutex<HashMap<TransferId, TransferEntry>>,
    hub: Arc<ObserverHub>,
    clock: Arc<dyn Clock>,
}

impl TransferTable {
    pub(crate) fn new(hub: Arc<ObserverHub>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hub,
            clock,
        }
    }

    fn emit(&self, entry: &TransferEntry, kind: TransferEventKind) {
        self.hub.emit(kind, entry.snapshot());
    }

    fn change_state(&self, entry: &mut TransferEntry, to: TransferState) {
        let from = entry.record.state;
        entry.record.update_state(to, self.clock.now());
        if from != to {
            self.emit(entry, TransferEventKind::StateChanged { from, to });
        }
    }

    fn pause_entry(&self, entry: &mut TransferEntry, reason: PauseReason) {
        let from = entry.record.state;
        for chunk in &mut entry.chunks {
            if chunk.state == TransferState::Pending {
                chunk.state = TransferState::Paused;
            }
        }
        entry.record.pause(reason, self.clock.now());
        self.emit(
            entry,
            TransferEventKind::StateChanged {
                from,
                to: TransferState::Paused,
            },
        );
    }

    fn set_pause_reason(&self, entry: &mut TransferEntry, reason: PauseReason) {
        if entry.record.pause_reason == Some(reason) {
            return;
        }
        entry.record.pause_reason = Some(reason);
        entry.record.updated_at = self.clock.now();
        self.emit(entry, TransferEventKind::PauseReasonChanged { reason });
    }

    fn lift_pause(&self, entry: &mut TransferEntry) {
        for chunk in &mut entry.chunks {
            if chunk.state == TransferState::Paused {
                chunk.state = TransferState::Pending;
            }
        }
        let to = entry.running_state();
        self.change_state(entry, to);
    }

    pub(crate) fn insert(&self, record: TransferRecord, chunks: Vec<ChunkRecord>) {
        let mut entries = self.entries.lock();
        let entry = TransferEntry {
            record,
            chunks,
            cancel_requested: false,
            durable: true,
        };
        self.emit(&entry, TransferEventKind::Created);
        entries.insert(entry.record.id.clone(), entry);
    }

    /// Load a persisted transfer. Work that was in flight when the process
    /// stopped goes back to pending. Returns the chunks to schedule as
    /// `(index, attempts spent)`, or `None` if the transfer is already live.
    pub(crate) fn restore(
        &self,
        mut record: TransferRecord,
        mut chunks: Vec<ChunkRecord>,
    ) -> Option<Vec<(u32, u32)>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&record.id) {
            return None;
        }

        if record.state == TransferState::InProgress {
            record.state = TransferState::Pending;
        }
        for chunk in &mut chunks {
            if chunk.state == TransferState::InProgress {
                chunk.state = if record.state == TransferState::Paused {
                    TransferState::Paused
                } else {
                    TransferState::Pending
                };
            }
        }

        let work = if record.state.is_active() || record.state == TransferState::Paused {
            chunks
                .iter()
                .filter(|chunk| matches!(chunk.state, TransferState::Pending | TransferState::Paused))
                .map(|chunk| (chunk.index, chunk.retry_count))
                .collect()
        } else {
            Vec::new()
        };

        let entry = TransferEntry {
            record,
            chunks,
            cancel_requested: false,
            durable: true,
        };
        self.emit(&entry, TransferEventKind::Created);
        entries.insert(entry.record.id.clone(), entry);
        Some(work)
    }

    pub(crate) fn contains(&self, id: &TransferId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub(crate) fn record(&self, id: &TransferId) -> Option<TransferRecord> {
        self.entries.lock().get(id).map(|entry| entry.record.clone())
    }

    pub(crate) fn chunks(&self, id: &TransferId) -> Option<Vec<ChunkRecord>> {
        self.entries.lock().get(id).map(|entry| entry.chunks.clone())
    }

    pub(crate) fn snapshot(&self, id: &TransferId) -> Option<TransferSnapshot> {
        self.entries.lock().get(id).map(TransferEntry::snapshot)
    }

    pub(crate) fn snapshots(&self, filter: &TransferFilter) -> Vec<TransferSnapshot> {
        let entries = self.entries.lock();
        let mut snapshots: Vec<(chrono::DateTime<chrono::Utc>, TransferSnapshot)> = entries
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .map(|entry| (entry.record.created_at, entry.snapshot()))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        snapshots.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    pub(crate) fn is_paused(&self, id: &TransferId) -> bool {
        self.entries
            .lock()
            .get(id)
            .map_or(false, |entry| entry.record.state == TransferState::Paused)
    }

    /// Rows for a persistence write, read at write time so they are the latest
    pub(crate) fn rows(&self, id: &TransferId, which: ChunkRows<'_>) -> Option<(TransferRecord, Vec<ChunkRecord>)> {
        let entries = self.entries.lock();
        let entry = entries.get(id)?;
        let chunks = match which {
            ChunkRows::All => entry.chunks.clone(),
            ChunkRows::Only(indices) => entry
                .chunks
                .iter()
                .filter(|chunk| indices.contains(&chunk.index))
                .cloned()
                .collect(),
        };
        Some((entry.record.clone(), chunks))
    }

    pub(crate) fn mark_durable(&self, id: &TransferId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.durable = true;
        }
    }

    pub(crate) fn persistence_failed(&self, id: &TransferId, error: String) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(id) {
            entry.durable = false;
            self.emit(entry, TransferEventKind::PersistenceWarning { error });
        }
    }

    /// Mark a chunk in progress and hand out what the adapter needs
    pub(crate) fn begin_chunk(&self, id: &TransferId, index: u32) -> ChunkStart {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return ChunkStart::Canceled;
        };
        if entry.cancel_requested {
            return ChunkStart::Canceled;
        }

        let chunk = match entry.chunk_mut(index) {
            Some(chunk) if chunk.is_complete() => return ChunkStart::AlreadyComplete,
            Some(chunk) => {
                chunk.state = TransferState::InProgress;
                chunk.clone()
            }
            None => return ChunkStart::AlreadyComplete,
        };

        if entry.record.state == TransferState::Pending {
            self.change_state(entry, TransferState::InProgress);
        }

        ChunkStart::Run(chunk, ChunkContext::from_record(&entry.record))
    }

    /// Record the size and ETag reported by the first download response and
    /// plan the rest of the blob after the provisional chunk.
    pub(crate) fn discover_size(
        &self,
        id: &TransferId,
        index: u32,
        total: u64,
        etag: Option<String>,
    ) -> TransferResult<Discovery> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        if entry.record.total_bytes.is_none() {
            entry.record.total_bytes = Some(total);
        }
        if entry.record.etag.is_none() {
            entry.record.etag = etag;
        }
        entry.record.updated_at = self.clock.now();

        if total == 0 {
            entry.chunks.retain(|chunk| chunk.index != index);
            return Ok(Discovery::Empty);
        }

        let provisional_end = match entry.chunk_mut(index) {
            Some(chunk) => {
                let end = chunk.end;
                chunk.end = end.min(total);
                end
            }
            None => return Ok(Discovery::Remainder(Vec::new())),
        };

        let ranges = planner::plan_from(
            provisional_end,
            Some(total),
            entry.record.chunk_size,
            entry.record.alignment,
        )?;
        let paused = entry.record.state == TransferState::Paused;
        let first_index = entry.chunks.iter().map(|chunk| chunk.index + 1).max().unwrap_or(0);

        let remainder: Vec<ChunkRecord> = ranges
            .into_iter()
            .enumerate()
            .map(|(offset, range)| {
                let mut chunk = ChunkRecord::new(id.clone(), first_index + offset as u32, range);
                if paused {
                    chunk.state = TransferState::Paused;
                }
                chunk
            })
            .collect();

        entry.chunks.extend(remainder.iter().cloned());
        Ok(Discovery::Remainder(remainder))
    }

    /// Mark a chunk complete and add its bytes once. Returns false if the
    /// chunk was already complete or no longer exists.
    pub(crate) fn complete_chunk(&self, id: &TransferId, index: u32, bytes: u64, etag: Option<String>) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        let Some(chunk) = entry.chunk_mut(index) else {
            return false;
        };
        if chunk.is_complete() {
            return false;
        }

        chunk.state = TransferState::Complete;
        chunk.bytes_transferred = bytes;
        chunk.last_error = None;

        entry.record.bytes_transferred += bytes;
        if entry.record.direction == Direction::Download && entry.record.etag.is_none() {
            entry.record.etag = etag;
        }
        entry.record.updated_at = self.clock.now();

        self.emit(
            entry,
            TransferEventKind::Progress {
                chunk_index: index,
                chunk_bytes: bytes,
            },
        );
        true
    }

    pub(crate) fn chunk_retrying(&self, id: &TransferId, index: u32, attempt: u32, error: String) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        let paused = entry.record.state == TransferState::Paused;
        let Some(chunk) = entry.chunk_mut(index) else {
            return;
        };
        if chunk.is_complete() {
            return;
        }

        chunk.retry_count += 1;
        chunk.last_error = Some(error.clone());
        chunk.state = if paused {
            TransferState::Paused
        } else {
            TransferState::Pending
        };

        self.emit(
            entry,
            TransferEventKind::Retrying {
                chunk_index: index,
                attempt,
                error,
            },
        );
    }

    /// A chunk failed for good: the transfer fails now, siblings keep running
    pub(crate) fn chunk_failed(&self, id: &TransferId, index: u32, error: String) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        let Some(chunk) = entry.chunk_mut(index) else {
            return;
        };
        if chunk.is_complete() {
            return;
        }

        chunk.retry_count += 1;
        chunk.last_error = Some(error.clone());
        chunk.state = TransferState::Failed;

        if entry.cancel_requested || entry.record.state.is_terminal() {
            return;
        }
        entry.record.last_error = Some(error);
        self.change_state(entry, TransferState::Failed);
    }

    /// Settle chunks dropped from the queue by a cancel
    pub(crate) fn chunks_canceled(&self, id: &TransferId, indices: &[u32]) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        for chunk in entry.chunks.iter_mut() {
            if indices.contains(&chunk.index) && !chunk.is_complete() {
                chunk.state = TransferState::Canceled;
            }
        }
    }

    pub(crate) fn finalize(&self, id: &TransferId) -> FinalizeStep {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return FinalizeStep::Nothing;
        };

        // Finalize only runs once every chunk operation has settled, so
        // nothing is still executing here. A cancel that lost the race with
        // the last running chunk has nothing left to stop.
        if entry.cancel_requested {
            let stopped = entry.chunks.iter().any(|chunk| !chunk.is_complete());
            if stopped {
                for chunk in entry.chunks.iter_mut() {
                    if !chunk.is_complete() {
                        chunk.state = TransferState::Canceled;
                    }
                }
                self.change_state(entry, TransferState::Canceled);
                return FinalizeStep::Settled(TransferState::Canceled);
            }
            entry.cancel_requested = false;
        }

        let unsettled = entry.unsettled_chunks();
        if !unsettled.is_empty() {
            return FinalizeStep::Reschedule(unsettled);
        }

        if entry.record.state.is_terminal() {
            return FinalizeStep::Settled(entry.record.state);
        }

        if entry.chunks.iter().all(ChunkRecord::is_complete) {
            if entry.record.direction == Direction::Upload {
                let mut chunks: Vec<&ChunkRecord> = entry.chunks.iter().collect();
                chunks.sort_by_key(|chunk| chunk.index);
                let block_ids = chunks
                    .into_iter()
                    .filter_map(|chunk| chunk.block_id.clone())
                    .collect();
                return FinalizeStep::Commit {
                    remote: entry.record.remote.clone(),
                    block_ids,
                };
            }
            self.change_state(entry, TransferState::Complete);
            return FinalizeStep::Settled(TransferState::Complete);
        }

        let error = entry
            .chunks
            .iter()
            .find_map(|chunk| chunk.last_error.clone())
            .unwrap_or_else(|| "chunk did not complete".to_string());
        entry.record.last_error = Some(error);
        self.change_state(entry, TransferState::Failed);
        FinalizeStep::Settled(TransferState::Failed)
    }

    /// Outcome of the upload block-list commit
    pub(crate) fn commit_finished(&self, id: &TransferId, result: Result<(), String>) -> Option<TransferState> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id)?;
        if entry.record.state.is_terminal() {
            return Some(entry.record.state);
        }

        match result {
            Ok(()) => self.change_state(entry, TransferState::Complete),
            Err(error) => {
                entry.record.last_error = Some(format!("block list commit failed: {}", error));
                self.change_state(entry, TransferState::Failed);
            }
        }
        Some(entry.record.state)
    }

    /// Pause a transfer. Returns true if the scheduler has to stop dequeuing it.
    pub(crate) fn pause(&self, id: &TransferId, reason: PauseReason) -> TransferResult<bool> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        let state = entry.record.state;
        match state {
            TransferState::Paused => {
                // A user pause outranks a policy pause; the reverse is a no-op
                if reason == PauseReason::User {
                    self.set_pause_reason(entry, PauseReason::User);
                }
                Ok(false)
            }
            state if state.is_pauseable() && !entry.cancel_requested => {
                self.pause_entry(entry, reason);
                Ok(true)
            }
            state => Err(TransferError::invalid(id, state, "pause")),
        }
    }

    /// Lift a user pause. Returns false when the gate currently denies the
    /// transfer's direction, in which case the pause becomes a policy pause.
    pub(crate) fn resume(&self, id: &TransferId, gate_allows: bool) -> TransferResult<bool> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        if !entry.record.state.is_resumable() {
            return Err(TransferError::invalid(id, entry.record.state, "resume"));
        }
        if entry.record.is_policy_paused() {
            return Err(TransferError::PolicyPaused(id.clone()));
        }
        if !gate_allows {
            self.set_pause_reason(entry, PauseReason::Policy);
            return Ok(false);
        }

        self.lift_pause(entry);
        Ok(true)
    }

    /// Policy-pause every active transfer in `direction`
    pub(crate) fn policy_pause(&self, direction: Direction) -> Vec<TransferId> {
        let mut entries = self.entries.lock();
        let mut paused = Vec::new();
        for entry in entries.values_mut() {
            if entry.record.direction == direction
                && entry.record.state.is_pauseable()
                && !entry.cancel_requested
            {
                self.pause_entry(entry, PauseReason::Policy);
                paused.push(entry.record.id.clone());
            }
        }
        paused
    }

    /// Resume every policy-paused transfer in `direction`
    pub(crate) fn policy_resume(&self, direction: Direction) -> Vec<TransferId> {
        let mut entries = self.entries.lock();
        let mut resumed = Vec::new();
        for entry in entries.values_mut() {
            if entry.record.direction == direction && entry.record.is_policy_paused() {
                self.lift_pause(entry);
                resumed.push(entry.record.id.clone());
            }
        }
        resumed
    }

    /// Hand every policy-paused transfer in `direction` over to the user:
    /// the transfer stays paused until an explicit `resume`
    pub(crate) fn policy_hold(&self, direction: Direction) -> Vec<TransferId> {
        let mut entries = self.entries.lock();
        let mut held = Vec::new();
        for entry in entries.values_mut() {
            if entry.record.direction == direction && entry.record.is_policy_paused() {
                self.set_pause_reason(entry, PauseReason::User);
                held.push(entry.record.id.clone());
            }
        }
        held
    }

    /// Lift a policy pause on one transfer (restored while the gate allows)
    pub(crate) fn policy_resume_one(&self, id: &TransferId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) if entry.record.is_policy_paused() => {
                self.lift_pause(entry);
                true
            }
            _ => false,
        }
    }

    /// Keep a restored policy pause as a user pause
    pub(crate) fn policy_hold_one(&self, id: &TransferId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) if entry.record.is_policy_paused() => {
                self.set_pause_reason(entry, PauseReason::User);
                true
            }
            _ => false,
        }
    }

    /// Live transfer IDs whose record matches `filter`, oldest first
    pub(crate) fn ids_where(&self, filter: &TransferFilter) -> Vec<TransferId> {
        let entries = self.entries.lock();
        let mut matching: Vec<&TransferRecord> = entries
            .values()
            .map(|entry| &entry.record)
            .filter(|record| filter.matches(record))
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matching.into_iter().map(|record| record.id.clone()).collect()
    }

    pub(crate) fn cancel(&self, id: &TransferId) -> TransferResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        if !entry.record.state.is_cancelable() {
            return Err(TransferError::invalid(id, entry.record.state, "cancel"));
        }
        entry.cancel_requested = true;
        entry.record.updated_at = self.clock.now();
        Ok(())
    }

    /// Reset failed and canceled chunks. Returns the chunks to schedule.
    pub(crate) fn retry(&self, id: &TransferId) -> TransferResult<Vec<(u32, u32)>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        if !entry.record.state.is_retryable() {
            return Err(TransferError::invalid(id, entry.record.state, "retry"));
        }

        let mut work = Vec::new();
        for chunk in entry.chunks.iter_mut() {
            match chunk.state {
                TransferState::Failed | TransferState::Canceled => {
                    chunk.reset_for_retry();
                    work.push((chunk.index, 0));
                }
                TransferState::Pending | TransferState::Paused => {
                    chunk.state = TransferState::Pending;
                    work.push((chunk.index, chunk.retry_count));
                }
                _ => {}
            }
        }

        entry.cancel_requested = false;
        entry.record.last_error = None;
        let to = entry.running_state();
        self.change_state(entry, to);
        Ok(work)
    }

    /// Drop a terminal transfer from the table
    pub(crate) fn remove(&self, id: &TransferId) -> TransferResult<TransferRecord> {
        let mut entries = self.entries.lock();
        let state = entries
            .get(id)
            .map(|entry| entry.record.state)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        if !state.is_terminal() {
            return Err(TransferError::invalid(id, state, "remove"));
        }

        let mut entry = entries
            .remove(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        entry.record.update_state(TransferState::Deleted, self.clock.now());
        self.emit(&entry, TransferEventKind::Removed);
        Ok(entry.record)
    }
}
