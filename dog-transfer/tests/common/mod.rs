#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use dog_transfer::store::file::JsonFileStore;
use dog_transfer::transport::Headers;
use dog_transfer::{
    ChunkRecord, ChunkTransport, MemoryBlobTransport, MemoryTransferStore, RangeRequest, RangedGet,
    RangedPut, RemoteRef, RestorationId, TransferConfig, TransferEngine, TransferError, TransferHandle,
    TransferRecord, TransferResult, TransferSnapshot, TransferState, TransferStore, TransportError,
};

/// Memory blob service wrapper that can delay, hold or fail requests by range start
#[derive(Clone)]
pub struct ScriptedTransport {
    pub blobs: MemoryBlobTransport,
    state: Arc<Script>,
}

#[derive(Default)]
struct Script {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Mutex<Duration>,
    failures: Mutex<HashMap<u64, VecDeque<TransportError>>>,
    requests: Mutex<HashMap<u64, usize>>,
    held: Mutex<HashSet<u64>>,
    released: Notify,
}

struct InFlight<'a>(&'a Script);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            blobs: MemoryBlobTransport::new(),
            state: Arc::new(Script::default()),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Queue failures for the next requests starting at `start`
    pub fn fail(&self, start: u64, errors: impl IntoIterator<Item = TransportError>) {
        self.state
            .failures
            .lock()
            .entry(start)
            .or_default()
            .extend(errors);
    }

    /// Block requests starting at `start` until released
    pub fn hold(&self, start: u64) {
        self.state.held.lock().insert(start);
    }

    pub fn release(&self, start: u64) {
        self.state.held.lock().remove(&start);
        self.state.released.notify_waiters();
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self, start: u64) -> usize {
        self.state.requests.lock().get(&start).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state.requests.lock().values().sum()
    }

    async fn enter(&self, start: u64) -> Result<InFlight<'_>, TransportError> {
        *self.state.requests.lock().entry(start).or_insert(0) += 1;

        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.state);

        loop {
            let released = self.state.released.notified();
            if !self.state.held.lock().contains(&start) {
                break;
            }
            released.await;
        }

        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = self
            .state
            .failures
            .lock()
            .get_mut(&start)
            .and_then(|queue| queue.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn ranged_get(&self, request: RangeRequest) -> Result<RangedGet, TransportError> {
        let _guard = self.enter(request.range.start).await?;
        self.blobs.ranged_get(request).await
    }

    async fn ranged_put(&self, request: RangeRequest, data: Bytes) -> Result<RangedPut, TransportError> {
        let _guard = self.enter(request.range.start).await?;
        self.blobs.ranged_put(request, data).await
    }

    async fn commit_blocks(
        &self,
        remote: &RemoteRef,
        block_ids: &[String],
        headers: &Headers,
    ) -> Result<(), TransportError> {
        self.blobs.commit_blocks(remote, block_ids, headers).await
    }
}

/// Store whose writes always fail; reads come back empty
#[derive(Default)]
pub struct FailingStore;

#[async_trait]
impl TransferStore for FailingStore {
    async fn save_transfer(&self, _record: &TransferRecord) -> TransferResult<()> {
        Err(TransferError::persistence("disk quota exceeded"))
    }

    async fn save_chunks(&self, _chunks: &[ChunkRecord]) -> TransferResult<()> {
        Err(TransferError::persistence("disk quota exceeded"))
    }

    async fn delete_chunk(&self, _transfer_id: &dog_transfer::TransferId, _index: u32) -> TransferResult<()> {
        Err(TransferError::persistence("disk quota exceeded"))
    }

    async fn load_all(
        &self,
        _restoration_id: &RestorationId,
    ) -> TransferResult<Vec<dog_transfer::StoredTransfer>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _transfer_id: &dog_transfer::TransferId) -> TransferResult<()> {
        Err(TransferError::persistence("disk quota exceeded"))
    }
}

/// Memory store that counts combined and split row writes
#[derive(Default)]
pub struct CountingStore {
    pub rows: MemoryTransferStore,
    saves: AtomicUsize,
    split_writes: AtomicUsize,
}

impl CountingStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn split_writes(&self) -> usize {
        self.split_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferStore for CountingStore {
    async fn save_transfer(&self, record: &TransferRecord) -> TransferResult<()> {
        self.split_writes.fetch_add(1, Ordering::SeqCst);
        self.rows.save_transfer(record).await
    }

    async fn save_chunks(&self, chunks: &[ChunkRecord]) -> TransferResult<()> {
        self.split_writes.fetch_add(1, Ordering::SeqCst);
        self.rows.save_chunks(chunks).await
    }

    async fn save(&self, record: &TransferRecord, chunks: &[ChunkRecord]) -> TransferResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.rows.save(record, chunks).await
    }

    async fn delete_chunk(&self, transfer_id: &dog_transfer::TransferId, index: u32) -> TransferResult<()> {
        self.rows.delete_chunk(transfer_id, index).await
    }

    async fn load_all(
        &self,
        restoration_id: &RestorationId,
    ) -> TransferResult<Vec<dog_transfer::StoredTransfer>> {
        self.rows.load_all(restoration_id).await
    }

    async fn delete(&self, transfer_id: &dog_transfer::TransferId) -> TransferResult<()> {
        self.rows.delete(transfer_id).await
    }
}

/// Test factory functions
pub const CHUNK: u64 = 1024;

pub fn remote() -> RemoteRef {
    RemoteRef::new("media", "tracks/session.wav")
}

pub fn test_config() -> TransferConfig {
    TransferConfig::default()
        .with_chunk_size(CHUNK)
        .with_max_concurrency(4)
        .with_max_attempts(3)
        .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_chunk_timeout(Duration::from_secs(5))
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn create_test_engine(transport: &ScriptedTransport, config: TransferConfig) -> TransferEngine {
    TransferEngine::new(
        Arc::new(transport.clone()),
        Arc::new(MemoryTransferStore::new()),
        config,
    )
    .unwrap()
}

pub async fn create_file_engine(
    transport: &ScriptedTransport,
    path: &Path,
    config: TransferConfig,
) -> TransferEngine {
    let store = JsonFileStore::open(path).await.unwrap();
    TransferEngine::new(Arc::new(transport.clone()), Arc::new(store), config).unwrap()
}

/// Poll until the snapshot satisfies `done`
pub async fn wait_for(
    engine: &TransferEngine,
    handle: &TransferHandle,
    done: impl Fn(&TransferSnapshot) -> bool,
) -> TransferSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = engine.snapshot(handle).unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on transfer, last snapshot: {:?}",
            snapshot
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(engine: &TransferEngine, handle: &TransferHandle, state: TransferState) -> TransferSnapshot {
    wait_for(engine, handle, |snapshot| snapshot.state == state).await
}

/// Poll until the chunk rows satisfy `done`
pub async fn wait_for_chunks(
    engine: &TransferEngine,
    handle: &TransferHandle,
    done: impl Fn(&[ChunkRecord]) -> bool,
) -> Vec<ChunkRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let chunks = engine.chunks(handle).unwrap();
        if done(&chunks) {
            return chunks;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on chunks: {:?}",
            chunks.iter().map(|chunk| (chunk.index, chunk.state)).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until no chunk operation is executing
pub async fn wait_idle(engine: &TransferEngine) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.in_flight() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "engine never went idle");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn state_of(chunks: &[ChunkRecord], index: u32) -> TransferState {
    chunks
        .iter()
        .find(|chunk| chunk.index == index)
        .map(|chunk| chunk.state)
        .unwrap_or(TransferState::Deleted)
}
