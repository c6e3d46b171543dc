use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::chunk_io::{self, ChunkTransferAdapter};
use crate::clock::{Clock, SystemClock};
use crate::config::{DownloadOptions, TransferConfig, UploadOptions};
use crate::error::{ChunkError, TransferError, TransferResult, TransportError};
use crate::gate::{ConnectivityClass, NetworkGate};
use crate::observer::{BoxStream, ObserverHub, ObserverId, TransferObserver};
use crate::planner;
use crate::scheduler::{ChunkOutcome, OperationRunner, RetryPolicy, Scheduler};
use crate::store::{MemoryTransferStore, TransferStore};
use crate::table::{ChunkRows, ChunkStart, Discovery, FinalizeStep, TransferTable};
use crate::transport::{
    new_block_id, ChunkTransport, CredentialProvider, IdentityTransform, NoCredentials, PayloadTransform,
};
use crate::types::{
    ChunkRecord, Direction, PauseReason, RemoteRef, RestorationId, TransferEvent, TransferFilter,
    TransferId, TransferRecord, TransferSnapshot, TransferState,
};

/// Opaque reference to a transfer owned by an engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    id: TransferId,
}

impl TransferHandle {
    pub fn new(id: TransferId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }
}

impl From<TransferId> for TransferHandle {
    fn from(id: TransferId) -> Self {
        Self::new(id)
    }
}

/// Builder for [`TransferEngine`] - collaborators are injected here
pub struct TransferEngineBuilder {
    transport: Arc<dyn ChunkTransport>,
    store: Arc<dyn TransferStore>,
    credentials: Arc<dyn CredentialProvider>,
    transform: Arc<dyn PayloadTransform>,
    clock: Arc<dyn Clock>,
    config: TransferConfig,
    runtime: Option<Handle>,
    delivery_runtime: Option<Handle>,
}

impl TransferEngineBuilder {
    /// Persistence backend (defaults to [`MemoryTransferStore`])
    pub fn store(mut self, store: Arc<dyn TransferStore>) -> Self {
        self.store = store;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime the workers run on (defaults to the current runtime)
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Runtime observer callbacks are delivered on (defaults to the worker runtime)
    pub fn delivery_runtime(mut self, handle: Handle) -> Self {
        self.delivery_runtime = Some(handle);
        self
    }

    /// Validate the configuration and start the worker pool
    pub fn build(self) -> TransferResult<TransferEngine> {
        if self.config.chunk_size == 0 {
            return Err(TransferError::configuration("chunk_size must be greater than zero"));
        }
        if self.config.max_attempts == 0 {
            return Err(TransferError::configuration("max_attempts must be at least one"));
        }

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|_| TransferError::configuration("no tokio runtime available"))?,
        };
        let delivery = self.delivery_runtime.unwrap_or_else(|| runtime.clone());

        let hub = Arc::new(ObserverHub::new(&delivery, self.clock.clone()));
        let table = TransferTable::new(hub.clone(), self.clock.clone());
        let scheduler = Arc::new(Scheduler::new(RetryPolicy {
            max_attempts: self.config.max_attempts,
            base: self.config.retry_backoff,
            max: self.config.max_retry_backoff,
        }));
        let gate = NetworkGate::new(
            self.config.initial_connectivity,
            self.config.upload_policy.clone(),
            self.config.download_policy.clone(),
        );
        let adapter = ChunkTransferAdapter::new(
            self.transport,
            self.credentials,
            self.transform.clone(),
            self.config.chunk_timeout,
        );

        let inner = Arc::new(EngineInner {
            config: self.config,
            table,
            scheduler,
            adapter,
            transform: self.transform,
            store: self.store,
            gate,
            hub,
            clock: self.clock,
            runtime,
            persist_lock: tokio::sync::Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let runner: Weak<dyn OperationRunner> = weak;
        inner
            .scheduler
            .start(&inner.runtime, runner, inner.config.max_concurrency);

        info!(
            restoration_id = %inner.config.restoration_id,
            workers = inner.config.max_concurrency.max(1),
            "transfer engine started"
        );
        Ok(TransferEngine { inner })
    }
}

/// Chunked, resumable blob transfer engine.
///
/// Cloning is cheap; clones share the same transfers and worker pool.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: TransferConfig,
    table: TransferTable,
    scheduler: Arc<Scheduler>,
    adapter: ChunkTransferAdapter,
    transform: Arc<dyn PayloadTransform>,
    store: Arc<dyn TransferStore>,
    gate: NetworkGate,
    hub: Arc<ObserverHub>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    persist_lock: tokio::sync::Mutex<()>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TransferEngine {
    /// Start building an engine around a transport
    pub fn builder(transport: Arc<dyn ChunkTransport>) -> TransferEngineBuilder {
        TransferEngineBuilder {
            transport,
            store: Arc::new(MemoryTransferStore::new()),
            credentials: Arc::new(NoCredentials),
            transform: Arc::new(IdentityTransform),
            clock: Arc::new(SystemClock),
            config: TransferConfig::default(),
            runtime: None,
            delivery_runtime: None,
        }
    }

    /// Engine with default collaborators, on the current runtime
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        store: Arc<dyn TransferStore>,
        config: TransferConfig,
    ) -> TransferResult<Self> {
        Self::builder(transport).store(store).config(config).build()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Download `remote` into `local`
    #[instrument(skip(self, remote, local, options), fields(remote = %remote, local = %local.display()))]
    pub async fn start_download(
        &self,
        remote: RemoteRef,
        local: PathBuf,
        options: DownloadOptions,
    ) -> TransferResult<TransferHandle> {
        self.inner.ensure_running()?;
        validate_endpoints(&remote, &local)?;

        let chunk_size = options.chunk_size.unwrap_or(self.inner.config.chunk_size);
        let alignment = self.inner.transform.alignment();
        let ranges = planner::plan(options.total_bytes, chunk_size, alignment)?;

        chunk_io::prepare_target(&local, options.total_bytes).await?;

        let record = TransferRecord::new(
            Direction::Download,
            remote,
            local,
            options.total_bytes,
            self.inner.config.restoration_id.clone(),
            chunk_size,
            alignment,
            self.inner.clock.now(),
        );
        let chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| ChunkRecord::new(record.id.clone(), index as u32, range))
            .collect();

        self.inner.start_transfer(record, chunks).await
    }

    /// Upload `local` to `remote`
    #[instrument(skip(self, local, remote, options), fields(remote = %remote, local = %local.display()))]
    pub async fn start_upload(
        &self,
        local: PathBuf,
        remote: RemoteRef,
        options: UploadOptions,
    ) -> TransferResult<TransferHandle> {
        self.inner.ensure_running()?;
        validate_endpoints(&remote, &local)?;

        let metadata = tokio::fs::metadata(&local).await.map_err(|e| {
            TransferError::planning(format!("upload source {} is not readable: {}", local.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(TransferError::planning(format!(
                "upload source {} is not a file",
                local.display()
            )));
        }

        let chunk_size = options.chunk_size.unwrap_or(self.inner.config.chunk_size);
        let alignment = self.inner.transform.alignment();
        let ranges = planner::plan(Some(metadata.len()), chunk_size, alignment)?;

        let record = TransferRecord::new(
            Direction::Upload,
            remote,
            local,
            Some(metadata.len()),
            self.inner.config.restoration_id.clone(),
            chunk_size,
            alignment,
            self.inner.clock.now(),
        );
        let chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                ChunkRecord::new(record.id.clone(), index as u32, range).with_block_id(new_block_id())
            })
            .collect();

        self.inner.start_transfer(record, chunks).await
    }

    /// Stop dequeuing new chunk operations; running ones finish their call
    #[instrument(skip(self, handle), fields(transfer = %handle.id()))]
    pub async fn pause(&self, handle: &TransferHandle) -> TransferResult<()> {
        let id = handle.id();
        if self.inner.table.pause(id, PauseReason::User)? {
            self.inner.scheduler.pause(id);
        }
        self.inner.persist(id, ChunkRows::All).await;
        info!("transfer paused");
        Ok(())
    }

    /// Lift a user pause. Policy pauses are lifted by the network gate only.
    #[instrument(skip(self, handle), fields(transfer = %handle.id()))]
    pub async fn resume(&self, handle: &TransferHandle) -> TransferResult<()> {
        let id = handle.id();
        let direction = self.inner.direction(id)?;
        let resumed = self.inner.table.resume(id, self.inner.gate.allows(direction))?;
        if resumed {
            self.inner.scheduler.resume(id);
            info!("transfer resumed");
        } else {
            info!("transfer held by network policy");
        }
        self.inner.persist(id, ChunkRows::All).await;
        Ok(())
    }

    /// Discard queued chunk operations; the transfer becomes canceled once
    /// running operations unwind
    #[instrument(skip(self, handle), fields(transfer = %handle.id()))]
    pub async fn cancel(&self, handle: &TransferHandle) -> TransferResult<()> {
        let id = handle.id();
        self.inner.table.cancel(id)?;
        let removed = self.inner.scheduler.cancel(id);
        self.inner.table.chunks_canceled(id, &removed);
        self.inner.persist(id, ChunkRows::All).await;
        info!(dropped = removed.len(), "transfer canceled");
        Ok(())
    }

    /// Re-run the failed or canceled chunks of a transfer
    #[instrument(skip(self, handle), fields(transfer = %handle.id()))]
    pub async fn retry(&self, handle: &TransferHandle) -> TransferResult<()> {
        let id = handle.id();
        let direction = self.inner.direction(id)?;
        let work = self.inner.table.retry(id)?;

        let allowed = self.inner.gate.allows(direction);
        if !allowed {
            self.inner.table.pause(id, PauseReason::Policy)?;
        }
        self.inner.scheduler.reopen(id, !allowed);
        self.inner.persist(id, ChunkRows::All).await;

        info!(chunks = work.len(), "transfer retrying");
        self.inner.scheduler.schedule(id, work, !allowed);
        Ok(())
    }

    /// Delete a complete, failed or canceled transfer and its stored rows
    #[instrument(skip(self, handle), fields(transfer = %handle.id()))]
    pub async fn remove(&self, handle: &TransferHandle) -> TransferResult<()> {
        let id = handle.id();
        let _guard = self.inner.persist_lock.lock().await;
        self.inner.table.remove(id)?;
        self.inner.scheduler.forget(id);

        if let Err(e) = self.inner.store.delete(id).await {
            warn!("failed to delete stored rows: {}", e);
        }
        info!("transfer removed");
        Ok(())
    }

    /// Reload and reschedule every stored transfer of this engine's restoration ID
    #[instrument(skip(self, restoration_id), fields(restoration_id = %restoration_id))]
    pub async fn resume_all(&self, restoration_id: &RestorationId) -> TransferResult<Vec<TransferHandle>> {
        self.inner.ensure_running()?;
        if restoration_id != &self.inner.config.restoration_id {
            return Err(TransferError::RestorationMismatch {
                expected: self.inner.config.restoration_id.clone(),
                got: restoration_id.clone(),
            });
        }

        let stored = self.inner.store.load_all(restoration_id).await?;
        let mut handles = Vec::with_capacity(stored.len());

        for (record, chunks) in stored {
            let id = record.id.clone();
            let direction = record.direction;
            let state = record.state;
            let Some(work) = self.inner.table.restore(record, chunks) else {
                continue;
            };

            if state.is_terminal() {
                handles.push(TransferHandle::new(id));
                continue;
            }

            let allowed = self.inner.gate.allows(direction);
            let policy_paused = self
                .inner
                .table
                .record(&id)
                .map_or(false, |record| record.is_policy_paused());

            if !allowed && !self.inner.table.is_paused(&id) {
                self.inner.table.pause(&id, PauseReason::Policy)?;
            } else if allowed && policy_paused {
                if self.inner.gate.auto_resumes(direction) {
                    self.inner.table.policy_resume_one(&id);
                } else {
                    self.inner.table.policy_hold_one(&id);
                }
            }

            self.inner.persist(&id, ChunkRows::All).await;
            let paused = self.inner.table.is_paused(&id);
            debug!(transfer = %id, chunks = work.len(), paused, "transfer restored");
            self.inner.scheduler.schedule(&id, work, paused);
            handles.push(TransferHandle::new(id));
        }

        info!(transfers = handles.len(), "stored transfers resumed");
        Ok(handles)
    }

    pub fn snapshot(&self, handle: &TransferHandle) -> TransferResult<TransferSnapshot> {
        self.inner
            .table
            .snapshot(handle.id())
            .ok_or_else(|| TransferError::NotFound(handle.id().clone()))
    }

    pub fn record(&self, handle: &TransferHandle) -> TransferResult<TransferRecord> {
        self.inner
            .table
            .record(handle.id())
            .ok_or_else(|| TransferError::NotFound(handle.id().clone()))
    }

    /// Chunk rows of a transfer, ordered by index
    pub fn chunks(&self, handle: &TransferHandle) -> TransferResult<Vec<ChunkRecord>> {
        let mut chunks = self
            .inner
            .table
            .chunks(handle.id())
            .ok_or_else(|| TransferError::NotFound(handle.id().clone()))?;
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    /// Snapshots of every live transfer, oldest first
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.inner.table.snapshots(&TransferFilter::all())
    }

    /// Snapshots of the live transfers matching `filter`, oldest first
    pub fn transfers_where(&self, filter: &TransferFilter) -> Vec<TransferSnapshot> {
        self.inner.table.snapshots(filter)
    }

    /// Oldest live transfer matching `filter`
    pub fn first_where(&self, filter: &TransferFilter) -> Option<TransferHandle> {
        self.inner
            .table
            .ids_where(filter)
            .into_iter()
            .next()
            .map(TransferHandle::new)
    }

    pub fn downloads(&self) -> Vec<TransferSnapshot> {
        self.transfers_where(&TransferFilter::downloads())
    }

    pub fn uploads(&self) -> Vec<TransferSnapshot> {
        self.transfers_where(&TransferFilter::uploads())
    }

    /// Pause every matching transfer that can be paused.
    /// Returns the transfers that were paused.
    pub async fn pause_where(&self, filter: &TransferFilter) -> TransferResult<Vec<TransferHandle>> {
        let mut paused = Vec::new();
        for handle in self.handles_where(filter) {
            if skipped(self.pause(&handle).await, &handle, "pause")? {
                continue;
            }
            paused.push(handle);
        }
        Ok(paused)
    }

    /// Resume every matching user-paused transfer
    pub async fn resume_where(&self, filter: &TransferFilter) -> TransferResult<Vec<TransferHandle>> {
        let mut resumed = Vec::new();
        for handle in self.handles_where(filter) {
            if skipped(self.resume(&handle).await, &handle, "resume")? {
                continue;
            }
            resumed.push(handle);
        }
        Ok(resumed)
    }

    /// Cancel every matching transfer that is not yet terminal
    pub async fn cancel_where(&self, filter: &TransferFilter) -> TransferResult<Vec<TransferHandle>> {
        let mut canceled = Vec::new();
        for handle in self.handles_where(filter) {
            if skipped(self.cancel(&handle).await, &handle, "cancel")? {
                continue;
            }
            canceled.push(handle);
        }
        Ok(canceled)
    }

    /// Remove every matching terminal transfer. Active transfers are left
    /// alone; cancel them first.
    pub async fn remove_where(&self, filter: &TransferFilter) -> TransferResult<Vec<TransferHandle>> {
        let mut removed = Vec::new();
        for handle in self.handles_where(filter) {
            if skipped(self.remove(&handle).await, &handle, "remove")? {
                continue;
            }
            removed.push(handle);
        }
        Ok(removed)
    }

    fn handles_where(&self, filter: &TransferFilter) -> Vec<TransferHandle> {
        self.inner
            .table
            .ids_where(filter)
            .into_iter()
            .map(TransferHandle::new)
            .collect()
    }

    /// Chunk operations currently executing
    pub fn in_flight(&self) -> usize {
        self.inner.scheduler.running()
    }

    pub fn register_observer(&self, observer: impl TransferObserver + 'static) -> ObserverId {
        self.inner.hub.register(Arc::new(observer))
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.hub.unregister(id)
    }

    /// Stream of every event generated after subscription
    pub fn events(&self) -> BoxStream<TransferEvent> {
        self.inner.hub.events()
    }

    pub fn connectivity(&self) -> ConnectivityClass {
        self.inner.gate.connectivity()
    }

    /// Feed a connectivity change into the network gate
    pub async fn set_connectivity(&self, class: ConnectivityClass) {
        self.inner.apply_connectivity(class).await;
    }

    /// Follow a connectivity signal until it closes or the engine shuts down
    pub fn watch_connectivity(&self, mut rx: watch::Receiver<ConnectivityClass>) {
        let weak = Arc::downgrade(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            let initial = *rx.borrow_and_update();
            if let Some(inner) = weak.upgrade() {
                inner.apply_connectivity(initial).await;
            }

            while rx.changed().await.is_ok() {
                let class = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_connectivity(class).await;
            }
            debug!("connectivity watcher stopped");
        });
        self.inner.watchers.lock().push(task);
    }

    /// Stop the worker pool and connectivity watchers. Stored progress is
    /// kept; in-flight transfers continue after `resume_all` in a new engine.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let watchers = std::mem::take(&mut *self.inner.watchers.lock());
        for watcher in watchers {
            watcher.abort();
        }
        self.inner.scheduler.shutdown().await;
        info!("transfer engine shut down");
    }
}

/// Bulk operations skip transfers whose state does not allow the operation
fn skipped(result: TransferResult<()>, handle: &TransferHandle, operation: &str) -> TransferResult<bool> {
    match result {
        Ok(()) => Ok(false),
        Err(
            e @ (TransferError::InvalidTransition { .. }
            | TransferError::PolicyPaused(_)
            | TransferError::NotFound(_)),
        ) => {
            debug!(transfer = %handle.id(), operation, "skipped: {}", e);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

fn validate_endpoints(remote: &RemoteRef, local: &Path) -> TransferResult<()> {
    if remote.container.is_empty() {
        return Err(TransferError::planning("container name is empty"));
    }
    if remote.blob.is_empty() {
        return Err(TransferError::planning("blob name is empty"));
    }
    if local.as_os_str().is_empty() {
        return Err(TransferError::planning("local path is empty"));
    }
    Ok(())
}

impl EngineInner {
    fn ensure_running(&self) -> TransferResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TransferError::Shutdown);
        }
        Ok(())
    }

    fn direction(&self, id: &TransferId) -> TransferResult<Direction> {
        self.table
            .record(id)
            .map(|record| record.direction)
            .ok_or_else(|| TransferError::NotFound(id.clone()))
    }

    async fn start_transfer(
        &self,
        mut record: TransferRecord,
        mut chunks: Vec<ChunkRecord>,
    ) -> TransferResult<TransferHandle> {
        let id = record.id.clone();
        let allowed = self.gate.allows(record.direction);
        if !allowed {
            record.pause(PauseReason::Policy, self.clock.now());
            for chunk in &mut chunks {
                chunk.state = TransferState::Paused;
            }
        }

        let work: Vec<(u32, u32)> = chunks.iter().map(|chunk| (chunk.index, 0)).collect();
        info!(
            transfer = %id,
            direction = %record.direction,
            chunks = work.len(),
            total_bytes = ?record.total_bytes,
            policy_paused = !allowed,
            "transfer created"
        );

        self.table.insert(record, chunks);
        self.persist(&id, ChunkRows::All).await;
        self.scheduler.schedule(&id, work, !allowed);
        Ok(TransferHandle::new(id))
    }

    /// Write the latest rows for a transfer. Failures are reported on the
    /// transfer, never returned: the transfer keeps running in memory.
    async fn persist(&self, id: &TransferId, which: ChunkRows<'_>) {
        let _guard = self.persist_lock.lock().await;
        let Some((record, chunks)) = self.table.rows(id, which) else {
            return;
        };

        match self.store.save(&record, &chunks).await {
            Ok(()) => self.table.mark_durable(id),
            Err(e) => {
                warn!(transfer = %id, "failed to persist transfer state: {}", e);
                self.table.persistence_failed(id, e.to_string());
            }
        }
    }

    async fn apply_connectivity(&self, class: ConnectivityClass) {
        let changes = self.gate.set_connectivity(class);
        info!(connectivity = %class, changes = changes.len(), "connectivity changed");

        for change in changes {
            let ids = if change.allowed && self.gate.auto_resumes(change.direction) {
                let ids = self.table.policy_resume(change.direction);
                for id in &ids {
                    self.scheduler.resume(id);
                }
                ids
            } else if change.allowed {
                self.table.policy_hold(change.direction)
            } else {
                let ids = self.table.policy_pause(change.direction);
                for id in &ids {
                    self.scheduler.pause(id);
                }
                ids
            };

            for id in &ids {
                self.persist(id, ChunkRows::All).await;
            }
            debug!(
                direction = %change.direction,
                allowed = change.allowed,
                transfers = ids.len(),
                "network policy applied"
            );
        }
    }

    /// First response of a download of unknown size: fix the size, plan the
    /// remainder and schedule it before the provisional chunk settles.
    async fn discover(
        &self,
        id: &TransferId,
        chunk: &ChunkRecord,
        local: &Path,
        receipt: chunk_io::ChunkReceipt,
    ) -> Result<u64, ChunkError> {
        let total = receipt.total_size.ok_or_else(|| {
            ChunkError::permanent("transport did not report the blob size for a download of unknown size")
        })?;

        let discovery = self
            .table
            .discover_size(id, chunk.index, total, receipt.etag.clone())
            .map_err(|e| ChunkError::permanent(e.to_string()))?;
        chunk_io::prepare_target(local, Some(total)).await?;
        info!(transfer = %id, total_bytes = total, "blob size discovered");

        match discovery {
            Discovery::Empty => {
                let guard = self.persist_lock.lock().await;
                if let Err(e) = self.store.delete_chunk(id, chunk.index).await {
                    warn!(transfer = %id, "failed to delete provisional chunk: {}", e);
                }
                drop(guard);
                self.persist(id, ChunkRows::All).await;
                Ok(0)
            }
            Discovery::Remainder(remainder) => {
                self.table.complete_chunk(id, chunk.index, receipt.bytes, receipt.etag);
                self.persist(id, ChunkRows::All).await;

                let paused = self.table.is_paused(id);
                let work = remainder.iter().map(|chunk| (chunk.index, 0)).collect();
                self.scheduler.schedule(id, work, paused);
                Ok(receipt.bytes)
            }
        }
    }

    async fn commit_upload(&self, remote: &RemoteRef, block_ids: &[String]) -> Result<(), TransportError> {
        let policy = RetryPolicy {
            max_attempts: self.config.max_attempts,
            base: self.config.retry_backoff,
            max: self.config.max_retry_backoff,
        };

        let mut attempt = 1;
        loop {
            let result = async {
                let headers = self.adapter.credentials().headers(remote).await?;
                match tokio::time::timeout(
                    self.config.chunk_timeout,
                    self.adapter.transport().commit_blocks(remote, block_ids, &headers),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::transient("block list commit timed out")),
                }
            }
            .await;

            match result {
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    warn!(remote = %remote, attempt, "block list commit failed, will retry: {}", e);
                    tokio::time::sleep(policy.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl OperationRunner for EngineInner {
    async fn run_chunk(&self, id: &TransferId, index: u32, attempt: u32) -> Result<u64, ChunkError> {
        let (chunk, ctx) = match self.table.begin_chunk(id, index) {
            ChunkStart::Run(chunk, ctx) => (chunk, ctx),
            ChunkStart::AlreadyComplete => return Ok(0),
            ChunkStart::Canceled => return Err(ChunkError::permanent("transfer canceled")),
        };
        debug!(transfer = %id, chunk = index, attempt, range = %chunk.range(), "chunk started");

        let receipt = self.adapter.transfer(&chunk, &ctx).await?;

        if ctx.direction == Direction::Download && ctx.total_bytes.is_none() {
            return self.discover(id, &chunk, &ctx.local, receipt).await;
        }

        let bytes = receipt.bytes;
        self.table.complete_chunk(id, index, bytes, receipt.etag);
        self.persist(id, ChunkRows::Only(&[index])).await;
        Ok(bytes)
    }

    async fn chunk_retrying(&self, id: &TransferId, index: u32, attempt: u32, error: &ChunkError) {
        self.table.chunk_retrying(id, index, attempt, error.to_string());
        self.persist(id, ChunkRows::Only(&[index])).await;
    }

    async fn chunk_failed(&self, id: &TransferId, index: u32, error: &ChunkError) {
        self.table.chunk_failed(id, index, error.to_string());
        self.persist(id, ChunkRows::Only(&[index])).await;
    }

    async fn run_finalize(&self, id: &TransferId, outcomes: BTreeMap<u32, ChunkOutcome>) {
        let failed = outcomes
            .values()
            .filter(|outcome| matches!(outcome, ChunkOutcome::Failed(_)))
            .count();
        let canceled = outcomes
            .values()
            .filter(|outcome| **outcome == ChunkOutcome::Canceled)
            .count();
        debug!(transfer = %id, chunks = outcomes.len(), failed, canceled, "finalizing transfer");

        match self.table.finalize(id) {
            FinalizeStep::Nothing => {}
            FinalizeStep::Reschedule(work) => {
                let paused = self.table.is_paused(id);
                self.scheduler.schedule(id, work, paused);
            }
            FinalizeStep::Settled(state) => {
                self.persist(id, ChunkRows::All).await;
                log_settled(id, state);
            }
            FinalizeStep::Commit { remote, block_ids } => {
                let result = self.commit_upload(&remote, &block_ids).await;
                if let Err(e) = &result {
                    error!(transfer = %id, "block list commit failed: {}", e);
                }
                let state = self.table.commit_finished(id, result.map_err(|e| e.to_string()));
                self.persist(id, ChunkRows::All).await;
                if let Some(state) = state {
                    log_settled(id, state);
                }
            }
        }
    }
}

fn log_settled(id: &TransferId, state: TransferState) {
    match state {
        TransferState::Complete => info!(transfer = %id, "transfer complete"),
        TransferState::Failed => warn!(transfer = %id, "transfer failed"),
        other => info!(transfer = %id, state = %other, "transfer settled"),
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.scheduler.signal_shutdown();
        for watcher in self.watchers.get_mut().drain(..) {
            watcher.abort();
        }
    }
}
