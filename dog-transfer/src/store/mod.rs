//! Durable transfer and chunk records.
//!
//! Stores are arena-shaped: transfers keyed by ID, chunks keyed by
//! `(transfer ID, index)`. Nothing points back from a chunk to its transfer
//! except the ID.

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryTransferStore;

use async_trait::async_trait;

use crate::error::TransferResult;
use crate::types::{ChunkRecord, RestorationId, TransferId, TransferRecord};

/// A transfer row together with its chunk rows, ordered by index
pub type StoredTransfer = (TransferRecord, Vec<ChunkRecord>);

/// Persistence for transfer state - implemented by all storage backends
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert or replace a transfer row
    async fn save_transfer(&self, record: &TransferRecord) -> TransferResult<()>;

    /// Insert or replace chunk rows
    async fn save_chunks(&self, chunks: &[ChunkRecord]) -> TransferResult<()>;

    /// Write a transfer row together with some of its chunk rows. Backends
    /// that rewrite a whole document should override this to write once.
    async fn save(&self, record: &TransferRecord, chunks: &[ChunkRecord]) -> TransferResult<()> {
        self.save_transfer(record).await?;
        if !chunks.is_empty() {
            self.save_chunks(chunks).await?;
        }
        Ok(())
    }

    /// Drop a single chunk row (a provisional download chunk of an empty blob)
    async fn delete_chunk(&self, transfer_id: &TransferId, index: u32) -> TransferResult<()>;

    /// Every transfer created under `restoration_id`, with its chunks
    async fn load_all(&self, restoration_id: &RestorationId) -> TransferResult<Vec<StoredTransfer>>;

    /// Drop a transfer row and all of its chunk rows
    async fn delete(&self, transfer_id: &TransferId) -> TransferResult<()>;
}
