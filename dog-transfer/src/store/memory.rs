use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{StoredTransfer, TransferStore};
use crate::error::TransferResult;
use crate::types::{ChunkRecord, RestorationId, TransferId, TransferRecord};

/// Transfer rows and chunk rows, arena style
#[derive(Debug, Default, Clone)]
pub(crate) struct Rows {
    pub(crate) transfers: HashMap<TransferId, TransferRecord>,
    pub(crate) chunks: HashMap<(TransferId, u32), ChunkRecord>,
}

impl Rows {
    pub(crate) fn save_transfer(&mut self, record: &TransferRecord) {
        self.transfers.insert(record.id.clone(), record.clone());
    }

    pub(crate) fn save_chunks(&mut self, chunks: &[ChunkRecord]) {
        for chunk in chunks {
            self.chunks
                .insert((chunk.transfer_id.clone(), chunk.index), chunk.clone());
        }
    }

    pub(crate) fn delete_chunk(&mut self, transfer_id: &TransferId, index: u32) {
        self.chunks.remove(&(transfer_id.clone(), index));
    }

    pub(crate) fn delete(&mut self, transfer_id: &TransferId) {
        self.transfers.remove(transfer_id);
        self.chunks.retain(|(id, _), _| id != transfer_id);
    }

    pub(crate) fn load_all(&self, restoration_id: &RestorationId) -> Vec<StoredTransfer> {
        let mut transfers: Vec<&TransferRecord> = self
            .transfers
            .values()
            .filter(|record| &record.restoration_id == restoration_id)
            .collect();
        transfers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        transfers
            .into_iter()
            .map(|record| {
                let mut chunks: Vec<ChunkRecord> = self
                    .chunks
                    .values()
                    .filter(|chunk| chunk.transfer_id == record.id)
                    .cloned()
                    .collect();
                chunks.sort_by_key(|chunk| chunk.index);
                (record.clone(), chunks)
            })
            .collect()
    }
}

/// In-memory store for testing and development; cloning shares the rows
#[derive(Debug, Default, Clone)]
pub struct MemoryTransferStore {
    rows: Arc<RwLock<Rows>>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer(&self, transfer_id: &TransferId) -> Option<TransferRecord> {
        self.rows.read().transfers.get(transfer_id).cloned()
    }

    pub fn chunk_count(&self, transfer_id: &TransferId) -> usize {
        self.rows
            .read()
            .chunks
            .keys()
            .filter(|(id, _)| id == transfer_id)
            .count()
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn save_transfer(&self, record: &TransferRecord) -> TransferResult<()> {
        self.rows.write().save_transfer(record);
        Ok(())
    }

    async fn save_chunks(&self, chunks: &[ChunkRecord]) -> TransferResult<()> {
        self.rows.write().save_chunks(chunks);
        Ok(())
    }

    async fn save(&self, record: &TransferRecord, chunks: &[ChunkRecord]) -> TransferResult<()> {
        let mut rows = self.rows.write();
        rows.save_transfer(record);
        rows.save_chunks(chunks);
        Ok(())
    }

    async fn delete_chunk(&self, transfer_id: &TransferId, index: u32) -> TransferResult<()> {
        self.rows.write().delete_chunk(transfer_id, index);
        Ok(())
    }

    async fn load_all(&self, restoration_id: &RestorationId) -> TransferResult<Vec<StoredTransfer>> {
        Ok(self.rows.read().load_all(restoration_id))
    }

    async fn delete(&self, transfer_id: &TransferId) -> TransferResult<()> {
        self.rows.write().delete(transfer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteRange, Direction, RemoteRef};
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(restoration: &str) -> TransferRecord {
        TransferRecord::new(
            Direction::Upload,
            RemoteRef::new("c", "b"),
            PathBuf::from("/tmp/b"),
            Some(8),
            RestorationId::new(restoration),
            4,
            0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_load_all_filters_by_restoration_id() {
        let store = MemoryTransferStore::new();
        let mine = record("app");
        let theirs = record("other");

        store.save_transfer(&mine).await.unwrap();
        store.save_transfer(&theirs).await.unwrap();
        store
            .save_chunks(&[
                ChunkRecord::new(mine.id.clone(), 1, ByteRange::new(4, 8)),
                ChunkRecord::new(mine.id.clone(), 0, ByteRange::new(0, 4)),
            ])
            .await
            .unwrap();

        let loaded = store.load_all(&RestorationId::new("app")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.id, mine.id);
        let indices: Vec<u32> = loaded[0].1.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_delete_removes_chunks() {
        let store = MemoryTransferStore::new();
        let transfer = record("app");
        store.save_transfer(&transfer).await.unwrap();
        store
            .save_chunks(&[ChunkRecord::new(transfer.id.clone(), 0, ByteRange::new(0, 4))])
            .await
            .unwrap();

        store.delete(&transfer.id).await.unwrap();
        assert!(store.transfer(&transfer.id).is_none());
        assert_eq!(store.chunk_count(&transfer.id), 0);
    }
}
