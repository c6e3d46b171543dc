use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::memory::Rows;
use super::{StoredTransfer, TransferStore};
use crate::error::TransferResult;
use crate::types::{ChunkRecord, RestorationId, TransferId, TransferRecord};

const DOCUMENT_VERSION: u32 = 1;

/// On-disk layout: one table of transfer rows and one of chunk rows
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    transfers: Vec<TransferRecord>,
    chunks: Vec<ChunkRecord>,
}

/// Store that keeps every row in a single JSON document.
///
/// Each change rewrites the document through a temporary file and a rename,
/// so a crash leaves either the old or the new document on disk.
pub struct JsonFileStore {
    path: PathBuf,
    rows: Mutex<Rows>,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing rows if the file exists
    pub async fn open(path: impl AsRef<Path>) -> TransferResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows = Rows::default();

        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let document: StoreDocument = serde_json::from_slice(&raw)?;
                for record in &document.transfers {
                    rows.save_transfer(record);
                }
                rows.save_chunks(&document.chunks);
                debug!(path = %path.display(), transfers = document.transfers.len(), "loaded transfer store");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            rows: Mutex::new(rows),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the latest rows. Holding the write lock while serializing means
    /// a later flush always carries state at least as new as an earlier one.
    async fn flush(&self) -> TransferResult<()> {
        let _guard = self.write_lock.lock().await;

        let json = {
            let rows = self.rows.lock();
            let mut transfers: Vec<TransferRecord> = rows.transfers.values().cloned().collect();
            transfers.sort_by(|a, b| a.id.cmp(&b.id));
            let mut chunks: Vec<ChunkRecord> = rows.chunks.values().cloned().collect();
            chunks.sort_by(|a, b| {
                a.transfer_id
                    .cmp(&b.transfer_id)
                    .then_with(|| a.index.cmp(&b.index))
            });
            serde_json::to_vec_pretty(&StoreDocument {
                version: DOCUMENT_VERSION,
                transfers,
                chunks,
            })?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TransferStore for JsonFileStore {
    async fn save_transfer(&self, record: &TransferRecord) -> TransferResult<()> {
        self.rows.lock().save_transfer(record);
        self.flush().await
    }

    async fn save_chunks(&self, chunks: &[ChunkRecord]) -> TransferResult<()> {
        self.rows.lock().save_chunks(chunks);
        self.flush().await
    }

    async fn save(&self, record: &TransferRecord, chunks: &[ChunkRecord]) -> TransferResult<()> {
        {
            let mut rows = self.rows.lock();
            rows.save_transfer(record);
            rows.save_chunks(chunks);
        }
        self.flush().await
    }

    async fn delete_chunk(&self, transfer_id: &TransferId, index: u32) -> TransferResult<()> {
        self.rows.lock().delete_chunk(transfer_id, index);
        self.flush().await
    }

    async fn load_all(&self, restoration_id: &RestorationId) -> TransferResult<Vec<StoredTransfer>> {
        Ok(self.rows.lock().load_all(restoration_id))
    }

    async fn delete(&self, transfer_id: &TransferId) -> TransferResult<()> {
        self.rows.lock().delete(transfer_id);
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteRange, Direction, RemoteRef, TransferState};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/transfers.json");

        let mut record = TransferRecord::new(
            Direction::Download,
            RemoteRef::new("media", "clip.mp4"),
            dir.path().join("clip.mp4"),
            None,
            RestorationId::new("app"),
            4,
            0,
            Utc::now(),
        );
        record.etag = Some("\"0x1\"".to_string());

        let mut chunk = ChunkRecord::new(record.id.clone(), 0, ByteRange::new(0, 4));
        chunk.state = TransferState::Complete;
        chunk.bytes_transferred = 4;

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.save(&record, &[chunk.clone()]).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.load_all(&RestorationId::new("app")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.etag, record.etag);
        assert_eq!(loaded[0].1, vec![chunk]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(JsonFileStore::open(&path).await.is_err());
    }
}
