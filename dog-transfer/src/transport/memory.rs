use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{ChunkTransport, Headers, RangeRequest, RangedGet, RangedPut, IF_MATCH};
use crate::error::TransportError;
use crate::types::RemoteRef;

#[derive(Debug, Default)]
struct BlobEntry {
    data: Vec<u8>,
    etag: String,
    committed: bool,
    staged: HashMap<String, Bytes>,
}

/// In-memory blob service with staged blocks and block-list commit.
///
/// Useful for development and tests; cloning shares the same blobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobTransport {
    blobs: Arc<RwLock<HashMap<RemoteRef, BlobEntry>>>,
    versions: Arc<AtomicU64>,
}

impl MemoryBlobTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
        format!("\"0x{:08X}\"", version)
    }

    /// Store a committed blob, replacing any previous version. Returns its ETag.
    pub fn put_blob(&self, remote: &RemoteRef, data: impl Into<Vec<u8>>) -> String {
        let etag = self.next_etag();
        self.blobs.write().insert(
            remote.clone(),
            BlobEntry {
                data: data.into(),
                etag: etag.clone(),
                committed: true,
                staged: HashMap::new(),
            },
        );
        etag
    }

    /// Committed contents of a blob
    pub fn blob(&self, remote: &RemoteRef) -> Option<Bytes> {
        self.blobs
            .read()
            .get(remote)
            .filter(|entry| entry.committed)
            .map(|entry| Bytes::copy_from_slice(&entry.data))
    }

    pub fn etag(&self, remote: &RemoteRef) -> Option<String> {
        self.blobs.read().get(remote).map(|entry| entry.etag.clone())
    }

    /// Number of staged, uncommitted blocks for a blob
    pub fn staged_blocks(&self, remote: &RemoteRef) -> usize {
        self.blobs
            .read()
            .get(remote)
            .map(|entry| entry.staged.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChunkTransport for MemoryBlobTransport {
    async fn ranged_get(&self, request: RangeRequest) -> Result<RangedGet, TransportError> {
        let blobs = self.blobs.read();
        let entry = blobs
            .get(&request.remote)
            .filter(|entry| entry.committed)
            .ok_or_else(|| TransportError::from_status(404, format!("blob {} not found", request.remote)))?;

        if let Some(expected) = request.header(IF_MATCH) {
            if expected != entry.etag {
                return Err(TransportError::from_status(
                    412,
                    format!("blob {} changed since {}", request.remote, expected),
                ));
            }
        }

        let total = entry.data.len() as u64;
        if request.range.start >= total && !(total == 0 && request.range.start == 0) {
            return Err(TransportError::from_status(
                416,
                format!("range {} outside blob of {} bytes", request.range, total),
            ));
        }

        let range = request.range.truncate(total);
        let data = Bytes::copy_from_slice(&entry.data[range.start as usize..range.end as usize]);

        Ok(RangedGet {
            data,
            total_size: Some(total),
            etag: Some(entry.etag.clone()),
        })
    }

    async fn ranged_put(&self, request: RangeRequest, data: Bytes) -> Result<RangedPut, TransportError> {
        let accepted = data.len() as u64;
        let mut blobs = self.blobs.write();
        let entry = blobs.entry(request.remote.clone()).or_default();

        match request.block_id {
            Some(block_id) => {
                entry.staged.insert(block_id, data);
            }
            None => {
                let start = request.range.start as usize;
                let end = start + data.len();
                if entry.data.len() < end {
                    entry.data.resize(end, 0);
                }
                entry.data[start..end].copy_from_slice(&data);
                entry.committed = true;
                entry.etag = self.next_etag();
            }
        }

        Ok(RangedPut { accepted })
    }

    async fn commit_blocks(
        &self,
        remote: &RemoteRef,
        block_ids: &[String],
        _headers: &Headers,
    ) -> Result<(), TransportError> {
        let mut blobs = self.blobs.write();
        let entry = blobs.entry(remote.clone()).or_default();

        let mut data = Vec::new();
        for block_id in block_ids {
            let block = entry.staged.get(block_id).ok_or_else(|| {
                TransportError::from_status(400, format!("invalid block list: {} not staged", block_id))
            })?;
            data.extend_from_slice(block);
        }

        entry.data = data;
        entry.staged.clear();
        entry.committed = true;
        entry.etag = self.next_etag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ByteRange;

    fn remote() -> RemoteRef {
        RemoteRef::new("media", "clip.bin")
    }

    #[tokio::test]
    async fn test_ranged_get_reports_total_and_etag() {
        let transport = MemoryBlobTransport::new();
        let etag = transport.put_blob(&remote(), b"0123456789".to_vec());

        let response = transport
            .ranged_get(RangeRequest::new(remote(), ByteRange::new(8, 12)))
            .await
            .unwrap();

        assert_eq!(&response.data[..], b"89");
        assert_eq!(response.total_size, Some(10));
        assert_eq!(response.etag, Some(etag));
    }

    #[tokio::test]
    async fn test_if_match_mismatch_is_permanent() {
        let transport = MemoryBlobTransport::new();
        transport.put_blob(&remote(), b"abc".to_vec());

        let request = RangeRequest::new(remote(), ByteRange::new(0, 3)).with_header(IF_MATCH, "\"stale\"");
        let err = transport.ranged_get(request).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_blob_is_permanent() {
        let transport = MemoryBlobTransport::new();
        let err = transport
            .ranged_get(RangeRequest::new(remote(), ByteRange::new(0, 4)))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_staged_blocks_commit_in_list_order() {
        let transport = MemoryBlobTransport::new();
        let second = RangeRequest::new(remote(), ByteRange::new(3, 6)).with_block_id(Some("b".into()));
        let first = RangeRequest::new(remote(), ByteRange::new(0, 3)).with_block_id(Some("a".into()));

        transport.ranged_put(second, Bytes::from_static(b"def")).await.unwrap();
        transport.ranged_put(first, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(transport.blob(&remote()), None);
        assert_eq!(transport.staged_blocks(&remote()), 2);

        transport
            .commit_blocks(&remote(), &["a".to_string(), "b".to_string()], &Headers::new())
            .await
            .unwrap();

        assert_eq!(transport.blob(&remote()).unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(transport.staged_blocks(&remote()), 0);
    }

    #[tokio::test]
    async fn test_commit_with_unknown_block_fails() {
        let transport = MemoryBlobTransport::new();
        let err = transport
            .commit_blocks(&remote(), &["missing".to_string()], &Headers::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
