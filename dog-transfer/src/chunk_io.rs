//! Moves one chunk's bytes between the local file and the transport.
//!
//! The adapter knows nothing about scheduling or persistence; calling it
//! twice for the same range has the same effect as calling it once.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{ChunkError, TransportError};
use crate::transport::{
    ChunkTransport, CredentialProvider, PayloadTransform, RangeRequest, IF_MATCH,
};
use crate::types::{ByteRange, ChunkRecord, Direction, RemoteRef, TransferRecord};

/// Per-transfer facts a chunk operation needs
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub direction: Direction,
    pub remote: RemoteRef,
    pub local: PathBuf,

    /// Known blob size; a response reporting another size is rejected
    pub total_bytes: Option<u64>,

    /// Sent as `If-Match` on downloads
    pub etag: Option<String>,
}

impl ChunkContext {
    pub fn from_record(record: &TransferRecord) -> Self {
        Self {
            direction: record.direction,
            remote: record.remote.clone(),
            local: record.local.clone(),
            total_bytes: record.total_bytes,
            etag: record.etag.clone(),
        }
    }
}

/// What a successful chunk operation reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// Local bytes written (downloads) or read and accepted (uploads)
    pub bytes: u64,

    /// Blob size reported by the response (downloads only)
    pub total_size: Option<u64>,

    pub etag: Option<String>,
}

/// Executes single-chunk transfers against a [`ChunkTransport`]
#[derive(Clone)]
pub struct ChunkTransferAdapter {
    transport: Arc<dyn ChunkTransport>,
    credentials: Arc<dyn CredentialProvider>,
    transform: Arc<dyn PayloadTransform>,
    timeout: Duration,
}

impl ChunkTransferAdapter {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        credentials: Arc<dyn CredentialProvider>,
        transform: Arc<dyn PayloadTransform>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            credentials,
            transform,
            timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn ChunkTransport> {
        &self.transport
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    /// Transfer one chunk in the context's direction
    pub async fn transfer(
        &self,
        chunk: &ChunkRecord,
        ctx: &ChunkContext,
    ) -> Result<ChunkReceipt, ChunkError> {
        match ctx.direction {
            Direction::Download => self.download(chunk, ctx).await,
            Direction::Upload => self.upload(chunk, ctx).await,
        }
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> Result<T, ChunkError>
    where
        F: std::future::Future<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(ChunkError::from),
            Err(_) => Err(ChunkError::transient(format!(
                "{} timed out after {:?}",
                what, self.timeout
            ))),
        }
    }

    async fn download(&self, chunk: &ChunkRecord, ctx: &ChunkContext) -> Result<ChunkReceipt, ChunkError> {
        let range = chunk.range();
        let headers = self
            .with_timeout("credential lookup", self.credentials.headers(&ctx.remote))
            .await?;

        let mut request = RangeRequest::new(ctx.remote.clone(), range).with_headers(headers);
        if let Some(etag) = &ctx.etag {
            request = request.with_header(IF_MATCH, etag.clone());
        }

        let response = self
            .with_timeout("ranged get", self.transport.ranged_get(request))
            .await?;

        if let (Some(known), Some(reported)) = (ctx.total_bytes, response.total_size) {
            if known != reported {
                return Err(ChunkError::permanent(format!(
                    "blob size changed from {} to {} bytes",
                    known, reported
                )));
            }
        }

        let total = response.total_size.or(ctx.total_bytes);
        let expected = match total {
            Some(total) => range.truncate(total).len(),
            None => range.len(),
        };

        let mut data = self.transform.decode(range, response.data)?;
        if (data.len() as u64) < expected {
            return Err(ChunkError::transient(format!(
                "short read for {}: got {} of {} bytes",
                range,
                data.len(),
                expected
            )));
        }
        data.truncate(expected as usize);

        write_at(&ctx.local, range.start, &data).await?;
        debug!(chunk = chunk.index, bytes = expected, "chunk written");

        Ok(ChunkReceipt {
            bytes: expected,
            total_size: total,
            etag: response.etag,
        })
    }

    async fn upload(&self, chunk: &ChunkRecord, ctx: &ChunkContext) -> Result<ChunkReceipt, ChunkError> {
        let range = chunk.range();
        let data = read_at(&ctx.local, range).await?;
        let payload = self.transform.encode(range, data)?;
        let payload_len = payload.len() as u64;

        let headers = self
            .with_timeout("credential lookup", self.credentials.headers(&ctx.remote))
            .await?;
        let request = RangeRequest::new(ctx.remote.clone(), range)
            .with_headers(headers)
            .with_block_id(chunk.block_id.clone());

        let put = self
            .with_timeout("ranged put", self.transport.ranged_put(request, payload))
            .await?;
        if put.accepted < payload_len {
            return Err(ChunkError::transient(format!(
                "partial put for {}: accepted {} of {} bytes",
                range, put.accepted, payload_len
            )));
        }

        debug!(chunk = chunk.index, bytes = range.len(), "chunk staged");
        Ok(ChunkReceipt {
            bytes: range.len(),
            total_size: None,
            etag: None,
        })
    }
}

/// Write `data` at `offset`, creating the file and its parents if needed. Never truncates.
pub async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<(), ChunkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Read exactly `range` from the file at `path`
pub async fn read_at(path: &Path, range: ByteRange) -> Result<Bytes, ChunkError> {
    let mut file = OpenOptions::new().read(true).open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Create the download target (and parents) and size it to `len` when known
pub async fn prepare_target(path: &Path, len: Option<u64>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    if let Some(len) = len {
        file.set_len(len).await?;
    }
    Ok(())
}
