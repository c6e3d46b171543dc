//! Seams to the remote blob service.
//!
//! The engine never speaks HTTP itself: ranged reads and writes go through
//! [`ChunkTransport`], request signing through [`CredentialProvider`] and
//! optional payload encoding through [`PayloadTransform`].

pub mod memory;

pub use memory::MemoryBlobTransport;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::{ByteRange, RemoteRef};

/// Request headers, kept ordered so signatures are deterministic
pub type Headers = BTreeMap<String, String>;

/// Header carrying the ETag that pins a download to one blob version
pub const IF_MATCH: &str = "If-Match";

/// One ranged request against a blob
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub remote: RemoteRef,
    pub range: ByteRange,
    pub headers: Headers,

    /// Staged block identifier (uploads only)
    pub block_id: Option<String>,
}

impl RangeRequest {
    pub fn new(remote: RemoteRef, range: ByteRange) -> Self {
        Self {
            remote,
            range,
            headers: Headers::new(),
            block_id: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_block_id(mut self, block_id: Option<String>) -> Self {
        self.block_id = block_id;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Response to a ranged read
#[derive(Debug, Clone)]
pub struct RangedGet {
    pub data: Bytes,

    /// Full blob size as reported by the `Content-Range` equivalent
    pub total_size: Option<u64>,

    pub etag: Option<String>,
}

/// Response to a ranged write
#[derive(Debug, Clone, Copy)]
pub struct RangedPut {
    pub accepted: u64,
}

/// Ranged HTTP-like operations against a blob service
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Read `request.range` of the blob
    async fn ranged_get(&self, request: RangeRequest) -> Result<RangedGet, TransportError>;

    /// Stage `data` as `request.range` of the blob
    async fn ranged_put(&self, request: RangeRequest, data: Bytes) -> Result<RangedPut, TransportError>;

    /// Commit staged blocks in order. Transports that write in place need not override this.
    async fn commit_blocks(
        &self,
        _remote: &RemoteRef,
        _block_ids: &[String],
        _headers: &Headers,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Supplies authentication headers for each request
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn headers(&self, remote: &RemoteRef) -> Result<Headers, TransportError>;
}

/// Anonymous access
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn headers(&self, _remote: &RemoteRef) -> Result<Headers, TransportError> {
        Ok(Headers::new())
    }
}

/// Static bearer token
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[async_trait]
impl CredentialProvider for BearerToken {
    async fn headers(&self, _remote: &RemoteRef) -> Result<Headers, TransportError> {
        let mut headers = Headers::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", self.0));
        Ok(headers)
    }
}

/// Per-chunk payload encoding applied between the local file and the wire
pub trait PayloadTransform: Send + Sync {
    /// Block size chunk boundaries must align to (0 for none)
    fn alignment(&self) -> u64 {
        0
    }

    /// Local bytes to wire bytes (uploads)
    fn encode(&self, range: ByteRange, data: Bytes) -> Result<Bytes, TransportError>;

    /// Wire bytes to local bytes (downloads)
    fn decode(&self, range: ByteRange, data: Bytes) -> Result<Bytes, TransportError>;
}

/// Pass-through transform
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl PayloadTransform for IdentityTransform {
    fn encode(&self, _range: ByteRange, data: Bytes) -> Result<Bytes, TransportError> {
        Ok(data)
    }

    fn decode(&self, _range: ByteRange, data: Bytes) -> Result<Bytes, TransportError> {
        Ok(data)
    }
}

/// Generate a base64 block identifier for a staged upload chunk
pub fn new_block_id() -> String {
    STANDARD.encode(Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ids_have_equal_length() {
        let a = new_block_id();
        let b = new_block_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), b.len());
        assert!(STANDARD.decode(&a).is_ok());
    }

    #[tokio::test]
    async fn test_bearer_token_header() {
        let remote = RemoteRef::new("c", "b");
        let headers = BearerToken("abc".to_string()).headers(&remote).await.unwrap();
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
        assert!(NoCredentials.headers(&remote).await.unwrap().is_empty());
    }
}
