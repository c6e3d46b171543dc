use std::time::Duration;

use crate::gate::{ConnectivityClass, NetworkPolicy};
use crate::types::RestorationId;

/// Default chunk size: 4 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Configuration for a transfer engine instance
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per chunk unless a start request overrides it
    pub chunk_size: u64,

    /// Worker pool size; bounds in-flight chunk operations across all transfers
    pub max_concurrency: usize,

    /// Attempts per chunk before it is reported as failed
    pub max_attempts: u32,

    /// Base retry backoff duration
    pub retry_backoff: Duration,

    /// Maximum retry backoff duration
    pub max_retry_backoff: Duration,

    /// Upper bound on a single transport call
    pub chunk_timeout: Duration,

    /// Scope of the records this engine creates and resumes
    pub restoration_id: RestorationId,

    pub upload_policy: NetworkPolicy,

    pub download_policy: NetworkPolicy,

    /// Connectivity assumed until the first `set_connectivity` call
    pub initial_connectivity: ConnectivityClass,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(60),
            restoration_id: RestorationId::default(),
            upload_policy: NetworkPolicy::default(),
            download_policy: NetworkPolicy::default(),
            initial_connectivity: ConnectivityClass::Unmetered,
        }
    }
}

impl TransferConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set worker pool size (at least one worker is always started)
    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set base and maximum retry backoff
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_restoration_id(mut self, id: impl Into<RestorationId>) -> Self {
        self.restoration_id = id.into();
        self
    }

    pub fn with_upload_policy(mut self, policy: NetworkPolicy) -> Self {
        self.upload_policy = policy;
        self
    }

    pub fn with_download_policy(mut self, policy: NetworkPolicy) -> Self {
        self.download_policy = policy;
        self
    }

    pub fn with_initial_connectivity(mut self, class: ConnectivityClass) -> Self {
        self.initial_connectivity = class;
        self
    }
}

/// Per-call options for `start_download`
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Overrides `TransferConfig::chunk_size`
    pub chunk_size: Option<u64>,

    /// Known blob size; skips size discovery on the first response
    pub total_bytes: Option<u64>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn with_total_bytes(mut self, bytes: u64) -> Self {
        self.total_bytes = Some(bytes);
        self
    }
}

/// Per-call options for `start_upload`
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Overrides `TransferConfig::chunk_size`
    pub chunk_size: Option<u64>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes);
        self
    }
}
