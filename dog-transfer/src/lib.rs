//! # dog-transfer: Chunked, resumable blob transfers
//!
//! `dog-transfer` moves large objects between a local file and a remote blob
//! store. Every transfer is split into byte-range chunks that run with bounded
//! concurrency, survive process restarts and respect network policy.
//!
//! ## Key Features
//!
//! - **Chunked**: Fixed-size ranges, aligned for block-oriented payload transforms
//! - **Resumable**: Transfer and chunk rows are persisted after every state change
//! - **Bounded concurrency**: A shared worker pool caps in-flight chunk requests
//! - **Retry with backoff**: Transient failures retry with capped exponential backoff
//! - **Network aware**: Per-direction policies pause and resume work as connectivity changes
//! - **Observable**: Ordered events through observers or a `Stream`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_transfer::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let transport = Arc::new(MemoryBlobTransport::new());
//! let engine = TransferEngine::builder(transport)
//!     .config(TransferConfig::default().with_max_concurrency(8))
//!     .build()?;
//!
//! let handle = engine
//!     .start_upload(
//!         "video.mp4".into(),
//!         RemoteRef::new("media", "uploads/video.mp4"),
//!         UploadOptions::default(),
//!     )
//!     .await?;
//!
//! let snapshot = engine.snapshot(&handle)?;
//! println!("{} is {}", snapshot.id, snapshot.state);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  TransferEngine  │  ← pause / resume / cancel / retry / resume_all
//! ├──────────────────┤
//! │    Scheduler     │  ← bounded worker pool, retries, finalize
//! ├──────────────────┤
//! │ ChunkTransport   │  ← ranged GET / PUT against the blob endpoint
//! │ TransferStore    │  ← durable transfer and chunk rows
//! └──────────────────┘
//! ```

pub mod chunk_io;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod observability;
pub mod observer;
pub mod planner;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

mod table;

pub use engine::{TransferEngine, TransferEngineBuilder, TransferHandle};
pub use config::{DownloadOptions, TransferConfig, UploadOptions, DEFAULT_CHUNK_SIZE};
pub use error::{ChunkError, TransferError, TransferResult, TransportError};
pub use gate::{ConnectivityClass, NetworkPolicy};
pub use observer::{BoxStream, ObserverId, TransferObserver};
pub use observability::LoggingObserver;
pub use scheduler::{ChunkOutcome, RetryPolicy};
pub use store::{JsonFileStore, MemoryTransferStore, StoredTransfer, TransferStore};
pub use transport::{
    BearerToken, ChunkTransport, CredentialProvider, IdentityTransform, MemoryBlobTransport,
    NoCredentials, PayloadTransform, RangeRequest, RangedGet, RangedPut,
};
pub use clock::{Clock, SystemClock};
pub use types::{
    ByteRange, ChunkRecord, Direction, PauseReason, RemoteRef, RestorationId, TransferEvent,
    TransferEventKind, TransferFilter, TransferId, TransferRecord, TransferSnapshot, TransferState,
};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to drive transfers
pub mod prelude {
    pub use crate::{TransferEngine, TransferEngineBuilder, TransferHandle};

    pub use crate::{DownloadOptions, TransferConfig, UploadOptions};

    pub use crate::{TransferError, TransferResult, TransportError};

    pub use crate::{
        ChunkRecord, Direction, PauseReason, RemoteRef, RestorationId, TransferEvent, TransferEventKind,
        TransferFilter, TransferId, TransferRecord, TransferSnapshot, TransferState,
    };

    pub use crate::{ConnectivityClass, NetworkPolicy};

    pub use crate::{ChunkTransport, CredentialProvider, MemoryBlobTransport, PayloadTransform};

    pub use crate::{JsonFileStore, MemoryTransferStore, TransferStore};

    pub use crate::{LoggingObserver, ObserverId, TransferObserver};

    pub use async_trait::async_trait;
}
