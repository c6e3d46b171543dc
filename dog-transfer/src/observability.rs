//! Logging helpers for embedding applications.

use tracing::{debug, info, warn};

use crate::observer::TransferObserver;
use crate::types::{TransferEvent, TransferEventKind};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` when a global subscriber was already installed.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing() -> bool {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .is_ok()
}

/// Observer that mirrors transfer events into `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl TransferObserver for LoggingObserver {
    fn on_event(&self, event: &TransferEvent) {
        let snapshot = &event.snapshot;
        match &event.kind {
            TransferEventKind::StateChanged { from, to } => info!(
                transfer = %snapshot.id,
                seq = event.seq,
                %from,
                %to,
                "transfer state changed"
            ),
            TransferEventKind::PauseReasonChanged { reason } => info!(
                transfer = %snapshot.id,
                seq = event.seq,
                ?reason,
                "transfer pause reason changed"
            ),
            TransferEventKind::Retrying { chunk_index, attempt, error } => warn!(
                transfer = %snapshot.id,
                seq = event.seq,
                chunk = chunk_index,
                attempt,
                error = %error,
                "chunk retrying"
            ),
            TransferEventKind::PersistenceWarning { error } => warn!(
                transfer = %snapshot.id,
                seq = event.seq,
                error = %error,
                "transfer progress not persisted"
            ),
            kind => debug!(
                transfer = %snapshot.id,
                seq = event.seq,
                event = kind.event_name(),
                bytes = snapshot.bytes_transferred,
                "transfer event"
            ),
        }
    }
}
