//! Event fan-out to registered observers and event streams.
//!
//! Events are sequenced at generation time and handed to a single delivery
//! task, so every observer sees every transfer's events in generation order.

use futures_core::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::types::{TransferEvent, TransferEventKind, TransferSnapshot};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Handle returned by `register_observer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

/// Receives every transfer event on the delivery task
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

impl<F> TransferObserver for F
where
    F: Fn(&TransferEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransferEvent) {
        self(event)
    }
}

type Listeners = Arc<RwLock<BTreeMap<ObserverId, Arc<dyn TransferObserver>>>>;

pub(crate) struct ObserverHub {
    listeners: Listeners,
    next_observer: AtomicU64,
    next_seq: AtomicU64,
    delivery: mpsc::UnboundedSender<TransferEvent>,
    broadcaster: broadcast::Sender<TransferEvent>,
    clock: Arc<dyn Clock>,
}

impl ObserverHub {
    /// Create the hub and spawn its delivery task on `handle`
    pub(crate) fn new(handle: &Handle, clock: Arc<dyn Clock>) -> Self {
        let listeners: Listeners = Arc::new(RwLock::new(BTreeMap::new()));
        let (delivery, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let (broadcaster, _) = broadcast::channel(1000);

        let task_listeners = listeners.clone();
        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                let current: Vec<(ObserverId, Arc<dyn TransferObserver>)> = task_listeners
                    .read()
                    .iter()
                    .map(|(id, listener)| (*id, listener.clone()))
                    .collect();

                for (id, listener) in current {
                    if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                        warn!(observer = id.0, seq = event.seq, "observer panicked while handling event");
                    }
                }
            }
            debug!("event delivery task stopped");
        });

        Self {
            listeners,
            next_observer: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            delivery,
            broadcaster,
            clock,
        }
    }

    pub(crate) fn register(&self, observer: Arc<dyn TransferObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, observer);
        id
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Sequence and publish an event. Callers hold the transfer table lock,
    /// which keeps `seq` order equal to generation order.
    pub(crate) fn emit(&self, kind: TransferEventKind, snapshot: TransferSnapshot) {
        let event = TransferEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            kind,
            snapshot,
            at: self.clock.now(),
        };

        let _ = self.broadcaster.send(event.clone());
        if self.delivery.send(event).is_err() {
            debug!("event delivery task is gone; event dropped");
        }
    }

    pub(crate) fn events(&self) -> BoxStream<TransferEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};

        let stream = BroadcastStream::new(self.broadcaster.subscribe()).filter_map(|result| result.ok());
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{Direction, TransferId, TransferState};
    use std::time::Duration;

    fn snapshot() -> TransferSnapshot {
        TransferSnapshot {
            id: TransferId::new(),
            direction: Direction::Upload,
            state: TransferState::Pending,
            pause_reason: None,
            bytes_transferred: 0,
            total_bytes: Some(1),
            error: None,
            durable: true,
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_seq_order() {
        let hub = ObserverHub::new(&Handle::current(), Arc::new(SystemClock));
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(Arc::new(move |event: &TransferEvent| {
            let _ = tx.send(event.seq);
        }));

        for _ in 0..5 {
            hub.emit(TransferEventKind::Created, snapshot());
        }

        let mut seen = Vec::new();
        while seen.len() < 5 {
            let seq = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(seq);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_unregistered_observer_stops_receiving() {
        let hub = ObserverHub::new(&Handle::current(), Arc::new(SystemClock));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(Arc::new(move |event: &TransferEvent| {
            let _ = tx.send(event.seq);
        }));

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        hub.emit(TransferEventKind::Created, snapshot());

        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(received, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_event_stream_receives_emitted_events() {
        use tokio_stream::StreamExt;

        let hub = ObserverHub::new(&Handle::current(), Arc::new(SystemClock));
        let mut events = hub.events();
        hub.emit(TransferEventKind::Removed, snapshot());

        let event = events.next().await.unwrap();
        assert_eq!(event.kind, TransferEventKind::Removed);
        assert_eq!(event.seq, 1);
    }
}
