//! Event Emitter: best-effort delivery of lifecycle notifications.
//!
//! Mutations hand their notifications to [`ChronicleEmitter::emit`], which
//! never blocks and never fails. A background task delivers them in order to
//! the [`ChronicleSink`], retrying with exponential backoff; notifications
//! that exhaust their attempts land in a bounded dead-letter log. The queue
//! in front of the task is bounded too: when it is full, `emit` dead-letters
//! the notification on the spot.
//!
//! Every notification is also published on the in-process [`FlowBus`]
//! before delivery is attempted.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use quire_types::LifecycleEvent;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::config::ChronicleConfig;
use crate::flows::FlowBus;

/// Delivery failures reported by a sink.
#[derive(Debug, Clone, Error)]
pub enum ChronicleError {
    #[error("chronicle unavailable: {0}")]
    Unavailable(String),

    #[error("chronicle rejected event: {0}")]
    Rejected(String),

    #[error("delivery timed out after {0} ms")]
    Timeout(u64),
}

/// The external Chronicle collaborator.
#[async_trait]
pub trait ChronicleSink: Send + Sync {
    async fn deliver(&self, event: &LifecycleEvent) -> Result<(), ChronicleError>;
}

/// Sink that only logs. Used when no Chronicle is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ChronicleSink for TracingSink {
    async fn deliver(&self, event: &LifecycleEvent) -> Result<(), ChronicleError> {
        tracing::info!(
            kind = %event.kind,
            block_id = %event.block_id,
            book_id = %event.book_id,
            occurred_at = event.occurred_at,
            "chronicle event"
        );
        Ok(())
    }
}

/// A notification that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub event: LifecycleEvent,
    pub attempts: u32,
    pub error: String,
}

/// Bounded FIFO of dead letters; the oldest fall off when full.
#[derive(Debug)]
pub struct DeadLetterLog {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn push(&self, letter: DeadLetter) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return all entries, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

enum Dispatch {
    Event(LifecycleEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background delivery task.
#[derive(Clone)]
pub struct ChronicleEmitter {
    tx: mpsc::Sender<Dispatch>,
    bus: FlowBus<LifecycleEvent>,
    dead_letters: Arc<DeadLetterLog>,
}

impl ChronicleEmitter {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(
        sink: Arc<dyn ChronicleSink>,
        config: ChronicleConfig,
        bus: FlowBus<LifecycleEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dead_letters = Arc::new(DeadLetterLog::new(config.dead_letter_capacity));
        tokio::spawn(run(rx, sink, config, dead_letters.clone()));
        Self {
            tx,
            bus,
            dead_letters,
        }
    }

    /// Publish on the bus and queue for delivery. Never fails.
    pub fn emit(&self, event: LifecycleEvent) {
        self.bus.publish(event.clone());
        match self.tx.try_send(Dispatch::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(Dispatch::Event(event))) => {
                tracing::warn!(
                    kind = %event.kind,
                    block_id = %event.block_id,
                    book_id = %event.book_id,
                    "chronicle queue full; dead-lettered"
                );
                self.dead_letters.push(DeadLetter {
                    event,
                    attempts: 0,
                    error: "delivery queue full".to_string(),
                });
            }
            Err(TrySendError::Full(Dispatch::Flush(_))) => {}
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("chronicle delivery task is gone; event dropped");
            }
        }
    }

    /// Wait until everything emitted so far has been delivered or
    /// dead-lettered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn bus(&self) -> &FlowBus<LifecycleEvent> {
        &self.bus
    }

    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }
}

impl std::fmt::Debug for ChronicleEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChronicleEmitter")
            .field("dead_letters", &self.dead_letters.len())
            .finish_non_exhaustive()
    }
}

async fn run(
    mut rx: mpsc::Receiver<Dispatch>,
    sink: Arc<dyn ChronicleSink>,
    config: ChronicleConfig,
    dead_letters: Arc<DeadLetterLog>,
) {
    while let Some(dispatch) = rx.recv().await {
        match dispatch {
            Dispatch::Event(event) => {
                if let Err(letter) = deliver(sink.as_ref(), &config, event).await {
                    tracing::warn!(
                        kind = %letter.event.kind,
                        block_id = %letter.event.block_id,
                        book_id = %letter.event.book_id,
                        attempts = letter.attempts,
                        error = %letter.error,
                        "chronicle delivery failed; dead-lettered"
                    );
                    dead_letters.push(letter);
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("chronicle delivery task stopped");
}

async fn deliver(
    sink: &dyn ChronicleSink,
    config: &ChronicleConfig,
    event: LifecycleEvent,
) -> Result<(), DeadLetter> {
    let mut last_error = String::new();
    for attempt in 1..=config.max_attempts {
        let outcome = match tokio::time::timeout(config.timeout(), sink.deliver(&event)).await {
            Ok(result) => result,
            Err(_) => Err(ChronicleError::Timeout(config.timeout_ms)),
        };
        match outcome {
            Ok(()) => {
                if attempt > 1 {
                    tracing::debug!(attempt, block_id = %event.block_id, "chronicle delivered after retry");
                }
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "chronicle delivery attempt failed");
                last_error = e.to_string();
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.backoff(attempt)).await;
                }
            }
        }
    }
    Err(DeadLetter {
        event,
        attempts: config.max_attempts,
        error: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use quire_types::{BlockId, BookId, ChangeType};

    fn event(change: ChangeType) -> LifecycleEvent {
        LifecycleEvent::new(BlockId::new(), BookId::new(), change, 7)
    }

    fn fast_config() -> ChronicleConfig {
        ChronicleConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            timeout_ms: 20,
            queue_capacity: 16,
            dead_letter_capacity: 2,
        }
    }

    /// Fails the first `failures` calls, then records deliveries.
    #[derive(Default)]
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<LifecycleEvent>>,
    }

    #[async_trait]
    impl ChronicleSink for FlakySink {
        async fn deliver(&self, event: &LifecycleEvent) -> Result<(), ChronicleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ChronicleError::Unavailable(format!("call {n}")));
            }
            self.delivered.lock().push(event.clone());
            Ok(())
        }
    }

    struct HangingSink;

    #[async_trait]
    impl ChronicleSink for HangingSink {
        async fn deliver(&self, _event: &LifecycleEvent) -> Result<(), ChronicleError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let sink = Arc::new(FlakySink::default());
        let emitter = ChronicleEmitter::spawn(sink.clone(), fast_config(), FlowBus::new(8));
        let a = event(ChangeType::Created);
        let b = event(ChangeType::SoftDeleted);
        emitter.emit(a.clone());
        emitter.emit(b.clone());
        emitter.flush().await;
        assert_eq!(*sink.delivered.lock(), vec![a, b]);
        assert!(emitter.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let sink = Arc::new(FlakySink {
            failures: 2,
            ..Default::default()
        });
        let emitter = ChronicleEmitter::spawn(sink.clone(), fast_config(), FlowBus::new(8));
        emitter.emit(event(ChangeType::Restored));
        emitter.flush().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.delivered.lock().len(), 1);
        assert!(emitter.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            ..Default::default()
        });
        let emitter = ChronicleEmitter::spawn(sink, fast_config(), FlowBus::new(8));
        let e = event(ChangeType::Purged);
        emitter.emit(e.clone());
        emitter.flush().await;

        let letters = emitter.dead_letters().snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event, e);
        assert_eq!(letters[0].attempts, 3);
        assert!(letters[0].error.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_timeouts_dead_letter() {
        let emitter = ChronicleEmitter::spawn(Arc::new(HangingSink), fast_config(), FlowBus::new(8));
        emitter.emit(event(ChangeType::Created));
        tokio::time::timeout(Duration::from_secs(5), emitter.flush())
            .await
            .unwrap();
        let letters = emitter.dead_letters().drain();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("timed out"));
        assert!(emitter.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_dead_letters_without_waiting() {
        let config = ChronicleConfig {
            queue_capacity: 2,
            dead_letter_capacity: 8,
            ..fast_config()
        };
        let emitter = ChronicleEmitter::spawn(Arc::new(HangingSink), config, FlowBus::new(8));
        let events: Vec<_> = (0..5).map(|_| event(ChangeType::Created)).collect();
        // No await in between: the delivery task has not taken anything yet.
        for e in &events {
            emitter.emit(e.clone());
        }

        let overflow = emitter.dead_letters().snapshot();
        assert_eq!(overflow.len(), 3);
        assert!(overflow.iter().all(|l| l.attempts == 0 && l.error.contains("queue full")));
        let dropped: Vec<_> = overflow.into_iter().map(|l| l.event).collect();
        assert_eq!(dropped, events[2..].to_vec());

        // The queued two still go through the normal retry path.
        tokio::time::timeout(Duration::from_secs(5), emitter.flush())
            .await
            .unwrap();
        let letters = emitter.dead_letters().snapshot();
        assert_eq!(letters.len(), 5);
        assert!(letters[3..].iter().all(|l| l.attempts == 3));
    }

    #[tokio::test]
    async fn test_dead_letter_log_is_bounded() {
        let log = DeadLetterLog::new(2);
        for attempts in 1..=3 {
            log.push(DeadLetter {
                event: event(ChangeType::Created),
                attempts,
                error: String::new(),
            });
        }
        let kept: Vec<u32> = log.snapshot().iter().map(|l| l.attempts).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_emit_publishes_on_bus() {
        let bus = FlowBus::new(8);
        let mut sub = bus.subscribe("block.>");
        let emitter = ChronicleEmitter::spawn(Arc::new(TracingSink), fast_config(), bus);
        emitter.emit(event(ChangeType::TypeChanged));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "block.type_changed");
    }
}
