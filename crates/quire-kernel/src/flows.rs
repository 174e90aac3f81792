//! FlowBus pub/sub for lifecycle notifications.
//!
//! The FlowBus provides a typed publish/subscribe mechanism for in-process
//! consumers of block lifecycle events. Subscribers use NATS-style subject
//! patterns to filter events of interest.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `block.*` matches `block.created` but not `block.a.b`
//! - `>` matches one or more tokens (only at end): `block.>` matches `block.created` and `block.a.b`
//! - Exact match: `block.purged` only matches `block.purged`
//!
//! # Example
//!
//! ```ignore
//! let bus = FlowBus::<LifecycleEvent>::new(1024);
//! let mut sub = bus.subscribe("block.*");
//! bus.publish(event);
//! while let Some(msg) = sub.recv().await {
//!     println!("Got: {}", msg.subject);
//! }
//! ```

use std::time::Instant;

use quire_types::LifecycleEvent;
use tokio::sync::broadcast;

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// Patterns use NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens (only at end)
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                // `>` must be last and swallows the rest
                return pi == pattern_tokens.len() - 1;
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

impl HasSubject for LifecycleEvent {
    fn subject(&self) -> &str {
        LifecycleEvent::subject(self)
    }
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from payload).
    pub subject: String,
    pub payload: T,
    /// When this message was published.
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T) -> Self {
        Self {
            subject: payload.subject().to_string(),
            payload,
            timestamp: Instant::now(),
        }
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Type-parameterized pub/sub bus.
///
/// Uses a broadcast channel internally for multi-subscriber delivery.
/// Publishing never blocks; slow subscribers lag and skip ahead.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    /// Create a new flow bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload. Returns the number of subscribers that got it.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload)).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    ///
    /// Returns None once the bus is dropped.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_types::{BlockId, BookId, ChangeType};

    fn event(change: ChangeType) -> LifecycleEvent {
        LifecycleEvent::new(BlockId::new(), BookId::new(), change, 1)
    }

    #[test]
    fn test_pattern_matching_exact() {
        assert!(matches_pattern("block.created", "block.created"));
        assert!(!matches_pattern("block.created", "block.purged"));
        assert!(!matches_pattern("block.created", "block.created.extra"));
    }

    #[test]
    fn test_pattern_matching_single_wildcard() {
        assert!(matches_pattern("block.*", "block.created"));
        assert!(matches_pattern("*.created", "block.created"));
        assert!(!matches_pattern("block.*", "block.a.b"));
        assert!(!matches_pattern("block.*", "block"));
    }

    #[test]
    fn test_pattern_matching_multi_wildcard() {
        assert!(matches_pattern("block.>", "block.created"));
        assert!(matches_pattern("block.>", "block.a.b"));
        assert!(matches_pattern(">", "block.created"));
        assert!(!matches_pattern("block.>", "block"));
        assert!(!matches_pattern("block.>.x", "block.a.x"));
    }

    #[tokio::test]
    async fn test_flow_bus_publish_subscribe() {
        let bus = FlowBus::<LifecycleEvent>::new(16);
        let mut sub = bus.subscribe("block.*");
        assert_eq!(bus.subscriber_count(), 1);

        let sent = event(ChangeType::Created);
        assert_eq!(bus.publish(sent.clone()), 1);

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "block.created");
        assert_eq!(msg.payload, sent);
    }

    #[tokio::test]
    async fn test_subscription_pattern_filtering() {
        let bus = FlowBus::<LifecycleEvent>::new(16);
        let mut deletes = bus.subscribe("block.soft_deleted");
        let mut all = bus.subscribe("block.>");

        bus.publish(event(ChangeType::Created));
        bus.publish(event(ChangeType::SoftDeleted));
        bus.publish(event(ChangeType::Reordered));

        let msg = deletes.recv().await.unwrap();
        assert_eq!(msg.payload.change_type, ChangeType::SoftDeleted);
        assert!(deletes.try_recv().is_none());

        let subjects: Vec<String> = std::iter::from_fn(|| all.try_recv())
            .map(|m| m.subject)
            .collect();
        assert_eq!(
            subjects,
            vec!["block.created", "block.soft_deleted", "block.updated"]
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = FlowBus::<LifecycleEvent>::new(4);
        assert_eq!(bus.publish(event(ChangeType::Purged)), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let bus = FlowBus::<LifecycleEvent>::new(2);
        let mut sub = bus.subscribe(">");
        for _ in 0..5 {
            bus.publish(event(ChangeType::ContentUpdated));
        }
        bus.publish(event(ChangeType::Restored));
        // Oldest messages were overwritten; the newest survive.
        let mut last = None;
        while let Some(msg) = sub.try_recv() {
            last = Some(msg.payload.change_type);
        }
        assert_eq!(last, Some(ChangeType::Restored));
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_bus_dropped() {
        let bus = FlowBus::<LifecycleEvent>::new(4);
        let mut sub = bus.subscribe(">");
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
