//! Realtime broadcast interface
//!
//! The call core never talks to a concrete backend directly: everything it
//! needs from the hosted realtime service is expressed as the [`Realtime`]
//! trait, topic-scoped broadcast plus a row-insert feed filtered by a
//! column predicate. Two implementations live here:
//! - [`SocketRealtime`]: a WebSocket client for a relay server
//! - [`MemoryRealtime`]: an in-process loopback bus for tests and
//!   single-process setups

mod memory;
mod socket;

pub use memory::{MemoryHub, MemoryRealtime};
pub use socket::SocketRealtime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum RealtimeError {
    #[error("not connected to realtime backend")]
    NotConnected,

    #[error("failed to subscribe to {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("failed to publish message: {0}")]
    PublishFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// One broadcast message on a topic.
///
/// `sender` is the publishing client's id; receivers use it to drop their
/// own echoes on backends that loop messages back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub topic: String,
    pub sender: Uuid,
    pub payload: serde_json::Value,
    pub sent_at: i64,
}

/// One row inserted into a watched table, delivered as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowInsert {
    pub table: String,
    pub row: serde_json::Value,
}

// ============================================================================
// SUBSCRIPTION HANDLES
// ============================================================================

/// Runs its cancel hook exactly once, either on [`close`](Self::close) or on
/// drop.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// No-op guard, for backends where dropping the receiver is enough.
    pub(crate) fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// A live subscription to one broadcast topic.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<WireMessage>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        rx: broadcast::Receiver<WireMessage>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self { topic, rx, guard }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receives the next message, or `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("subscription to {} lagged, skipped {}", self.topic, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn close(&mut self) {
        // The receiver must be gone before the cancel hook runs, so the
        // backend's idle check sees this subscriber as departed.
        let (_tx, rx) = broadcast::channel(1);
        self.rx = rx;
        self.guard.close();
    }
}

/// A live row-insert feed for one `table` where `column = value`.
pub struct RowFeed {
    table: String,
    column: String,
    value: String,
    rx: broadcast::Receiver<RowInsert>,
    guard: SubscriptionGuard,
}

impl RowFeed {
    pub(crate) fn new(
        table: String,
        column: String,
        value: String,
        rx: broadcast::Receiver<RowInsert>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            table,
            column,
            value,
            rx,
            guard,
        }
    }

    /// Receives the next matching insert, or `None` once the backend is gone.
    ///
    /// Inserts that do not satisfy the column predicate are filtered out
    /// here, so backends are free to deliver the whole table's feed.
    pub async fn recv(&mut self) -> Option<RowInsert> {
        loop {
            match self.rx.recv().await {
                Ok(insert) => {
                    if insert.table == self.table && self.matches(&insert.row) {
                        return Some(insert);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("row feed for {} lagged, skipped {}", self.table, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }

    pub fn close(&mut self) {
        // Same ordering as `Subscription::close`: replace the receiver
        // first so the backend's idle check does not count this feed.
        let (_tx, rx) = broadcast::channel(1);
        self.rx = rx;
        self.guard.close();
    }
}

// ============================================================================
// REALTIME TRAIT
// ============================================================================

/// The broadcast/row-feed contract the call core consumes.
///
/// Methods are non-blocking: publishing is best-effort fire-and-forget
/// (queued onto the transport), and subscribing registers locally before the
/// backend acknowledges anything.
pub trait Realtime: Send + Sync {
    /// Stable id of this client, stamped on everything it publishes.
    fn client_id(&self) -> Uuid;

    /// Subscribes to a broadcast topic.
    fn subscribe(&self, topic: &str) -> Result<Subscription, RealtimeError>;

    /// Publishes a payload onto a topic. Best-effort, no delivery ack.
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), RealtimeError>;

    /// Watches `table` for inserted rows where `column = value`.
    fn watch_inserts(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<RowFeed, RealtimeError>;
}
