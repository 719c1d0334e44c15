//! In-process loopback realtime bus.
//!
//! A [`MemoryHub`] is shared by any number of [`MemoryRealtime`] clients and
//! relays broadcasts between them. Tests use it to run both peers of a call
//! inside one process; it also stands in for the row-change feed by letting
//! the caller emit inserts explicitly.

use super::{
    Realtime, RealtimeError, RowFeed, RowInsert, Subscription, SubscriptionGuard, WireMessage,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const TOPIC_CAPACITY: usize = 100;

/// Shared fan-out state for a set of loopback clients.
pub struct MemoryHub {
    topics: Mutex<HashMap<String, broadcast::Sender<WireMessage>>>,
    tables: Mutex<HashMap<String, broadcast::Sender<RowInsert>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a client with a fresh id attached to this hub.
    pub fn client(self: &Arc<Self>) -> MemoryRealtime {
        MemoryRealtime {
            id: Uuid::new_v4(),
            hub: Arc::clone(self),
        }
    }

    /// Emits a row insert onto the table feed, as the backing database
    /// would after an `INSERT`.
    pub fn emit_insert(&self, table: &str, row: serde_json::Value) {
        let tx = self.table_sender(table);
        let _ = tx.send(RowInsert {
            table: table.to_string(),
            row,
        });
    }

    /// Number of live subscriptions on a topic. Used by tests to detect
    /// leaked channels.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<WireMessage> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn table_sender(&self, table: &str) -> broadcast::Sender<RowInsert> {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn drop_topic_if_idle(&self, topic: &str) {
        let mut topics = self.topics.lock();
        if let Some(tx) = topics.get(topic) {
            if tx.receiver_count() == 0 {
                topics.remove(topic);
            }
        }
    }
}

/// One loopback client. Cheap to clone.
#[derive(Clone)]
pub struct MemoryRealtime {
    id: Uuid,
    hub: Arc<MemoryHub>,
}

impl MemoryRealtime {
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Realtime for MemoryRealtime {
    fn client_id(&self) -> Uuid {
        self.id
    }

    fn subscribe(&self, topic: &str) -> Result<Subscription, RealtimeError> {
        let rx = self.hub.topic_sender(topic).subscribe();
        let hub = Arc::clone(&self.hub);
        let name = topic.to_string();
        let guard = SubscriptionGuard::new(move || hub.drop_topic_if_idle(&name));
        Ok(Subscription::new(topic.to_string(), rx, guard))
    }

    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), RealtimeError> {
        let msg = WireMessage {
            topic: topic.to_string(),
            sender: self.id,
            payload,
            sent_at: Utc::now().timestamp_millis(),
        };
        // A send error just means nobody is listening yet; best-effort.
        let _ = self.hub.topic_sender(topic).send(msg);
        Ok(())
    }

    fn watch_inserts(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<RowFeed, RealtimeError> {
        let rx = self.hub.table_sender(table).subscribe();
        Ok(RowFeed::new(
            table.to_string(),
            column.to_string(),
            value.to_string(),
            rx,
            SubscriptionGuard::noop(),
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================
