//! WebSocket realtime client.
//!
//! Connects to a relay server that fans broadcasts out to every subscriber
//! of a topic and pushes row-insert notifications for watched tables. The
//! connection is split into a spawned read task and a spawned write task
//! fed by an mpsc queue; all trait methods are non-blocking and enqueue
//! frames with `try_send`.

use super::{
    Realtime, RealtimeError, RowFeed, RowInsert, Subscription, SubscriptionGuard, WireMessage,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 100;
const HEARTBEAT_INTERVAL_SECS: u64 = 25;

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// Frames exchanged with the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Broadcast {
        topic: String,
        sender: Uuid,
        payload: serde_json::Value,
        timestamp: i64,
    },
    Watch {
        table: String,
        column: String,
        value: String,
    },
    RowInserted {
        table: String,
        row: serde_json::Value,
        timestamp: i64,
    },
    Heartbeat {
        sender: Uuid,
    },
    Pong {
        timestamp: i64,
    },
}

// ============================================================================
// CLIENT
// ============================================================================

struct SocketShared {
    client_id: Uuid,
    connected: AtomicBool,
    tx: mpsc::Sender<String>,
    topics: RwLock<HashMap<String, broadcast::Sender<WireMessage>>>,
    tables: RwLock<HashMap<String, broadcast::Sender<RowInsert>>>,
}

impl SocketShared {
    fn send_frame(&self, frame: &Frame) -> Result<(), RealtimeError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RealtimeError::NotConnected);
        }
        let text = serde_json::to_string(frame)
            .map_err(|e| RealtimeError::PublishFailed(e.to_string()))?;
        self.tx
            .try_send(text)
            .map_err(|e| RealtimeError::PublishFailed(e.to_string()))
    }
}

/// WebSocket-backed [`Realtime`] implementation. Cheap to clone.
#[derive(Clone)]
pub struct SocketRealtime {
    shared: Arc<SocketShared>,
}

impl SocketRealtime {
    /// Connects to the relay server and spawns the IO tasks.
    pub async fn connect(server_url: &str) -> Result<Self, RealtimeError> {
        let ws_url = url::Url::parse(server_url)
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        tracing::info!("connecting to realtime server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        let shared = Arc::new(SocketShared {
            client_id: Uuid::new_v4(),
            connected: AtomicBool::new(true),
            tx,
            topics: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
        });

        // Read task: decode frames and route them to topic/table channels.
        let shared_read = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => Self::route_frame(frame, &shared_read),
                        Err(e) => tracing::warn!("ignoring malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("realtime connection closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("realtime read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            shared_read.connected.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every subscription with Closed.
            shared_read.topics.write().clear();
            shared_read.tables.write().clear();
        });

        // Write task: drain the queue onto the socket.
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("realtime write error: {}", e);
                    break;
                }
            }
        });

        let client = Self { shared };
        client.start_heartbeat();
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Periodic heartbeat so relay idle timeouts do not drop the socket.
    fn start_heartbeat(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !shared.connected.load(Ordering::SeqCst) {
                    break;
                }
                let frame = Frame::Heartbeat {
                    sender: shared.client_id,
                };
                if let Err(e) = shared.send_frame(&frame) {
                    tracing::warn!("failed to send heartbeat: {}", e);
                }
            }
        });
    }

    fn route_frame(frame: Frame, shared: &Arc<SocketShared>) {
        match frame {
            Frame::Broadcast {
                topic,
                sender,
                payload,
                timestamp,
            } => {
                let tx = shared.topics.read().get(&topic).cloned();
                if let Some(tx) = tx {
                    let _ = tx.send(WireMessage {
                        topic,
                        sender,
                        payload,
                        sent_at: timestamp,
                    });
                }
            }
            Frame::RowInserted { table, row, .. } => {
                let tx = shared.tables.read().get(&table).cloned();
                if let Some(tx) = tx {
                    let _ = tx.send(RowInsert { table, row });
                }
            }
            Frame::Pong { .. } => {}
            other => {
                tracing::debug!("ignoring unexpected server frame: {:?}", other);
            }
        }
    }
}

impl Realtime for SocketRealtime {
    fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    fn subscribe(&self, topic: &str) -> Result<Subscription, RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            });
        }

        let rx = self
            .shared
            .topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        self.shared.send_frame(&Frame::Subscribe {
            topic: topic.to_string(),
        })?;

        let shared = Arc::clone(&self.shared);
        let name = topic.to_string();
        let guard = SubscriptionGuard::new(move || {
            let idle = shared
                .topics
                .read()
                .get(&name)
                .map(|tx| tx.receiver_count() == 0)
                .unwrap_or(false);
            if idle {
                shared.topics.write().remove(&name);
                let _ = shared.send_frame(&Frame::Unsubscribe { topic: name });
            }
        });

        Ok(Subscription::new(topic.to_string(), rx, guard))
    }

    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), RealtimeError> {
        self.shared.send_frame(&Frame::Broadcast {
            topic: topic.to_string(),
            sender: self.shared.client_id,
            payload,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    fn watch_inserts(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<RowFeed, RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::SubscribeFailed {
                topic: table.to_string(),
                reason: "not connected".to_string(),
            });
        }

        let rx = self
            .shared
            .tables
            .write()
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        self.shared.send_frame(&Frame::Watch {
            table: table.to_string(),
            column: column.to_string(),
            value: value.to_string(),
        })?;

        Ok(RowFeed::new(
            table.to_string(),
            column.to_string(),
            value.to_string(),
            rx,
            SubscriptionGuard::noop(),
        ))
    }
}

impl std::fmt::Debug for SocketRealtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRealtime")
            .field("client_id", &self.shared.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_as_tagged_json() {
        let frame = Frame::Broadcast {
            topic: "webrtc-abc".to_string(),
            sender: Uuid::new_v4(),
            payload: serde_json::json!({ "type": "offer" }),
            timestamp: 1_700_000_000_000,
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"broadcast\""));

        let decoded: Frame = serde_json::from_str(&text).unwrap();
        match decoded {
            Frame::Broadcast { topic, .. } => assert_eq!(topic, "webrtc-abc"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn watch_frame_carries_predicate() {
        let frame = Frame::Watch {
            table: "call_sessions".to_string(),
            column: "callee_id".to_string(),
            value: "user-1".to_string(),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"watch\""));
        assert!(text.contains("callee_id"));
    }
}
