//! Session-scoped signaling channel.
//!
//! One channel per call attempt, bound to the `webrtc-<sessionId>` topic.
//! Incoming broadcasts are decoded into typed [`SignalEvent`]s on a reader
//! task; the channel's own publishes are filtered out so a peer never
//! processes its own offer or candidates.

use super::envelope::{session_topic, SignalEnvelope};
use crate::realtime::{Realtime, RealtimeError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("signaling unavailable: {0}")]
    Unavailable(#[from] RealtimeError),

    #[error("signaling channel already closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

// ============================================================================
// SIGNAL EVENTS
// ============================================================================

/// A decoded envelope from the remote peer.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// A live subscription to one call session's signaling topic.
pub struct SignalingChannel {
    session_id: Uuid,
    topic: String,
    realtime: Arc<dyn Realtime>,
    event_tx: broadcast::Sender<SignalEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalingChannel {
    /// Subscribes to the session topic and starts the decode task.
    pub fn open(realtime: Arc<dyn Realtime>, session_id: Uuid) -> Result<Self, ChannelError> {
        let topic = session_topic(session_id);
        let mut subscription = realtime.subscribe(&topic)?;

        tracing::info!("signaling channel open: {}", topic);

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let own_id = realtime.client_id();
        let events = event_tx.clone();

        // The task owns the subscription; aborting it releases the
        // underlying topic registration.
        let reader = tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                if msg.sender == own_id {
                    // Our own broadcast looped back; never process it.
                    continue;
                }
                let envelope: SignalEnvelope = match serde_json::from_value(msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("ignoring malformed signaling payload: {}", e);
                        continue;
                    }
                };
                if envelope.session_id() != session_id {
                    tracing::warn!(
                        "ignoring envelope for foreign session {} on {}",
                        envelope.session_id(),
                        session_id
                    );
                    continue;
                }
                let event = match envelope {
                    SignalEnvelope::Offer { sdp, .. } => SignalEvent::Offer { sdp },
                    SignalEnvelope::Answer { sdp, .. } => SignalEvent::Answer { sdp },
                    SignalEnvelope::IceCandidate { candidate, .. } => {
                        SignalEvent::Candidate { candidate }
                    }
                };
                let _ = events.send(event);
            }
            tracing::debug!("signaling reader for {} finished", session_id);
        });

        Ok(Self {
            session_id,
            topic,
            realtime,
            event_tx,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Returns a receiver of decoded remote envelopes.
    pub fn events(&self) -> broadcast::Receiver<SignalEvent> {
        self.event_tx.subscribe()
    }

    /// Publishes an envelope to the peer. Best-effort: no delivery ack.
    pub fn send(&self, envelope: &SignalEnvelope) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let payload =
            serde_json::to_value(envelope).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.realtime.publish(&self.topic, payload)?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Unsubscribes and stops the decode task. Safe to call repeatedly;
    /// only the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        tracing::info!("signaling channel closed: {}", self.topic);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("topic", &self.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::MemoryHub;

    #[tokio::test]
    async fn envelopes_cross_between_peers() {
        let hub = MemoryHub::new();
        let session = Uuid::new_v4();

        let caller = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        let callee = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        let mut callee_events = callee.events();

        caller
            .send(&SignalEnvelope::Offer {
                session_id: session,
                sdp: "v=0 offer".to_string(),
            })
            .unwrap();

        match callee_events.recv().await.unwrap() {
            SignalEvent::Offer { sdp } => assert_eq!(sdp, "v=0 offer"),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn own_messages_are_never_delivered_back() {
        let hub = MemoryHub::new();
        let session = Uuid::new_v4();

        let caller = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        let callee = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        let mut caller_events = caller.events();

        // The caller publishes first; if self-echo were processed, its own
        // offer would arrive before the callee's answer.
        caller
            .send(&SignalEnvelope::Offer {
                session_id: session,
                sdp: "offer".to_string(),
            })
            .unwrap();
        callee
            .send(&SignalEnvelope::Answer {
                session_id: session,
                sdp: "answer".to_string(),
            })
            .unwrap();

        match caller_events.recv().await.unwrap() {
            SignalEvent::Answer { sdp } => assert_eq!(sdp, "answer"),
            other => panic!("self-echo was not suppressed: {:?}", other),
        }
    }

    #[tokio::test]
    async fn foreign_session_envelopes_are_dropped() {
        let hub = MemoryHub::new();
        let session = Uuid::new_v4();

        let a = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        let b = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        let mut b_events = b.events();

        // Hand-publish an envelope tagged with a different session id onto
        // the same topic, then a valid one.
        let intruder = hub.client();
        let foreign = SignalEnvelope::Answer {
            session_id: Uuid::new_v4(),
            sdp: "foreign".to_string(),
        };
        crate::realtime::Realtime::publish(
            &intruder,
            &session_topic(session),
            serde_json::to_value(&foreign).unwrap(),
        )
        .unwrap();
        a.send(&SignalEnvelope::Answer {
            session_id: session,
            sdp: "ours".to_string(),
        })
        .unwrap();

        match b_events.recv().await.unwrap() {
            SignalEvent::Answer { sdp } => assert_eq!(sdp, "ours"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_topic() {
        let hub = MemoryHub::new();
        let session = Uuid::new_v4();
        let topic = session_topic(session);

        let channel = SignalingChannel::open(Arc::new(hub.client()), session).unwrap();
        assert_eq!(hub.subscriber_count(&topic), 1);

        channel.close();
        channel.close();
        assert!(channel.is_closed());

        // The aborted reader task drops its subscription on the runtime.
        for _ in 0..50 {
            if hub.subscriber_count(&topic) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(hub.subscriber_count(&topic), 0);

        assert!(matches!(
            channel.send(&SignalEnvelope::Offer {
                session_id: session,
                sdp: String::new(),
            }),
            Err(ChannelError::Closed)
        ));
    }
}
