//! Incoming call notifier
//!
//! Watches `call_sessions` inserts addressed at one user and turns each
//! fresh row into an incoming-call prompt with the caller's resolved
//! display name. Accepting yields the receiver-side [`CallConfig`];
//! rejecting closes the session as failed without ever opening devices or
//! a peer connection.

use crate::call::{CallConfig, CallRole};
use crate::realtime::{Realtime, RealtimeError};
use crate::store::{CallSession, CallStatus, CallStore, StoreError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// EVENTS
// ============================================================================

/// A ringing call waiting for the user's decision.
#[derive(Debug, Clone)]
pub struct CallInvite {
    pub session_id: Uuid,
    pub booking_id: Uuid,
    pub caller_id: Uuid,
    pub caller_name: String,
    pub call_type: crate::store::CallKind,
}

#[derive(Debug, Clone)]
pub enum NotifyEvent {
    IncomingCall(CallInvite),
}

// ============================================================================
// NOTIFIER
// ============================================================================

/// Long-lived listener for calls addressed at one user.
pub struct IncomingCallNotifier {
    user_id: Uuid,
    store: Arc<CallStore>,
    event_tx: broadcast::Sender<NotifyEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl IncomingCallNotifier {
    /// Subscribes to the insert feed and starts the listener task.
    pub fn start(
        realtime: Arc<dyn Realtime>,
        store: Arc<CallStore>,
        user_id: Uuid,
    ) -> Result<Self, NotifyError> {
        let mut feed =
            realtime.watch_inserts("call_sessions", "callee_id", &user_id.to_string())?;

        tracing::info!("listening for incoming calls to {}", user_id);

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let events = event_tx.clone();
        let listener_store = Arc::clone(&store);

        let listener = tokio::spawn(async move {
            while let Some(insert) = feed.recv().await {
                Self::handle_insert(&listener_store, &events, insert.row);
            }
            tracing::debug!("incoming call feed for {} closed", user_id);
        });

        Ok(Self {
            user_id,
            store,
            event_tx,
            listener: Mutex::new(Some(listener)),
            stopped: AtomicBool::new(false),
        })
    }

    fn handle_insert(
        store: &CallStore,
        events: &broadcast::Sender<NotifyEvent>,
        row: serde_json::Value,
    ) {
        let session: CallSession = match serde_json::from_value(row) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("ignoring malformed call_sessions row: {}", e);
                return;
            }
        };

        // Rows replayed after the call moved on are not ringing anymore.
        if session.status != CallStatus::Initiated {
            tracing::debug!(
                "ignoring call {} in status {}, not ringing",
                session.id,
                session.status
            );
            return;
        }

        let caller_name = match store.caller_display_name(&session) {
            Ok(name) => name,
            Err(e) => {
                // A prompt without a name would be useless; skip this call
                // but keep listening for the next one.
                tracing::warn!("cannot resolve caller for call {}: {}", session.id, e);
                return;
            }
        };

        tracing::info!(
            "incoming {} call {} from {}",
            session.call_type.as_str(),
            session.id,
            caller_name
        );

        let _ = events.send(NotifyEvent::IncomingCall(CallInvite {
            session_id: session.id,
            booking_id: session.booking_id,
            caller_id: session.caller_id,
            caller_name,
            call_type: session.call_type,
        }));
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifyEvent> {
        self.event_tx.subscribe()
    }

    /// Receiver-side config for a ringing call the user accepted.
    pub fn accept(&self, invite: &CallInvite) -> CallConfig {
        CallConfig::for_kind(invite.session_id, CallRole::Receiver, invite.call_type)
    }

    /// Declines a ringing call: the session is closed as failed and no
    /// devices or peer connection are ever touched.
    pub fn reject(&self, session_id: Uuid) {
        match self.store.finish(session_id, CallStatus::Failed) {
            Ok(_) => tracing::info!("rejected call {}", session_id),
            Err(e) => tracing::warn!("failed to reject call {}: {}", session_id, e),
        }
    }

    /// Stops the listener. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        tracing::info!("stopped listening for incoming calls to {}", self.user_id);
    }
}

impl Drop for IncomingCallNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::MemoryHub;
    use crate::store::{CallKind, NewCallSession};

    struct Fixture {
        hub: Arc<MemoryHub>,
        store: Arc<CallStore>,
        mentor_user: Uuid,
        mentee_user: Uuid,
        booking: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let mentor_user = Uuid::new_v4();
        let mentee_user = Uuid::new_v4();
        let mentor_profile = Uuid::new_v4();
        let booking = Uuid::new_v4();

        store
            .add_mentor(mentor_profile, mentor_user, "Dr. Ada Lovelace")
            .unwrap();
        store.add_user(mentee_user, "Grace", "Hopper").unwrap();
        store
            .add_booking(booking, mentor_profile, mentee_user)
            .unwrap();

        Fixture {
            hub: MemoryHub::new(),
            store,
            mentor_user,
            mentee_user,
            booking,
        }
    }

    fn ring(fx: &Fixture) -> CallSession {
        let session = fx
            .store
            .initiate(NewCallSession {
                booking_id: fx.booking,
                caller_id: fx.mentor_user,
                callee_id: fx.mentee_user,
                call_type: CallKind::Video,
            })
            .unwrap();
        fx.hub
            .emit_insert("call_sessions", serde_json::to_value(&session).unwrap());
        session
    }

    #[tokio::test]
    async fn incoming_call_prompt_carries_the_resolved_name() {
        let fx = fixture();
        let notifier = IncomingCallNotifier::start(
            Arc::new(fx.hub.client()),
            Arc::clone(&fx.store),
            fx.mentee_user,
        )
        .unwrap();
        let mut events = notifier.subscribe();

        let session = ring(&fx);

        let NotifyEvent::IncomingCall(invite) = events.recv().await.unwrap();
        assert_eq!(invite.session_id, session.id);
        assert_eq!(invite.caller_name, "Dr. Ada Lovelace");
        assert_eq!(invite.call_type, CallKind::Video);

        // Accepting hands over a receiver-side config for the same session.
        let config = notifier.accept(&invite);
        assert_eq!(config.session_id, session.id);
        assert_eq!(config.role, CallRole::Receiver);
        assert!(config.want_video);
    }

    #[tokio::test]
    async fn calls_for_other_users_are_not_prompted() {
        let fx = fixture();
        let notifier = IncomingCallNotifier::start(
            Arc::new(fx.hub.client()),
            Arc::clone(&fx.store),
            fx.mentor_user, // listening as the mentor, who is the caller
        )
        .unwrap();
        let mut events = notifier.subscribe();

        let to_mentee = ring(&fx); // addressed at the mentee, must not ring here
        fx.store.finish(to_mentee.id, CallStatus::Failed).unwrap();

        // A call back in the other direction is the first thing this
        // listener may see.
        let to_mentor = fx
            .store
            .initiate(NewCallSession {
                booking_id: fx.booking,
                caller_id: fx.mentee_user,
                callee_id: fx.mentor_user,
                call_type: CallKind::Audio,
            })
            .unwrap();
        fx.hub
            .emit_insert("call_sessions", serde_json::to_value(&to_mentor).unwrap());

        let NotifyEvent::IncomingCall(invite) = events.recv().await.unwrap();
        assert_eq!(invite.session_id, to_mentor.id);
        assert_eq!(invite.caller_name, "Grace Hopper");
    }

    #[tokio::test]
    async fn reject_fails_the_session_without_devices() {
        let fx = fixture();
        let notifier = IncomingCallNotifier::start(
            Arc::new(fx.hub.client()),
            Arc::clone(&fx.store),
            fx.mentee_user,
        )
        .unwrap();
        let mut events = notifier.subscribe();

        let session = ring(&fx);
        let NotifyEvent::IncomingCall(invite) = events.recv().await.unwrap();

        notifier.reject(invite.session_id);

        let recorded = fx.store.get_session(session.id).unwrap();
        assert_eq!(recorded.status, CallStatus::Failed);
        assert!(recorded.started_at.is_none());

        // Rejecting twice only logs; the stored status is untouched.
        notifier.reject(invite.session_id);
        let recorded = fx.store.get_session(session.id).unwrap();
        assert_eq!(recorded.status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn unresolvable_caller_is_skipped_but_the_listener_survives() {
        let fx = fixture();
        let notifier = IncomingCallNotifier::start(
            Arc::new(fx.hub.client()),
            Arc::clone(&fx.store),
            fx.mentee_user,
        )
        .unwrap();
        let mut events = notifier.subscribe();

        // A session whose booking the store has never seen.
        let orphan = fx
            .store
            .initiate(NewCallSession {
                booking_id: Uuid::new_v4(),
                caller_id: fx.mentor_user,
                callee_id: fx.mentee_user,
                call_type: CallKind::Audio,
            })
            .unwrap();
        fx.hub
            .emit_insert("call_sessions", serde_json::to_value(&orphan).unwrap());
        fx.store.finish(orphan.id, CallStatus::Failed).unwrap();

        // The next well-formed call still rings.
        let session = ring(&fx);
        let NotifyEvent::IncomingCall(invite) = events.recv().await.unwrap();
        assert_eq!(invite.session_id, session.id);
    }

    #[tokio::test]
    async fn stale_rows_do_not_ring() {
        let fx = fixture();
        let notifier = IncomingCallNotifier::start(
            Arc::new(fx.hub.client()),
            Arc::clone(&fx.store),
            fx.mentee_user,
        )
        .unwrap();
        let mut events = notifier.subscribe();

        // A replayed row for a call that already ended.
        let session = ring(&fx);
        let NotifyEvent::IncomingCall(_) = events.recv().await.unwrap();
        let done = fx.store.finish(session.id, CallStatus::Completed).unwrap();
        fx.hub
            .emit_insert("call_sessions", serde_json::to_value(&done).unwrap());

        // The stale row is skipped; the next fresh call is what rings.
        let fresh = ring(&fx);
        let NotifyEvent::IncomingCall(invite) = events.recv().await.unwrap();
        assert_eq!(invite.session_id, fresh.id);
    }
}
