//! End-to-end flow over the public API: a recorded call rings the callee,
//! who either accepts (getting a receiver config) or rejects (failing the
//! session without touching any device).

use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

use mentorlink_call::{
    initiate_call, CallKind, CallRole, CallStatus, CallStore, IncomingCallNotifier, MemoryHub,
    NotifyEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct World {
    hub: Arc<MemoryHub>,
    store: Arc<CallStore>,
    mentor_user: Uuid,
    mentee_user: Uuid,
    booking: Uuid,
}

fn world() -> Result<World> {
    init_tracing();

    let store = Arc::new(CallStore::open_in_memory()?);
    let mentor_user = Uuid::new_v4();
    let mentee_user = Uuid::new_v4();
    let mentor_profile = Uuid::new_v4();
    let booking = Uuid::new_v4();

    store.add_mentor(mentor_profile, mentor_user, "Dr. Ada Lovelace")?;
    store.add_user(mentee_user, "Grace", "Hopper")?;
    store.add_booking(booking, mentor_profile, mentee_user)?;

    Ok(World {
        hub: MemoryHub::new(),
        store,
        mentor_user,
        mentee_user,
        booking,
    })
}

#[tokio::test]
async fn accepted_call_hands_over_a_receiver_config() -> Result<()> {
    let w = world()?;

    let notifier = IncomingCallNotifier::start(
        Arc::new(w.hub.client()),
        Arc::clone(&w.store),
        w.mentee_user,
    )?;
    let mut events = notifier.subscribe();

    // The mentor places a video call; the insert feed carries the row.
    let (session, caller_config) = initiate_call(
        &w.store,
        w.booking,
        w.mentor_user,
        w.mentee_user,
        CallKind::Video,
    )?;
    assert_eq!(caller_config.role, CallRole::Initiator);
    w.hub
        .emit_insert("call_sessions", serde_json::to_value(&session)?);

    let NotifyEvent::IncomingCall(invite) = events.recv().await?;
    assert_eq!(invite.caller_name, "Dr. Ada Lovelace");
    assert_eq!(invite.call_type, CallKind::Video);

    let callee_config = notifier.accept(&invite);
    assert_eq!(callee_config.session_id, session.id);
    assert_eq!(callee_config.role, CallRole::Receiver);
    assert!(callee_config.want_audio && callee_config.want_video);

    // Both sides negotiate the same signaling topic.
    assert_eq!(caller_config.session_id, callee_config.session_id);
    Ok(())
}

#[tokio::test]
async fn rejected_call_fails_without_ever_connecting() -> Result<()> {
    let w = world()?;

    let notifier = IncomingCallNotifier::start(
        Arc::new(w.hub.client()),
        Arc::clone(&w.store),
        w.mentee_user,
    )?;
    let mut events = notifier.subscribe();

    let (session, _) = initiate_call(
        &w.store,
        w.booking,
        w.mentor_user,
        w.mentee_user,
        CallKind::Audio,
    )?;
    w.hub
        .emit_insert("call_sessions", serde_json::to_value(&session)?);

    let NotifyEvent::IncomingCall(invite) = events.recv().await?;
    notifier.reject(invite.session_id);

    let recorded = w.store.get_session(session.id)?;
    assert_eq!(recorded.status, CallStatus::Failed);
    assert!(recorded.started_at.is_none());
    assert!(recorded.duration_seconds.is_none());

    // The booking is free again for the next attempt.
    assert!(w
        .store
        .active_session_for_booking(w.booking)?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn a_booking_carries_one_call_at_a_time() -> Result<()> {
    let w = world()?;

    let (session, _) = initiate_call(
        &w.store,
        w.booking,
        w.mentor_user,
        w.mentee_user,
        CallKind::Audio,
    )?;

    let second = initiate_call(
        &w.store,
        w.booking,
        w.mentee_user,
        w.mentor_user,
        CallKind::Audio,
    );
    assert!(second.is_err());

    w.store.finish(session.id, CallStatus::Failed)?;
    assert!(initiate_call(
        &w.store,
        w.booking,
        w.mentee_user,
        w.mentor_user,
        CallKind::Audio,
    )
    .is_ok());
    Ok(())
}
