//! MentorLink Call - peer-to-peer call core
//!
//! The call subsystem of a mentorship platform:
//! - WebRTC for the peer-to-peer audio/video connection
//! - realtime broadcast topics for offer/answer/candidate signaling
//! - cpal for microphone capture
//! - SQLite for the call session records
//!
//! A call runs through a [`CallOrchestrator`] on each side; the callee
//! learns about it through an [`IncomingCallNotifier`] watching the
//! `call_sessions` insert feed.

pub mod call;
pub mod error;
pub mod media;
pub mod notify;
pub mod peer;
pub mod realtime;
pub mod signaling;
pub mod store;

pub use call::{
    initiate_call, CallConfig, CallEvent, CallOrchestrator, CallPhase, CallRole, CONNECT_TIMEOUT,
};
pub use error::CallError;
pub use media::{MediaAcquirer, MediaBackend, MediaError};
pub use notify::{CallInvite, IncomingCallNotifier, NotifyError, NotifyEvent};
pub use peer::{default_ice_servers, PeerError, PeerEvent, PeerManager};
pub use realtime::{MemoryHub, MemoryRealtime, Realtime, RealtimeError, SocketRealtime};
pub use signaling::{ChannelError, SignalEnvelope, SignalEvent, SignalingChannel};
pub use store::{
    CallKind, CallSession, CallStatus, CallStore, NewCallSession, StoreError,
};
