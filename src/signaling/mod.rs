//! Call signaling
//!
//! Relays the three negotiation envelopes (offer, answer, ICE candidate)
//! between the two peers of a call session over the realtime broadcast
//! interface. Best-effort: no delivery acks, no retransmission; a failed
//! negotiation is recovered by the user re-starting the call.

mod channel;
mod envelope;

pub use channel::{ChannelError, SignalEvent, SignalingChannel};
pub use envelope::{session_topic, SignalEnvelope};
