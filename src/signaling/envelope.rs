//! Signaling envelope types.
//!
//! These mirror the JSON payloads the web client exchanges, so a Rust peer
//! and a browser peer can negotiate with each other unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast topic carrying the signaling traffic of one call session.
pub fn session_topic(session_id: Uuid) -> String {
    format!("webrtc-{session_id}")
}

/// One signaling message for a call session.
///
/// The protocol, not the transport, guarantees ordering: an offer precedes
/// the answer, and candidates trickle in any time after their leg's
/// description exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalEnvelope {
    /// SDP offer from the initiator.
    Offer {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        sdp: String,
    },

    /// SDP answer from the receiver.
    Answer {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        sdp: String,
    },

    /// One trickled ICE candidate, serialized candidate-init JSON.
    IceCandidate {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        candidate: String,
    },
}

impl SignalEnvelope {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. } => *session_id,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
