//! Call-level error taxonomy
//!
//! Everything an orchestrated call can fail with, folded into one enum so
//! callers can show the right message: device trouble, permission trouble,
//! signaling trouble, or a negotiation that went wrong.

use thiserror::Error;

use crate::media::MediaError;
use crate::peer::PeerError;
use crate::signaling::ChannelError;

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Call negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Connection to the remote peer was lost")]
    ConnectionLost,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => CallError::PermissionDenied(msg),
            other => CallError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<ChannelError> for CallError {
    fn from(err: ChannelError) -> Self {
        CallError::SignalingUnavailable(err.to_string())
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        CallError::NegotiationFailed(err.to_string())
    }
}
