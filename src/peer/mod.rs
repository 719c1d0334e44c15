//! Peer connection management
//!
//! Owns the one WebRTC peer connection of a call attempt: ICE negotiation,
//! local track attachment, remote track arrival, and connection-state
//! tracking. A manager is never reused across sessions.

mod connection;

pub use connection::{default_ice_servers, PeerError, PeerEvent, PeerManager};
