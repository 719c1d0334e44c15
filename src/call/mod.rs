//! Call orchestration
//!
//! Ties the other pieces together: acquire media, open the signaling
//! channel, drive the offer/answer exchange, and tear everything down in
//! one place when the call ends.

mod orchestrator;

pub use orchestrator::{
    initiate_call, CallConfig, CallEvent, CallOrchestrator, CallPhase, CallRole, CONNECT_TIMEOUT,
};
