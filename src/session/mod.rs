//! Downstream client sessions

pub mod client;
pub mod state;

pub use client::{ClientSession, SessionConfig};
pub use state::{EnqueueOutcome, SessionId, SessionState};
