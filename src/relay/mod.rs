//! Data plane and control plane of the relay
//!
//! - [`BroadcastEngine`]: upstream samples → every session queue
//! - [`CommandArbiter`]: session commands → upstream, last-writer-wins

pub mod arbiter;
pub mod engine;

pub use arbiter::{AcceptedCommand, ArbiterDecision, CommandArbiter};
pub use engine::BroadcastEngine;
