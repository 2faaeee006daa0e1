//! Relay statistics

pub mod metrics;

pub use metrics::{ArbiterStats, EngineStats, RelayStats, SessionStats};
