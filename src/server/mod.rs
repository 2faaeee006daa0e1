//! Relay server: configuration, accept loop and upstream lifecycle

pub mod config;
pub mod listener;

pub use config::{ReconnectPolicy, RelayConfig, SlowClientPolicy};
pub use listener::RelayServer;
