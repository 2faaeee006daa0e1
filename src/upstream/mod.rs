//! Upstream rtl_tcp connection

pub mod link;

pub use link::{LinkState, UpstreamLink};
