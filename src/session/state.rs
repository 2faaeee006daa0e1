//! Session identity and lifecycle state

/// Opaque per-connection identity
///
/// Allocated from a monotonically increasing counter, so ordering by id is
/// ordering by accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle
///
/// ```text
/// Active ──overflow (drain)──► Draining ──queue empty──► Closed
///    │                                                     ▲
///    └──────── overflow (drop), I/O error, EOF ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting data
    Active,
    /// Rejecting new data, flushing what is already queued
    Draining,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether the session may still appear in a registry snapshot
    pub fn is_open(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

/// Result of offering a chunk to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Chunk appended to the queue
    Queued,
    /// Chunk would have exceeded capacity; session moved to Draining or Closed
    Overflow,
    /// Session is no longer Active; chunk discarded
    Rejected,
}
