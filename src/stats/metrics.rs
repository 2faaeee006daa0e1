//! Statistics for the relay and its sessions

use std::time::Duration;

/// Session-level statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Sample bytes accepted into the queue (header excluded)
    pub bytes_queued: u64,
    /// Bytes written to the client socket
    pub bytes_sent: u64,
    /// Bytes currently waiting in the queue
    pub queued_bytes: usize,
    /// Chunks discarded by overflow or because the session was not Active
    pub chunks_rejected: u64,
    /// Valid command frames received from the client
    pub commands_received: u64,
    /// Connection duration
    pub duration: Duration,
}

impl SessionStats {
    /// Send rate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.bytes_sent * 8) / secs
        } else {
            0
        }
    }
}

/// Broadcast loop statistics
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Chunks read from upstream and fanned out
    pub chunks_read: u64,
    /// Bytes read from upstream and fanned out
    pub bytes_read: u64,
    /// Successful per-session enqueues
    pub deliveries: u64,
    /// Enqueues that tripped a session's overflow policy
    pub overflows: u64,
}

impl EngineStats {
    /// Average chunk size delivered by the transport
    pub fn average_chunk_size(&self) -> u64 {
        if self.chunks_read > 0 {
            self.bytes_read / self.chunks_read
        } else {
            0
        }
    }
}

/// Command arbitration statistics
#[derive(Debug, Clone, Default)]
pub struct ArbiterStats {
    /// Commands written upstream
    pub forwarded: u64,
    /// Commands dropped as already in force
    pub suppressed: u64,
}

impl ArbiterStats {
    pub fn total(&self) -> u64 {
        self.forwarded + self.suppressed
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Total client connections accepted
    pub total_connections: u64,
    /// Currently registered sessions
    pub active_sessions: u64,
    /// Upstream connections established
    pub upstream_connects: u64,
    /// Current upstream link, if any
    pub engine: Option<EngineStats>,
    pub arbiter: Option<ArbiterStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stats_bitrate() {
        let stats = SessionStats {
            bytes_sent: 1_000_000,
            duration: Duration::from_secs(10),
            ..Default::default()
        };

        // 1,000,000 bytes * 8 bits / 10 seconds
        assert_eq!(stats.bitrate(), 800_000);
    }

    #[test]
    fn test_session_stats_bitrate_zero_duration() {
        let stats = SessionStats {
            bytes_sent: 1_000_000,
            ..Default::default()
        };
        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_engine_average_chunk_size() {
        assert_eq!(EngineStats::default().average_chunk_size(), 0);

        let stats = EngineStats {
            chunks_read: 4,
            bytes_read: 65536,
            ..Default::default()
        };
        assert_eq!(stats.average_chunk_size(), 16384);
    }

    #[test]
    fn test_arbiter_total() {
        let stats = ArbiterStats {
            forwarded: 3,
            suppressed: 2,
        };
        assert_eq!(stats.total(), 5);
    }
}
