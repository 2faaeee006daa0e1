//! Relay configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::constants::*;
use crate::session::SessionConfig;

/// What to do with a client whose queue would overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowClientPolicy {
    /// Close the session immediately, discarding queued bytes
    #[default]
    Drop,
    /// Stop queueing, flush what is already queued, then close
    Drain,
}

/// How to react when the upstream link is lost or cannot be established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up (0 = never reconnect)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for the doubling backoff
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Fail on the first upstream error
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Retry up to `max_attempts` times with exponential backoff
    pub fn retry(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }

    /// Set the initial backoff
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the backoff cap
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Relay configuration options
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// rtl_tcp server host
    pub upstream_host: String,

    /// rtl_tcp server port
    pub upstream_port: u16,

    /// Address to accept clients on
    pub listen_addr: SocketAddr,

    /// Maximum bytes queued per client before the slow-client policy fires
    pub max_queued_bytes: usize,

    /// What to do with clients that fall behind
    pub slow_client_policy: SlowClientPolicy,

    /// How long a draining client may take to flush
    pub drain_timeout: Duration,

    /// Maximum size of a single upstream read
    pub read_buffer_size: usize,

    /// Upstream connect timeout
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY on client sockets
    pub tcp_nodelay: bool,

    /// Maximum concurrent clients (0 = unlimited)
    pub max_connections: usize,

    /// Upstream reconnect behaviour
    pub reconnect: ReconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_host: "localhost".to_string(),
            upstream_port: DEFAULT_PORT,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            slow_client_policy: SlowClientPolicy::Drop,
            drain_timeout: Duration::from_secs(5),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            max_connections: 0, // Unlimited
            reconnect: ReconnectPolicy::disabled(),
        }
    }
}

impl RelayConfig {
    /// Set the rtl_tcp server to relay from
    pub fn upstream(mut self, host: impl Into<String>, port: u16) -> Self {
        self.upstream_host = host.into();
        self.upstream_port = port;
        self
    }

    /// Set the listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Listen on all interfaces at `port`
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    /// Set per-client queue capacity
    pub fn max_queued_bytes(mut self, bytes: usize) -> Self {
        self.max_queued_bytes = bytes;
        self
    }

    /// Set the slow-client policy
    pub fn slow_client_policy(mut self, policy: SlowClientPolicy) -> Self {
        self.slow_client_policy = policy;
        self
    }

    /// Set the drain timeout
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the upstream read size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the upstream connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// `host:port` of the upstream server
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    /// Settings handed to each new client session
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_queued_bytes: self.max_queued_bytes,
            slow_client_policy: self.slow_client_policy,
            drain_timeout: self.drain_timeout,
        }
    }
}
