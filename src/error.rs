//! Error types
//!
//! Upstream failures ([`ConnectError`], [`UpstreamError`]) are fatal to the
//! whole relay. Everything else ([`SessionError`], [`ProtocolError`]) stays
//! local to the client session that produced it.

use std::fmt;
use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Listener or socket I/O outside of a session or the upstream link
    Io(io::Error),
    /// Could not establish the upstream connection
    Connect(ConnectError),
    /// The established upstream link failed
    Upstream(UpstreamError),
    /// A single client session failed
    Session(SessionError),
    /// A client sent bytes that do not form a valid command frame
    Protocol(ProtocolError),
}

impl Error {
    /// Whether this error takes down the whole relay rather than one session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::Upstream(_) | Error::Io(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Connect(e) => write!(f, "Upstream connect failed: {}", e),
            Error::Upstream(e) => write!(f, "Upstream link failed: {}", e),
            Error::Session(e) => write!(f, "Session error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Connect(e) => Some(e),
            Error::Upstream(e) => Some(e),
            Error::Session(e) => Some(e),
            Error::Protocol(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ConnectError> for Error {
    fn from(e: ConnectError) -> Self {
        Error::Connect(e)
    }
}

impl From<UpstreamError> for Error {
    fn from(e: UpstreamError) -> Self {
        Error::Upstream(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Session(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

/// Failure to reach the rtl_tcp server or read its header
#[derive(Debug)]
pub enum ConnectError {
    /// TCP connect failed
    Unreachable { addr: String, source: io::Error },
    /// TCP connect did not complete within the configured timeout
    Timeout { addr: String },
    /// Connection closed or failed before the 12-byte header was read
    Header(io::Error),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Unreachable { addr, source } => {
                write!(f, "{} unreachable: {}", addr, source)
            }
            ConnectError::Timeout { addr } => write!(f, "{} timed out", addr),
            ConnectError::Header(e) => write!(f, "failed to read dongle header: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Unreachable { source, .. } => Some(source),
            ConnectError::Timeout { .. } => None,
            ConnectError::Header(e) => Some(e),
        }
    }
}

/// Failure of an established upstream link
#[derive(Debug)]
pub enum UpstreamError {
    /// Reading sample data failed
    Read(io::Error),
    /// Writing a command frame failed
    Write(io::Error),
    /// The server closed the connection, or the link was closed locally
    Closed,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Read(e) => write!(f, "read failed: {}", e),
            UpstreamError::Write(e) => write!(f, "write failed: {}", e),
            UpstreamError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpstreamError::Read(e) | UpstreamError::Write(e) => Some(e),
            UpstreamError::Closed => None,
        }
    }
}

/// Failure local to one client session
#[derive(Debug)]
pub enum SessionError {
    /// Socket read or write failed
    Io(io::Error),
    /// The outbound queue would exceed its byte capacity
    QueueOverflow { queued: usize, capacity: usize },
    /// Best-effort flush of a draining session did not finish in time
    DrainTimeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "socket error: {}", e),
            SessionError::QueueOverflow { queued, capacity } => {
                write!(f, "queue overflow: {} bytes queued, capacity {}", queued, capacity)
            }
            SessionError::DrainTimeout => write!(f, "drain timed out"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Malformed command input from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame carried an opcode outside the rtl_tcp command set
    UnknownOpcode(u8),
    /// Client disconnected in the middle of a frame
    TruncatedFrame { remaining: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownOpcode(op) => write!(f, "unknown opcode 0x{:02x}", op),
            ProtocolError::TruncatedFrame { remaining } => {
                write!(f, "truncated command frame ({} trailing bytes)", remaining)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
