//! Connection to the rtl_tcp server
//!
//! The socket is split into a read half used by the broadcast loop and a
//! write half used for command frames, so commands can go out while a read is
//! pending. Any I/O error closes the link for good; reconnecting means building
//! a new [`UpstreamLink`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::error::{ConnectError, Result, UpstreamError};
use crate::protocol::constants::{DEFAULT_READ_BUFFER_SIZE, HEADER_SIZE};
use crate::protocol::{CommandFrame, DongleInfo};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upstream connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Socket open, header not yet read
    Connecting,
    /// Header captured, samples flowing
    Streaming,
    /// Terminal
    Closed,
}

/// The single connection to the rtl_tcp server
pub struct UpstreamLink {
    peer: String,
    header: DongleInfo,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    state: watch::Sender<LinkState>,
    read_buffer_size: usize,
}

impl UpstreamLink {
    /// Connect over TCP and read the dongle header
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", host, port);

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectError::Unreachable { addr, source }.into());
            }
            Err(_) => return Err(ConnectError::Timeout { addr }.into()),
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }

        Self::from_stream(stream, addr).await
    }

    /// Wrap an already-connected transport and read the dongle header from it
    pub async fn from_stream<S>(stream: S, peer: impl Into<String>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (state, _) = watch::channel(LinkState::Connecting);
        let (mut reader, writer) = tokio::io::split(stream);

        let mut raw = [0u8; HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut raw).await {
            state.send_replace(LinkState::Closed);
            return Err(ConnectError::Header(e).into());
        }

        let header = DongleInfo::from_bytes(raw);
        if !header.has_valid_magic() {
            tracing::warn!(
                peer = %peer,
                magic = ?header.magic(),
                "Upstream header magic is not RTL0, relaying anyway"
            );
        }

        tracing::info!(
            peer = %peer,
            tuner = %header.tuner_type(),
            gains = header.gain_count(),
            "Upstream connected"
        );

        state.send_replace(LinkState::Streaming);

        Ok(Self {
            peer,
            header,
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            state,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        })
    }

    /// Set the maximum size of a single sample read
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Header captured at connect time
    pub fn header(&self) -> &DongleInfo {
        &self.header
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// Read the next chunk of sample data
    ///
    /// Returns whatever the transport delivers, up to the read buffer size.
    /// End of stream, a read error, or a concurrent [`close`](Self::close)
    /// all close the link.
    pub async fn read_chunk(&self) -> Result<Bytes> {
        if self.is_closed() {
            return Err(UpstreamError::Closed.into());
        }

        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.read_buffer_size);

        tokio::select! {
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    self.close();
                    Err(UpstreamError::Closed.into())
                }
                Ok(_) => Ok(buf.freeze()),
                Err(e) => {
                    self.close();
                    Err(UpstreamError::Read(e).into())
                }
            },
            _ = self.closed() => Err(UpstreamError::Closed.into()),
        }
    }

    /// Write one command frame
    ///
    /// Writers are serialized; reads may be in flight at the same time.
    pub async fn send_command(&self, frame: &CommandFrame) -> Result<()> {
        if self.is_closed() {
            return Err(UpstreamError::Closed.into());
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame.encode()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.close();
            return Err(UpstreamError::Write(e).into());
        }

        tracing::trace!(peer = %self.peer, command = %frame, "Command written upstream");
        Ok(())
    }

    /// Mark the link closed and wake any pending read
    pub fn close(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == LinkState::Closed {
                false
            } else {
                *state = LinkState::Closed;
                true
            }
        });

        if changed {
            tracing::debug!(peer = %self.peer, "Upstream link closed");
        }
    }

    /// Resolves once the link is closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == LinkState::Closed).await;
    }
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink")
            .field("peer", &self.peer)
            .field("header", &self.header)
            .field("state", &self.state())
            .finish()
    }
}
