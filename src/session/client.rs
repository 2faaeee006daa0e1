//! Downstream client session
//!
//! Each session owns a bounded FIFO of outbound chunks. The broadcast loop
//! appends to it without ever awaiting; a writer drains it to the socket at
//! whatever pace the client reads. A reader parses inbound command frames and
//! hands them to the [`CommandArbiter`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};

use super::state::{EnqueueOutcome, SessionId, SessionState};
use crate::error::{Error, Result, SessionError};
use crate::protocol::{Command, CommandDecoder, DongleInfo};
use crate::relay::CommandArbiter;
use crate::server::config::SlowClientPolicy;
use crate::stats::SessionStats;

/// Per-session backpressure settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum bytes waiting in the outbound queue
    pub max_queued_bytes: usize,

    /// What to do when the queue would overflow
    pub slow_client_policy: SlowClientPolicy,

    /// How long a draining session may take to flush before it is closed
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued_bytes: crate::protocol::constants::DEFAULT_MAX_QUEUED_BYTES,
            slow_client_policy: SlowClientPolicy::Drop,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct OutboundQueue {
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
}

impl OutboundQueue {
    fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.queued_bytes -= chunk.len();
        Some(chunk)
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.queued_bytes = 0;
    }
}

/// One downstream consumer
pub struct ClientSession {
    id: SessionId,
    peer_addr: SocketAddr,
    config: SessionConfig,
    queue: Mutex<OutboundQueue>,
    wakeup: Notify,
    state: watch::Sender<SessionState>,
    connected_at: Instant,
    bytes_queued: AtomicU64,
    bytes_sent: AtomicU64,
    chunks_rejected: AtomicU64,
    commands_received: AtomicU64,
}

impl ClientSession {
    /// Create a session with the dongle header already queued
    ///
    /// The header bypasses the capacity check so every client sees a valid
    /// header before any samples.
    pub fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        config: SessionConfig,
        header: &DongleInfo,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Active);
        let header = header.bytes();

        let mut queue = OutboundQueue::default();
        queue.queued_bytes = header.len();
        queue.chunks.push_back(header);

        Self {
            id,
            peer_addr,
            config,
            queue: Mutex::new(queue),
            wakeup: Notify::new(),
            state,
            connected_at: Instant::now(),
            bytes_queued: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            chunks_rejected: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Bytes currently waiting in the outbound queue
    pub fn queued_bytes(&self) -> usize {
        self.lock_queue().queued_bytes
    }

    /// Append a chunk without blocking
    ///
    /// If the chunk would push the queue past its capacity it is discarded and
    /// the slow-client policy fires: `Drop` closes the session at once,
    /// `Drain` stops accepting data and lets the writer flush what is queued.
    pub fn enqueue(&self, chunk: Bytes) -> EnqueueOutcome {
        let len = chunk.len();
        let mut queue = self.lock_queue();

        if self.state() != SessionState::Active {
            self.chunks_rejected.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Rejected;
        }

        let wanted = queue.queued_bytes + len;
        if wanted > self.config.max_queued_bytes {
            drop(queue);
            self.chunks_rejected.fetch_add(1, Ordering::Relaxed);
            self.on_overflow(SessionError::QueueOverflow {
                queued: wanted,
                capacity: self.config.max_queued_bytes,
            });
            return EnqueueOutcome::Overflow;
        }

        queue.queued_bytes = wanted;
        queue.chunks.push_back(chunk);
        drop(queue);

        self.bytes_queued.fetch_add(len as u64, Ordering::Relaxed);
        self.wakeup.notify_one();
        EnqueueOutcome::Queued
    }

    fn on_overflow(&self, error: SessionError) {
        match self.config.slow_client_policy {
            SlowClientPolicy::Drop => {
                tracing::warn!(
                    session_id = %self.id,
                    peer = %self.peer_addr,
                    error = %error,
                    "Slow client dropped"
                );
                self.close();
            }
            SlowClientPolicy::Drain => {
                tracing::warn!(
                    session_id = %self.id,
                    peer = %self.peer_addr,
                    error = %error,
                    "Slow client draining before close"
                );
                self.transition(SessionState::Draining);
                self.wakeup.notify_one();
            }
        }
    }

    /// Close the session, discarding anything still queued
    ///
    /// Wakes the reader and writer so both release the socket.
    pub fn close(&self) {
        if self.transition(SessionState::Closed) {
            self.lock_queue().clear();
            self.wakeup.notify_one();
            tracing::debug!(session_id = %self.id, peer = %self.peer_addr, "Session closed");
        }
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Drive the session until it closes
    ///
    /// Runs the writer and the command reader concurrently. Returns when the
    /// peer disconnects, a socket error occurs, the session is closed from
    /// outside, or a draining session finishes (or fails) its flush. The socket
    /// halves are dropped on return.
    pub async fn run<R, W>(&self, mut reader: R, mut writer: W, arbiter: &CommandArbiter) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = tokio::select! {
            r = self.write_loop(&mut writer) => r.map_err(Error::from),
            r = self.read_loop(&mut reader, arbiter) => r,
            _ = self.closed() => Ok(()),
            _ = self.drain_expired() => Err(SessionError::DrainTimeout.into()),
        };

        self.close();
        result
    }

    async fn write_loop<W>(&self, writer: &mut W) -> std::result::Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let next = self.lock_queue().pop();

            match next {
                Some(chunk) => {
                    writer.write_all(&chunk).await.map_err(SessionError::Io)?;
                    self.bytes_sent
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                None => match self.state() {
                    SessionState::Active => self.wakeup.notified().await,
                    SessionState::Draining => {
                        writer.flush().await.map_err(SessionError::Io)?;
                        tracing::debug!(session_id = %self.id, "Draining session flushed");
                        return Ok(());
                    }
                    SessionState::Closed => return Ok(()),
                },
            }
        }
    }

    async fn read_loop<R>(&self, reader: &mut R, arbiter: &CommandArbiter) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = CommandDecoder::new();

        loop {
            let n = reader
                .read_buf(decoder.buffer_mut())
                .await
                .map_err(SessionError::Io)?;

            if n == 0 {
                if let Err(e) = decoder.finish() {
                    tracing::warn!(session_id = %self.id, error = %e, "Client disconnected mid-frame");
                }
                return Ok(());
            }

            while let Some(frame) = decoder.next_frame() {
                match frame {
                    Ok(frame) => {
                        self.commands_received.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            session_id = %self.id,
                            command = %frame,
                            raw = ?frame.encode(),
                            "Command received"
                        );
                        arbiter.submit(Command::new(frame, self.id)).await?;
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %self.id,
                            peer = %self.peer_addr,
                            error = %e,
                            "Ignoring malformed command frame"
                        );
                    }
                }
            }
        }
    }

    /// Resolves once a draining session has used up its flush allowance
    async fn drain_expired(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state != SessionState::Active).await;
        tokio::time::sleep(self.config.drain_timeout).await;
    }

    /// Apply a forward-only state transition; returns whether it changed
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            let allowed = matches!(
                (*state, next),
                (SessionState::Active, SessionState::Draining)
                    | (SessionState::Active, SessionState::Closed)
                    | (SessionState::Draining, SessionState::Closed)
            );
            if allowed {
                *state = next;
            }
            allowed
        })
    }

    fn lock_queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_queued: self.bytes_queued.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            queued_bytes: self.queued_bytes(),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            duration: self.connected_at.elapsed(),
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_queue(&self) -> Vec<Bytes> {
        let mut queue = self.lock_queue();
        let mut chunks = Vec::with_capacity(queue.chunks.len());
        while let Some(chunk) = queue.pop() {
            chunks.push(chunk);
        }
        chunks
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
