//! Relay server
//!
//! Owns the client listener and drives one upstream link at a time: connect,
//! run the broadcast engine and the accept loop side by side, and when the link
//! dies close every client and either reconnect or give up.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::relay::{BroadcastEngine, CommandArbiter};
use crate::server::config::RelayConfig;
use crate::session::{ClientSession, SessionId};
use crate::stats::RelayStats;
use crate::upstream::UpstreamLink;

/// Engine and arbiter bound to the current upstream link
struct ActiveRelay {
    engine: Arc<BroadcastEngine>,
    arbiter: Arc<CommandArbiter>,
}

/// rtl_tcp relay server
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    total_connections: AtomicU64,
    upstream_connects: AtomicU64,
    active: Mutex<Option<ActiveRelay>>,
}

impl RelayServer {
    /// Create a new server with the given configuration
    pub fn new(config: RelayConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            total_connections: AtomicU64::new(0),
            upstream_connects: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run the server
    ///
    /// Returns only when the upstream is lost and the reconnect policy gives up.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Serve on an already-bound listener with graceful shutdown
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        };

        self.shutdown().await;
        result
    }

    /// Serve on an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            upstream = %self.config.upstream_addr(),
            "rtl_tcp relay listening"
        );

        let policy = &self.config.reconnect;
        let mut attempt = 0u32;

        loop {
            let result = match self.connect_upstream().await {
                Ok(link) => {
                    attempt = 0;
                    self.relay(&listener, Arc::new(link)).await
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            attempt += 1;
            if attempt > policy.max_attempts {
                tracing::error!(error = %error, "Upstream unavailable, giving up");
                return Err(error);
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                error = %error,
                attempt = attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Upstream unavailable, reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_upstream(&self) -> Result<UpstreamLink> {
        let link = UpstreamLink::connect(
            &self.config.upstream_host,
            self.config.upstream_port,
            self.config.connect_timeout,
        )
        .await?
        .with_read_buffer_size(self.config.read_buffer_size);

        self.upstream_connects.fetch_add(1, Ordering::Relaxed);
        Ok(link)
    }

    /// Relay one upstream link until it fails
    async fn relay(&self, listener: &TcpListener, link: Arc<UpstreamLink>) -> Result<()> {
        let engine = Arc::new(BroadcastEngine::new(link.clone(), self.registry.clone()));
        // Fresh link, fresh device: no recorded settings carry over
        let arbiter = Arc::new(CommandArbiter::new(link.clone()));

        *self.lock_active() = Some(ActiveRelay {
            engine: engine.clone(),
            arbiter: arbiter.clone(),
        });

        let result = tokio::select! {
            result = engine.run() => result,
            result = self.accept_loop(listener, &link, &arbiter) => result,
        };

        self.lock_active().take();
        link.close();
        self.registry.close_all().await;

        result
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        link: &Arc<UpstreamLink>,
        arbiter: &Arc<CommandArbiter>,
    ) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr, link, arbiter).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        link: &Arc<UpstreamLink>,
        arbiter: &Arc<CommandArbiter>,
    ) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(session_id = %session_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        // Header goes into the queue before the session becomes visible to
        // the broadcast loop, so it always precedes the first sample chunk
        let session = Arc::new(ClientSession::new(
            session_id,
            peer_addr,
            self.config.session_config(),
            link.header(),
        ));
        self.registry.add(session.clone()).await;

        let registry = Arc::clone(&self.registry);
        let arbiter = Arc::clone(arbiter);

        tokio::spawn(async move {
            let _permit = permit;
            let (reader, writer) = socket.into_split();

            match session.run(reader, writer, &arbiter).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::debug!(session_id = %session_id, error = %e, "Session ended by upstream failure");
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Session error");
                }
            }

            registry.remove(session_id).await;

            let stats = session.stats();
            tracing::debug!(
                session_id = %session_id,
                bytes_sent = stats.bytes_sent,
                commands = stats.commands_received,
                duration_secs = stats.duration.as_secs(),
                "Connection closed"
            );
        });
    }

    /// Close the current upstream link and every client
    pub async fn shutdown(&self) {
        let active = self.lock_active().take();
        if let Some(active) = active {
            active.engine.link().close();
        }
        self.registry.close_all().await;
    }

    pub async fn stats(&self) -> RelayStats {
        let (engine, arbiter) = match self.lock_active().as_ref() {
            Some(active) => (Some(active.engine.stats()), Some(active.arbiter.stats())),
            None => (None, None),
        };

        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.registry.len().await as u64,
            upstream_connects: self.upstream_connects.load(Ordering::Relaxed),
            engine,
            arbiter,
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRelay>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::error::{Error, UpstreamError};
    use crate::protocol::constants::HEADER_SIZE;
    use crate::protocol::{CommandFrame, Opcode};
    use crate::server::config::ReconnectPolicy;

    const HEADER: [u8; HEADER_SIZE] = [0x52, 0x54, 0x4C, 0x30, 0, 0, 0, 5, 0, 0, 0, 29];
    const CHUNK: usize = 16 * 1024;
    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        upstream: TcpListener,
        relay_addr: SocketAddr,
        server: Arc<RelayServer>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(config: RelayConfig) -> Harness {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        let config = config
            .upstream("127.0.0.1", upstream_port)
            .read_buffer_size(CHUNK);
        let server = Arc::new(RelayServer::new(config));

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        Harness {
            upstream,
            relay_addr,
            server,
            task,
        }
    }

    async fn accept_upstream(harness: &Harness, header: &[u8]) -> TcpStream {
        let (mut socket, _) = tokio::time::timeout(TIMEOUT, harness.upstream.accept())
            .await
            .unwrap()
            .unwrap();
        socket.write_all(header).await.unwrap();
        socket
    }

    /// Connect a client and wait for its header, which means it is registered
    async fn connect_client(harness: &Harness) -> (TcpStream, Vec<u8>) {
        let mut client = TcpStream::connect(harness.relay_addr).await.unwrap();
        let header = read_n(&mut client, HEADER_SIZE).await;
        (client, header)
    }

    async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    async fn expect_eof(stream: &mut TcpStream) {
        let mut rest = Vec::new();
        let n = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "no further data expected");
    }

    fn chunk(fill: u8) -> Vec<u8> {
        (0..CHUNK).map(|i| fill.wrapping_add(i as u8)).collect()
    }

    #[tokio::test]
    async fn test_late_joiner_scenario() {
        let harness = start(RelayConfig::default()).await;
        let mut upstream = accept_upstream(&harness, &HEADER).await;

        let (mut c1, h1) = connect_client(&harness).await;
        let (mut c2, h2) = connect_client(&harness).await;
        assert_eq!(h1, HEADER);
        assert_eq!(h2, HEADER);

        upstream.write_all(&chunk(1)).await.unwrap();
        upstream.write_all(&chunk(2)).await.unwrap();

        let mut expected = chunk(1);
        expected.extend(chunk(2));
        assert_eq!(read_n(&mut c1, 2 * CHUNK).await, expected);
        assert_eq!(read_n(&mut c2, 2 * CHUNK).await, expected);

        let (mut c3, h3) = connect_client(&harness).await;
        assert_eq!(h3, HEADER);

        upstream.write_all(&chunk(3)).await.unwrap();
        assert_eq!(read_n(&mut c1, CHUNK).await, chunk(3));
        assert_eq!(read_n(&mut c2, CHUNK).await, chunk(3));
        assert_eq!(read_n(&mut c3, CHUNK).await, chunk(3));

        // Upstream goes away: everyone is disconnected, nothing more arrives
        drop(upstream);
        expect_eof(&mut c1).await;
        expect_eof(&mut c2).await;
        expect_eof(&mut c3).await;

        let result = tokio::time::timeout(TIMEOUT, harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Upstream(UpstreamError::Closed))));
    }

    #[tokio::test]
    async fn test_commands_arbitrated_upstream() {
        let harness = start(RelayConfig::default()).await;
        let mut upstream = accept_upstream(&harness, &HEADER).await;

        let (mut c1, _) = connect_client(&harness).await;
        let (mut c2, _) = connect_client(&harness).await;

        let tune_100 = CommandFrame::new(Opcode::SetFrequency, 100_000_000).encode();
        let tune_200 = CommandFrame::new(Opcode::SetFrequency, 200_000_000).encode();

        c1.write_all(&tune_100).await.unwrap();
        let mut frame = [0u8; 5];
        tokio::time::timeout(TIMEOUT, upstream.read_exact(&mut frame))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, tune_100);

        // Duplicate is swallowed, so the next frame upstream is the retune
        c2.write_all(&tune_100).await.unwrap();
        c2.write_all(&tune_200).await.unwrap();
        tokio::time::timeout(TIMEOUT, upstream.read_exact(&mut frame))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, tune_200);

        // The counter is bumped right after the write lands upstream
        let stats = tokio::time::timeout(TIMEOUT, async {
            loop {
                let stats = harness.server.stats().await;
                if stats.arbiter.as_ref().map_or(0, |a| a.forwarded) == 2 {
                    break stats;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stats.arbiter.unwrap().suppressed, 1);
        assert_eq!(stats.active_sessions, 2);
    }

    #[tokio::test]
    async fn test_reconnect_distributes_fresh_header() {
        let policy = ReconnectPolicy::retry(3).initial_backoff(Duration::from_millis(10));
        let harness = start(RelayConfig::default().reconnect(policy)).await;

        let first = accept_upstream(&harness, &HEADER).await;
        let (mut c1, _) = connect_client(&harness).await;

        drop(first);
        expect_eof(&mut c1).await;

        let mut second_header = HEADER;
        second_header[7] = 1; // E4000
        let mut second = accept_upstream(&harness, &second_header).await;

        let (mut c2, h2) = connect_client(&harness).await;
        assert_eq!(h2, second_header);

        second.write_all(&chunk(9)).await.unwrap();
        assert_eq!(read_n(&mut c2, CHUNK).await, chunk(9));
        assert_eq!(harness.server.stats().await.upstream_connects, 2);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_without_reconnect() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();
        drop(upstream);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RelayServer::new(RelayConfig::default().upstream("127.0.0.1", port));

        let result = tokio::time::timeout(TIMEOUT, server.serve(listener))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Connect(_))));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let harness = start(RelayConfig::default().max_connections(1)).await;
        let _upstream = accept_upstream(&harness, &HEADER).await;

        let (_c1, _) = connect_client(&harness).await;

        let mut c2 = TcpStream::connect(harness.relay_addr).await.unwrap();
        expect_eof(&mut c2).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_upstream() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        let server = Arc::new(RelayServer::new(
            RelayConfig::default().upstream("127.0.0.1", upstream_port),
        ));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .serve_until(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let (mut upstream, _) = tokio::time::timeout(TIMEOUT, upstream_listener.accept())
            .await
            .unwrap()
            .unwrap();
        upstream.write_all(&HEADER).await.unwrap();

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        assert_eq!(read_n(&mut client, HEADER_SIZE).await, HEADER);

        stop_tx.send(()).unwrap();
        let result = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
        assert!(result.is_ok());

        expect_eof(&mut client).await;
        assert!(server.stats().await.engine.is_none());
    }
}
