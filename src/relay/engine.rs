//! Broadcast loop
//!
//! Reads the upstream sample stream and appends every chunk to every open
//! session. Appending never waits: each session's bounded queue decides what
//! happens to a client that cannot keep up, so the upstream read pace is never
//! tied to the slowest client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::session::EnqueueOutcome;
use crate::stats::EngineStats;
use crate::upstream::UpstreamLink;

/// Fans the upstream stream out to the registered sessions
pub struct BroadcastEngine {
    link: Arc<UpstreamLink>,
    registry: Arc<SessionRegistry>,
    chunks_read: AtomicU64,
    bytes_read: AtomicU64,
    deliveries: AtomicU64,
    overflows: AtomicU64,
}

impl BroadcastEngine {
    pub fn new(link: Arc<UpstreamLink>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            link,
            registry,
            chunks_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Run until the upstream link fails
    ///
    /// Always returns an error: the loop only ends when the link does. Before
    /// returning, every registered session is closed so clients see the
    /// disconnect instead of a stalled stream.
    pub async fn run(&self) -> Result<()> {
        let error = loop {
            match self.link.read_chunk().await {
                Ok(chunk) => self.broadcast(chunk).await,
                Err(e) => break e,
            }
        };

        self.link.close();
        let closed = self.registry.close_all().await;

        tracing::error!(
            peer = %self.link.peer(),
            error = %error,
            sessions_closed = closed,
            chunks = self.chunks_read.load(Ordering::Relaxed),
            "Upstream lost, relay stopped"
        );

        Err(error)
    }

    /// Append one chunk to every open session
    async fn broadcast(&self, chunk: Bytes) {
        let len = chunk.len() as u64;

        for session in self.registry.snapshot().await {
            match session.enqueue(chunk.clone()) {
                EnqueueOutcome::Queued => {
                    self.deliveries.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::Overflow => {
                    self.overflows.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::Rejected => {}
            }
        }

        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(len, Ordering::Relaxed);
    }

    pub fn link(&self) -> &Arc<UpstreamLink> {
        &self.link
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::error::{Error, UpstreamError};
    use crate::protocol::constants::HEADER_SIZE;
    use crate::server::config::SlowClientPolicy;
    use crate::session::{ClientSession, SessionConfig, SessionId, SessionState};

    const HEADER: [u8; HEADER_SIZE] = [0x52, 0x54, 0x4C, 0x30, 0, 0, 0, 5, 0, 0, 0, 29];
    const CHUNK: usize = 16 * 1024;

    async fn engine() -> (Arc<BroadcastEngine>, Arc<SessionRegistry>, DuplexStream) {
        let (client, mut server) = duplex(1024 * 1024);
        server.write_all(&HEADER).await.unwrap();
        let link = UpstreamLink::from_stream(client, "mock")
            .await
            .unwrap()
            .with_read_buffer_size(CHUNK);
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(BroadcastEngine::new(Arc::new(link), registry.clone()));
        (engine, registry, server)
    }

    async fn add_session(
        registry: &SessionRegistry,
        engine: &BroadcastEngine,
        id: u64,
        max_queued_bytes: usize,
    ) -> Arc<ClientSession> {
        let config = SessionConfig {
            max_queued_bytes,
            slow_client_policy: SlowClientPolicy::Drop,
            drain_timeout: Duration::from_secs(1),
        };
        let session = Arc::new(ClientSession::new(
            SessionId(id),
            "127.0.0.1:6000".parse().unwrap(),
            config,
            engine.link().header(),
        ));
        registry.add(session.clone()).await;
        session
    }

    async fn wait_for_bytes(engine: &BroadcastEngine, bytes: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.stats().bytes_read < bytes {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn chunk(fill: u8) -> Vec<u8> {
        vec![fill; CHUNK]
    }

    fn concat(chunks: Vec<Bytes>) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    #[tokio::test]
    async fn test_every_session_gets_every_chunk_in_order() {
        let (engine, registry, mut upstream) = engine().await;
        let a = add_session(&registry, &engine, 1, 1024 * 1024).await;
        let b = add_session(&registry, &engine, 2, 1024 * 1024).await;

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        let mut expected = HEADER.to_vec();
        for fill in 1..=3u8 {
            upstream.write_all(&chunk(fill)).await.unwrap();
            expected.extend(chunk(fill));
        }
        wait_for_bytes(&engine, 3 * CHUNK as u64).await;

        assert_eq!(concat(a.drain_queue()), expected);
        assert_eq!(concat(b.drain_queue()), expected);

        drop(upstream);
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Upstream(_))));
    }

    #[tokio::test]
    async fn test_late_joiner_gets_header_and_new_chunks_only() {
        let (engine, registry, mut upstream) = engine().await;
        let early = add_session(&registry, &engine, 1, 1024 * 1024).await;

        let _task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        upstream.write_all(&chunk(1)).await.unwrap();
        upstream.write_all(&chunk(2)).await.unwrap();
        wait_for_bytes(&engine, 2 * CHUNK as u64).await;

        let late = add_session(&registry, &engine, 2, 1024 * 1024).await;
        upstream.write_all(&chunk(3)).await.unwrap();
        wait_for_bytes(&engine, 3 * CHUNK as u64).await;

        let mut expected_late = HEADER.to_vec();
        expected_late.extend(chunk(3));
        assert_eq!(concat(late.drain_queue()), expected_late);

        assert_eq!(
            early.stats().bytes_queued,
            3 * CHUNK as u64,
            "early session saw all three chunks"
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_closes_all_sessions() {
        let (engine, registry, mut upstream) = engine().await;
        let a = add_session(&registry, &engine, 1, 1024 * 1024).await;
        let b = add_session(&registry, &engine, 2, 1024 * 1024).await;

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        upstream.write_all(&chunk(1)).await.unwrap();
        upstream.write_all(&chunk(2)).await.unwrap();
        wait_for_bytes(&engine, 2 * CHUNK as u64).await;
        drop(upstream);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Upstream(UpstreamError::Closed))));

        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert!(engine.link().is_closed());
        assert_eq!(a.enqueue(Bytes::from_static(b"late")), EnqueueOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_affect_others() {
        let (engine, registry, mut upstream) = engine().await;
        // Room for the header and one chunk only
        let stalled = add_session(&registry, &engine, 1, HEADER_SIZE + CHUNK).await;
        let healthy = add_session(&registry, &engine, 2, 1024 * 1024).await;

        let _task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        for fill in 1..=4u8 {
            upstream.write_all(&chunk(fill)).await.unwrap();
        }
        wait_for_bytes(&engine, 4 * CHUNK as u64).await;

        assert_eq!(stalled.state(), SessionState::Closed);
        assert_eq!(healthy.state(), SessionState::Active);
        assert_eq!(healthy.stats().bytes_queued, 4 * CHUNK as u64);
        assert!(engine.stats().overflows >= 1);

        // Closed sessions drop out of the broadcast set
        let open: Vec<_> = registry.snapshot().await.iter().map(|s| s.id()).collect();
        assert_eq!(open, vec![SessionId(2)]);
    }
}
