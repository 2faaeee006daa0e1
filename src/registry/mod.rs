//! Session registry for fan-out routing
//!
//! The registry holds every live client session. The broadcast engine takes a
//! snapshot per upstream chunk and appends the chunk to each session's queue.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<SessionRegistry>
//!                 ┌─────────────────────────────┐
//!                 │ sessions: BTreeMap<Id,      │
//!                 │   Arc<ClientSession> {      │
//!                 │     queue: VecDeque<Bytes>, │
//!                 │     state,                  │
//!                 │   }                         │
//!                 │ >                           │
//!                 └──────────────┬──────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//!   [Accept loop]        [BroadcastEngine]        [Session task]
//!   add(session)         snapshot()               remove(id)
//!                        └─► enqueue(chunk) ──► writer ──► TCP
//! ```
//!
//! # Zero-Copy Design
//!
//! `bytes::Bytes` uses reference counting, so all sessions share the same
//! allocation for a chunk. Only the handle is cloned per session.

pub mod store;

pub use store::SessionRegistry;
