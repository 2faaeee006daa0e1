//! rtl_tcp stream splitter
//!
//! Connects to a single `rtl_tcp` server and relays its sample stream to any
//! number of downstream clients, while forwarding their tuning commands back
//! upstream.
//!
//! # Architecture
//!
//! ```text
//!                  rtl_tcp server
//!                        │  ▲
//!          header+samples│  │command frames
//!                        ▼  │
//!                  ┌──────────────┐
//!                  │ UpstreamLink │
//!                  └──────────────┘
//!                     │        ▲
//!                     ▼        │
//!          ┌─────────────────┐ ┌────────────────┐
//!          │ BroadcastEngine │ │ CommandArbiter │
//!          └─────────────────┘ └────────────────┘
//!                     │ snapshot()     ▲
//!                     ▼                │ submit()
//!             ┌─────────────────┐      │
//!             │ SessionRegistry │      │
//!             └─────────────────┘      │
//!              │       │       │       │
//!              ▼       ▼       ▼       │
//!          [Session] [Session] [Session]
//!          queue→TCP queue→TCP queue→TCP
//! ```
//!
//! Every session owns a bounded byte queue drained by its own writer task, so
//! the broadcast loop never waits on a slow client.
//!
//! # Example
//!
//! ```no_run
//! use rtl_split::{RelayConfig, RelayServer};
//!
//! # async fn example() -> rtl_split::error::Result<()> {
//! let config = RelayConfig::default()
//!     .upstream("192.168.1.20", 1234)
//!     .listen_port(1235);
//!
//! let server = RelayServer::new(config);
//! server.run().await
//! # }
//! ```

pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod upstream;

pub use error::{Error, Result};
pub use protocol::{Command, CommandFrame, DongleInfo, Opcode, TunerType};
pub use registry::SessionRegistry;
pub use relay::{BroadcastEngine, CommandArbiter};
pub use server::{ReconnectPolicy, RelayConfig, RelayServer, SlowClientPolicy};
pub use session::{ClientSession, SessionId, SessionState};
pub use upstream::{LinkState, UpstreamLink};
