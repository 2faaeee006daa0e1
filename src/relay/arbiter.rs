//! Command arbitration
//!
//! The radio has one physical tuning state, shared by every client. The
//! arbiter records the last accepted value per setting and applies
//! last-writer-wins with idempotent suppression:
//!
//! ```text
//! submit(cmd from S)
//!   ├─ same (opcode, param) as recorded ──► drop, nothing written upstream
//!   └─ otherwise ─────────────────────────► write upstream, record (param, S, t)
//! ```
//!
//! Two clients retuning the same setting will fight; the device cannot give
//! each its own frequency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::{Command, ControlKey, Opcode};
use crate::session::SessionId;
use crate::stats::ArbiterStats;
use crate::upstream::UpstreamLink;

/// The value currently in force for one setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedCommand {
    pub param: u32,
    pub origin: SessionId,
    pub accepted_at: Instant,
}

/// What happened to a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterDecision {
    /// Written to the upstream link
    Forwarded,
    /// Identical to the value already in force
    Suppressed,
}

/// Serializes client commands onto the upstream link
pub struct CommandArbiter {
    link: Arc<UpstreamLink>,
    accepted: Mutex<BTreeMap<ControlKey, AcceptedCommand>>,
    forwarded: AtomicU64,
    suppressed: AtomicU64,
}

impl CommandArbiter {
    /// Create an arbiter with no recorded state for a fresh link
    pub fn new(link: Arc<UpstreamLink>) -> Self {
        Self {
            link,
            accepted: Mutex::new(BTreeMap::new()),
            forwarded: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Decide on a command and forward it if it changes device state
    ///
    /// The state lock is held across the upstream write, so the order of
    /// writes on the link always matches the order of recorded updates. A
    /// failed write is not retried: the link is already closed and the error
    /// is returned for the relay to tear down.
    pub async fn submit(&self, command: Command) -> Result<ArbiterDecision> {
        let key = command.frame.control_key();
        let mut accepted = self.accepted.lock().await;

        if let Some(current) = accepted.get(&key) {
            if current.param == command.param() {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = %command.origin,
                    command = %command.frame,
                    set_by = %current.origin,
                    "Command suppressed, value already in force"
                );
                return Ok(ArbiterDecision::Suppressed);
            }

            if current.origin != command.origin {
                tracing::info!(
                    session_id = %command.origin,
                    command = %command.frame,
                    previous = current.param,
                    previous_session = %current.origin,
                    "Overriding setting made by another session"
                );
            }
        }

        if let Err(e) = self.link.send_command(&command.frame).await {
            tracing::error!(
                session_id = %command.origin,
                command = %command.frame,
                error = %e,
                "Failed to forward command upstream"
            );
            return Err(e);
        }

        accepted.insert(
            key,
            AcceptedCommand {
                param: command.param(),
                origin: command.origin,
                accepted_at: command.received_at,
            },
        );
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            session_id = %command.origin,
            command = %command.frame,
            "Command forwarded"
        );

        Ok(ArbiterDecision::Forwarded)
    }

    /// Value in force for an opcode (for IF gain, the most recent stage)
    pub async fn current(&self, opcode: Opcode) -> Option<AcceptedCommand> {
        let accepted = self.accepted.lock().await;
        accepted
            .iter()
            .filter(|(key, _)| key.opcode == opcode)
            .map(|(_, value)| *value)
            .max_by_key(|value| value.accepted_at)
    }

    /// Every recorded setting
    pub async fn snapshot(&self) -> Vec<(ControlKey, AcceptedCommand)> {
        let accepted = self.accepted.lock().await;
        accepted.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn link(&self) -> &Arc<UpstreamLink> {
        &self.link
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}
