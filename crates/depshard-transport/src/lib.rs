//! Peer messaging for one shard's consensus group.
//!
//! `Transport` is the contract the consensus driver in `depshard-consensus`
//! is written against; `LocalTransport` is the in-process implementation
//! (tokio mpsc channels, one logical connection per peer, looked up lazily
//! through a `DashMap`). A deployment that needs real cross-process
//! networking swaps in another `Transport` impl without touching the
//! consensus driver.

mod error;
mod local;

pub use error::TransportError;
pub use local::{LocalNetwork, LocalTransport};

use async_trait::async_trait;
use depshard_core::ShardId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-message send timeout (spec §4.2).
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);
/// Peer dial timeout (spec §4.2) — kept for implementations with an actual
/// connection-establishment step; `LocalTransport` has none and never hits it.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Envelope wrapping a consensus message with sender/shard context, so a
/// multi-shard transport can demultiplex without peeking into the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub shard_id: ShardId,
    pub from: String,
    pub payload: Vec<u8>,
}

/// Delivers consensus messages between this replica and its peers for one
/// shard's replica group.
///
/// `send` is fire-and-forget: a transient failure marks the peer unhealthy
/// and returns, it never blocks the caller waiting on a retry. Consensus
/// retransmission, not the transport, is responsible for recovering a
/// dropped message.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to one peer, identified by its address string as it
    /// appears in `ShardConfig::replica_nodes`. Returns an error only to
    /// let the caller log it; the caller must not treat it as fatal.
    async fn send(&self, peer: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// True if the most recent send to `peer` succeeded (or no send has
    /// been attempted yet). Used by the health monitor's peer-reachability
    /// check.
    fn is_healthy(&self, peer: &str) -> bool;
}

/// Inbound hook invoked by whatever listens on the wire for a given
/// transport (a local dispatcher loop, a server task, ...). Forwards the
/// envelope to the replica state machine.
#[async_trait]
pub trait Inbound: Send + Sync {
    async fn step(&self, envelope: Envelope);
}
