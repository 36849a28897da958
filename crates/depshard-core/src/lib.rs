//! Data model, wire codec, and deterministic MAC for the sharded
//! dependency-tracking service. Everything in this crate is a plain,
//! inert type or pure function; the stateful pieces (replica, manager,
//! endorser fan-out) live in the crates built on top of it.

pub mod codec;
pub mod error;
pub mod ids;
pub mod mac;
pub mod model;

pub use error::CoreError;
pub use ids::{CommitIndex, ReplicaId, ShardId, Term, TxId};
pub use mac::MacKey;
pub use model::{
    AbortEntry, Batch, DependencyMapEntry, Footprint, LogEntry, PrepareProof, PrepareRequest,
    ShardConfig,
};
