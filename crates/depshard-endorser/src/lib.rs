//! Endorser-side coordinator: groups a transaction's footprint by
//! namespace, fans it out to the shards it touches, and aggregates their
//! signed proofs into one dependency verdict.

pub mod coordinator;
pub mod error;
pub mod namespace;

pub use coordinator::{EndorserCoordinator, EndorsementResult, SimulationResult, DEFAULT_PREPARE_TIMEOUT};
pub use error::EndorseError;
