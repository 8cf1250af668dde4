//! Nexus Common - Shared types, store contract, and utilities
//!
//! This crate provides the foundational types used across all Nexus components:
//! - Error types and error codes
//! - Persisted record shapes (customers, accounts, ledger entries)
//! - The raw replicated-store contract
//! - Utility functions

pub mod error;
pub mod model;
pub mod store;
pub mod traits;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, NexusError, StoreError};
pub use store::{
    Document, Filter, InsertOutcome, NodeHello, NodeRole, Update, UpdateOutcome, WriteConcern,
};
pub use traits::{ReplicaNode, ReplicaNodeRef};
pub use utils::{backoff_delay, normalize_address};

/// Default replica set name
pub const DEFAULT_REPLICA_SET: &str = "rsBanco";
