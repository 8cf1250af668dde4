//! Nexus Persistence - storage gateway and replica set backends
//!
//! This crate provides:
//! - `StorageGateway`, the only component issuing raw reads and writes
//! - `ConnectionPool` and per-node circuit breakers used by the gateway
//! - `MemoryReplicaSet`, an in-process replica set implementing the store contract

pub mod circuit_breaker;
pub mod gateway;
pub mod memory;
pub mod model;
pub mod pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, NodeBreakers};
pub use gateway::{GatewayConfig, Session, StorageGateway};
pub use memory::{FaultTarget, MemoryReplicaSet, MemoryReplicaSetConfig};
pub use model::{Idempotency, Mutation, Query, ReadConsistency, WriteAck, WriteDurability};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
