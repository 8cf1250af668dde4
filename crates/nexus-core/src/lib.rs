//! Nexus Core - configuration and topology
//!
//! This crate provides:
//! - `Configuration`, the typed view over layered application settings
//! - `TopologyMonitor`, which tracks primary/secondary roles of the replica set
//! - Role change events and listeners

pub mod model;
pub mod service;

pub use model::Configuration;
pub use service::topology::{
    HealthReport, HealthStatus, NodeHealth, NodeView, PingStatus, TopologyConfig, TopologyMonitor,
    TopologySnapshot,
};
pub use service::topology_event::{
    FnRoleChangeListener, LoggingRoleChangeListener, RoleChangeEvent, RoleChangeListener,
    RoleChangeType,
};
