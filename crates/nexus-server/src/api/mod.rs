//! HTTP endpoints
//!
//! - `health` - replica set health for probes
//! - `ledger` - deposits and withdrawals
//! - `audit` - integrity checks, divergence journal and balance correction
//! - `admin` - topology, failover drills and the stress run

pub mod admin;
pub mod audit;
pub mod health;
pub mod ledger;
pub mod route;
