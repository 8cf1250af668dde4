//! Data models module
//!
//! - `config` - Command line and layered configuration loading
//! - `response` - HTTP response wrapper
//! - `app_state` - Application state shared across handlers

pub mod app_state;
pub mod config;
pub mod response;

pub use app_state::AppState;
pub use config::{Cli, load_configuration};
pub use response::Result;
