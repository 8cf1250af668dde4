//! Server startup: logging, component bootstrap, HTTP server and shutdown

pub mod http;
pub mod logging;
pub mod shutdown;
pub mod state;

pub use http::main_server;
pub use logging::{LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal};
pub use state::build_app_state;
