// HTTP surface of the Banco Nexus replicated ledger
// Wires configuration, logging, the storage gateway and the ledger into an actix-web server

pub mod api; // HTTP endpoints
pub mod metrics; // Metric descriptions and helpers
pub mod middleware; // HTTP middleware
pub mod model; // Configuration, response wrapper and application state
pub mod startup; // Logging, bootstrap, server and shutdown
