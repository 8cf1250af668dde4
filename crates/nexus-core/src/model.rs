// Application configuration
// Typed accessors over the layered settings (file, environment, command line)

use nexus_common::DEFAULT_REPLICA_SET;

pub const DEFAULT_NODES: [&str; 3] = ["localhost:27017", "localhost:27018", "localhost:27019"];

/// Application configuration wrapper
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    // ===================== Server =====================

    pub fn server_address(&self) -> String {
        self.config
            .get_string("server.address")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.config.get_int("server.port").unwrap_or(3000) as u16
    }

    // ===================== Store =====================

    pub fn replica_set_name(&self) -> String {
        self.config
            .get_string("store.replica_set")
            .unwrap_or_else(|_| DEFAULT_REPLICA_SET.to_string())
    }

    /// Replica set members, comma separated in config
    pub fn store_nodes(&self) -> Vec<String> {
        let nodes: Vec<String> = self
            .config
            .get_string("store.nodes")
            .map(|s| {
                s.split(',')
                    .map(nexus_common::normalize_address)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if nodes.is_empty() {
            DEFAULT_NODES.iter().map(|s| s.to_string()).collect()
        } else {
            nodes
        }
    }

    /// Get connection pool size (default: 10)
    pub fn max_pool_size(&self) -> usize {
        self.get_u64("store.max_pool_size", 10) as usize
    }

    /// Get server selection timeout in milliseconds (default: 5000ms)
    pub fn server_selection_timeout_ms(&self) -> u64 {
        self.get_u64("store.server_selection_timeout_ms", 5000)
    }

    /// Get socket timeout in milliseconds (default: 45000ms)
    pub fn socket_timeout_ms(&self) -> u64 {
        self.get_u64("store.socket_timeout_ms", 45000)
    }

    /// Get write concern timeout in milliseconds (default: 10000ms)
    pub fn wtimeout_ms(&self) -> u64 {
        self.get_u64("store.wtimeout_ms", 10000)
    }

    pub fn read_max_retries(&self) -> u32 {
        self.get_u64("store.read_max_retries", 3) as u32
    }

    pub fn write_max_retries(&self) -> u32 {
        self.get_u64("store.write_max_retries", 2) as u32
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.get_u64("store.retry_delay_ms", 100)
    }

    pub fn breaker_failure_threshold(&self) -> u32 {
        self.get_u64("store.breaker.failure_threshold", 5) as u32
    }

    pub fn breaker_reset_timeout_ms(&self) -> u64 {
        self.get_u64("store.breaker.reset_timeout_ms", 5000)
    }

    // ===================== Topology =====================

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.get_u64("topology.heartbeat_interval_ms", 2000)
    }

    pub fn probe_timeout_ms(&self) -> u64 {
        self.get_u64("topology.probe_timeout_ms", 1000)
    }

    pub fn event_queue_size(&self) -> usize {
        self.get_u64("topology.event_queue_size", 256) as usize
    }

    // ===================== Ledger =====================

    pub fn cas_max_retries(&self) -> u32 {
        self.get_u64("ledger.cas_max_retries", 5) as u32
    }

    pub fn cas_backoff_base_ms(&self) -> u64 {
        self.get_u64("ledger.cas_backoff_base_ms", 10)
    }

    pub fn cas_backoff_max_ms(&self) -> u64 {
        self.get_u64("ledger.cas_backoff_max_ms", 200)
    }

    pub fn journal_capacity(&self) -> usize {
        self.get_u64("ledger.journal_capacity", 1024) as usize
    }

    // ===================== Audit =====================

    pub fn audit_enabled(&self) -> bool {
        self.config.get_bool("audit.enabled").unwrap_or(true)
    }

    pub fn audit_interval_ms(&self) -> u64 {
        self.get_u64("audit.interval_ms", 60000)
    }

    pub fn convergence_timeout_ms(&self) -> u64 {
        self.get_u64("audit.convergence_timeout_ms", 2000)
    }

    // ===================== Demo store =====================

    /// Background replication lag of the in-memory replica set
    pub fn replication_lag_ms(&self) -> u64 {
        self.get_u64("memory.replication_lag_ms", 50)
    }

    pub fn seed_on_startup(&self) -> bool {
        self.config.get_bool("bootstrap.seed").unwrap_or(true)
    }

    // ===================== Logging =====================

    pub fn log_dir(&self) -> String {
        self.config
            .get_string("logs.path")
            .unwrap_or_else(|_| "logs".to_string())
    }

    pub fn log_level(&self) -> String {
        self.config
            .get_string("logs.level")
            .unwrap_or_else(|_| "info".to_string())
    }

    pub fn log_console_enabled(&self) -> bool {
        self.config.get_bool("logs.console").unwrap_or(true)
    }

    pub fn log_file_enabled(&self) -> bool {
        self.config.get_bool("logs.file").unwrap_or(false)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::from_config(config::Config::default())
    }
}
