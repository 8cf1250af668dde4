// Metrics module for observability
// Describes every metric the server and its crates record

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // HTTP request metrics
    describe_counter!(
        "http_requests_total",
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_counter!(
        "http_requests_errors_total",
        "Total number of HTTP request errors"
    );

    // Ledger metrics
    describe_counter!(
        "nexus_ledger_operations_total",
        "Ledger operations by outcome"
    );
    describe_histogram!(
        "nexus_ledger_apply_duration_seconds",
        "Duration of one deposit or withdrawal in seconds"
    );
    describe_counter!(
        "nexus_ledger_cas_conflicts_total",
        "Conditional balance updates that found the balance changed"
    );
    describe_counter!(
        "nexus_ledger_divergences_total",
        "Ledger entries written without the matching balance update"
    );

    // Storage metrics
    describe_counter!(
        "nexus_gateway_retries_total",
        "Gateway operations retried after a transient error"
    );
    describe_counter!(
        "nexus_gateway_errors_total",
        "Gateway operations that failed after retries"
    );
    describe_histogram!(
        "nexus_gateway_read_duration_seconds",
        "Gateway read duration in seconds"
    );
    describe_histogram!(
        "nexus_gateway_write_duration_seconds",
        "Gateway write duration in seconds, including write concern"
    );

    // Topology metrics
    describe_counter!(
        "nexus_topology_role_changes_total",
        "Role changes observed by the topology monitor"
    );
    describe_counter!(
        "nexus_topology_elections_total",
        "Primary elections observed by the topology monitor"
    );
    describe_gauge!(
        "nexus_topology_healthy_nodes",
        "Healthy replica set members"
    );
    describe_gauge!(
        "nexus_topology_primary_present",
        "1 when a primary is known, 0 otherwise"
    );

    // Audit metrics
    describe_counter!("nexus_audit_runs_total", "Completed integrity audits");
    describe_counter!(
        "nexus_audit_findings_total",
        "Findings reported by integrity audits"
    );
    describe_gauge!("nexus_audit_findings", "Findings of the latest audit");

    tracing::info!("Metrics initialized");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
    histogram!("http_request_duration_seconds", "method" => method.to_string(), "path" => path.to_string()).record(duration_secs);

    if status >= 400 {
        counter!("http_requests_errors_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
