//! Application state shared across handlers

use nexus_core::Configuration;
use nexus_ledger::{AuditScheduler, IntegrityVerifier, LedgerProcessor};
use nexus_persistence::{MemoryReplicaSet, StorageGateway};

/// Process-wide components, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub configuration: Configuration,
    pub gateway: StorageGateway,
    pub processor: LedgerProcessor,
    pub verifier: IntegrityVerifier,
    pub scheduler: AuditScheduler,
    /// Present when the server runs against the in-memory replica set;
    /// failover drills need it
    pub replica_set: Option<MemoryReplicaSet>,
}

impl AppState {
    pub fn new(
        configuration: Configuration,
        gateway: StorageGateway,
        processor: LedgerProcessor,
        scheduler: AuditScheduler,
        replica_set: Option<MemoryReplicaSet>,
    ) -> Self {
        Self {
            configuration,
            verifier: IntegrityVerifier::new(gateway.clone()),
            gateway,
            processor,
            scheduler,
            replica_set,
        }
    }

    pub fn convergence_timeout(&self) -> std::time::Duration {
        self.scheduler.config().convergence_timeout
    }

    /// Stop background work and close the pool
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.gateway.shutdown();
        if let Some(replica_set) = &self.replica_set {
            replica_set.stop_replication();
        }
    }
}
