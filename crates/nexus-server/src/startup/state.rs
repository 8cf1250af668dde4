//! Component bootstrap: replica set, topology monitor, gateway and ledger

use std::sync::Arc;

use nexus_core::{Configuration, LoggingRoleChangeListener, TopologyConfig, TopologyMonitor};
use nexus_ledger::{
    AuditConfig, AuditScheduler, IntegrityVerifier, LedgerConfig, LedgerProcessor,
    seed_sample_data,
};
use nexus_persistence::{
    GatewayConfig, MemoryReplicaSet, MemoryReplicaSetConfig, StorageGateway,
};
use tracing::{info, warn};

use crate::model::AppState;

/// Build every component from `configuration` and seed the sample data when
/// enabled
pub async fn build_app_state(configuration: Configuration) -> anyhow::Result<AppState> {
    let replica_set = MemoryReplicaSet::new(MemoryReplicaSetConfig::from_configuration(
        &configuration,
    ));
    replica_set.start_replication();
    info!(
        "In-memory replica set '{}' started with members {:?}",
        configuration.replica_set_name(),
        replica_set.addresses()
    );

    let monitor = TopologyMonitor::new(
        TopologyConfig::from_configuration(&configuration),
        replica_set.nodes(),
    );
    monitor
        .on_role_change(Arc::new(LoggingRoleChangeListener))
        .await;

    let gateway =
        StorageGateway::connect(GatewayConfig::from_configuration(&configuration), monitor).await?;

    let processor = LedgerProcessor::new(
        gateway.clone(),
        LedgerConfig::from_configuration(&configuration),
    );
    let audit_config = AuditConfig::from_configuration(&configuration);

    if configuration.seed_on_startup() {
        let report = seed_sample_data(&gateway, audit_config.convergence_timeout).await?;
        if let Some(verification) = report.verification.as_ref()
            && !verification.is_clean()
        {
            warn!(
                "Seeded data verification reported {} findings",
                verification.finding_count()
            );
        }
    }

    let scheduler = AuditScheduler::new(IntegrityVerifier::new(gateway.clone()), audit_config);

    Ok(AppState::new(
        configuration,
        gateway,
        processor,
        scheduler,
        Some(replica_set),
    ))
}
