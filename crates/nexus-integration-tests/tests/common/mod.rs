// Shared cluster fixture: three in-memory members, a gateway and the ledger

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use nexus_common::Filter;
use nexus_common::model::{ACCOUNT_NUMBER_FIELD, ACCOUNTS, Account, TRANSACTIONS};
use nexus_common::store::from_document;
use nexus_core::{TopologyConfig, TopologyMonitor};
use nexus_ledger::{IntegrityVerifier, LedgerConfig, LedgerProcessor, seed_sample_data};
use nexus_persistence::{
    GatewayConfig, MemoryReplicaSet, MemoryReplicaSetConfig, Query, ReadConsistency,
    StorageGateway,
};
use rust_decimal::Decimal;

pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_millis(1500);

static TRACING: Once = Once::new();

/// Log to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

pub struct Cluster {
    pub set: MemoryReplicaSet,
    pub gateway: StorageGateway,
    pub processor: LedgerProcessor,
    pub verifier: IntegrityVerifier,
}

impl Cluster {
    pub async fn start(name: &str) -> Self {
        init_tracing();
        let set = MemoryReplicaSet::new(MemoryReplicaSetConfig {
            replica_set: name.to_string(),
            addresses: vec![
                "n1:27017".to_string(),
                "n2:27018".to_string(),
                "n3:27019".to_string(),
            ],
            replication_lag: Duration::from_millis(10),
        });
        set.start_replication();

        let monitor = TopologyMonitor::new(
            TopologyConfig {
                replica_set: name.to_string(),
                heartbeat_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(100),
                event_queue_size: 64,
            },
            set.nodes(),
        );
        let gateway = StorageGateway::connect(
            GatewayConfig {
                max_pool_size: 32,
                server_selection_timeout: Duration::from_millis(500),
                socket_timeout: Duration::from_millis(500),
                wtimeout: Duration::from_millis(300),
                retry_delay: Duration::from_millis(10),
                retry_delay_max: Duration::from_millis(50),
                ..Default::default()
            },
            monitor,
        )
        .await
        .expect("gateway connects");

        let processor = LedgerProcessor::new(
            gateway.clone(),
            LedgerConfig {
                cas_max_retries: 30,
                cas_backoff_base: Duration::from_millis(1),
                cas_backoff_max: Duration::from_millis(10),
                journal_capacity: 64,
            },
        );
        let verifier = IntegrityVerifier::new(gateway.clone());

        Self {
            set,
            gateway,
            processor,
            verifier,
        }
    }

    /// Start and load the ten sample accounts
    pub async fn seeded(name: &str) -> Self {
        let cluster = Self::start(name).await;
        let report = seed_sample_data(&cluster.gateway, CONVERGENCE_TIMEOUT)
            .await
            .expect("sample data loads");
        assert!(!report.skipped);
        cluster
    }

    pub async fn balance(&self, account_number: &str) -> Decimal {
        let docs = self
            .gateway
            .read(
                &Query::new(ACCOUNTS).filter(Filter::eq(ACCOUNT_NUMBER_FIELD, account_number)),
                ReadConsistency::PrimaryPreferred,
            )
            .await
            .expect("account readable");
        let doc = docs.into_iter().next().expect("account exists");
        let account: Account = from_document(doc).expect("account decodes");
        account.balance
    }

    pub async fn entry_count(&self, account_number: &str) -> u64 {
        self.gateway
            .count(
                TRANSACTIONS,
                &Filter::eq(ACCOUNT_NUMBER_FIELD, account_number),
                ReadConsistency::PrimaryPreferred,
            )
            .await
            .expect("entries countable")
    }

    pub async fn total_entries(&self) -> u64 {
        self.gateway
            .count(TRANSACTIONS, &Filter::all(), ReadConsistency::PrimaryPreferred)
            .await
            .expect("entries countable")
    }

    pub fn shutdown(&self) {
        self.gateway.shutdown();
        self.set.stop_replication();
    }
}
