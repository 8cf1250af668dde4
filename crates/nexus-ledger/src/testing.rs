// Test fixtures: a three-member in-memory replica set behind a gateway

use std::time::Duration;

use nexus_common::model::{ACCOUNT_NUMBER_FIELD, ACCOUNTS, Account, TRANSACTIONS};
use nexus_common::store::{from_document, to_document};
use nexus_common::Filter;
use nexus_core::{TopologyConfig, TopologyMonitor};
use nexus_persistence::{
    GatewayConfig, Idempotency, MemoryReplicaSet, MemoryReplicaSetConfig, Mutation, Query,
    ReadConsistency, StorageGateway, WriteDurability,
};
use rust_decimal::Decimal;

use crate::model::LedgerConfig;
use crate::processor::LedgerProcessor;

pub struct TestStore {
    pub set: MemoryReplicaSet,
    pub gateway: StorageGateway,
    pub processor: LedgerProcessor,
}

impl TestStore {
    pub async fn new() -> Self {
        let set = MemoryReplicaSet::new(MemoryReplicaSetConfig {
            replica_set: "rsTest".to_string(),
            addresses: vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()],
            replication_lag: Duration::from_millis(10),
        });
        set.start_replication();
        let monitor = TopologyMonitor::new(
            TopologyConfig {
                replica_set: "rsTest".to_string(),
                heartbeat_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(100),
                event_queue_size: 64,
            },
            set.nodes(),
        );
        let gateway = StorageGateway::connect(
            GatewayConfig {
                max_pool_size: 16,
                server_selection_timeout: Duration::from_millis(300),
                socket_timeout: Duration::from_millis(500),
                wtimeout: Duration::from_millis(200),
                retry_delay: Duration::from_millis(5),
                retry_delay_max: Duration::from_millis(20),
                ..Default::default()
            },
            monitor,
        )
        .await
        .unwrap();
        let processor = LedgerProcessor::new(
            gateway.clone(),
            LedgerConfig {
                cas_max_retries: 20,
                cas_backoff_base: Duration::from_millis(1),
                cas_backoff_max: Duration::from_millis(10),
                journal_capacity: 64,
            },
        );
        Self {
            set,
            gateway,
            processor,
        }
    }

    pub async fn with_account(account_number: &str, balance: Decimal) -> Self {
        let store = Self::new().await;
        store.add_account(account_number, balance).await;
        store
    }

    pub async fn add_account(&self, account_number: &str, balance: Decimal) {
        let account = Account::new(account_number, "TEST000000HDFXXX00", balance);
        self.gateway
            .write(
                &Mutation::insert_one(ACCOUNTS, to_document(&account).unwrap()),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await
            .unwrap();
    }

    pub async fn balance(&self, account_number: &str) -> Decimal {
        let docs = self
            .gateway
            .read(
                &Query::new(ACCOUNTS).filter(Filter::eq(ACCOUNT_NUMBER_FIELD, account_number)),
                ReadConsistency::PrimaryPreferred,
            )
            .await
            .unwrap();
        let account: Account = from_document(docs.into_iter().next().unwrap()).unwrap();
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
            .unwrap()
    }
}
