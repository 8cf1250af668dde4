//! Storage gateway
//!
//! The only component issuing raw reads and writes against the replica set.
//! Reads are routed by [`ReadConsistency`] and retried on transient failures;
//! writes always go to the primary with a majority-durable write concern and
//! are resent only when the caller declares them idempotent.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nexus_common::{
    Document, Filter, ReplicaNodeRef, StoreError, WriteConcern, backoff_delay,
};
use nexus_core::{
    Configuration, RoleChangeEvent, RoleChangeListener, RoleChangeType, TopologyMonitor,
    TopologySnapshot,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreakerConfig, NodeBreakers};
use crate::model::{Idempotency, Mutation, Query, ReadConsistency, WriteAck, WriteDurability};
use crate::pool::{ConnectionPool, PoolStatus, PooledConnection};

const SELECTION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Gateway configuration, defaults follow the banking driver settings
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub max_pool_size: usize,
    /// How long to wait for a suitable node (default: 5 seconds)
    pub server_selection_timeout: Duration,
    /// Bound on every single node call (default: 45 seconds)
    pub socket_timeout: Duration,
    /// Majority acknowledgment timeout (default: 10 seconds)
    pub wtimeout: Duration,
    pub read_max_retries: u32,
    pub write_max_retries: u32,
    /// First retry delay, doubled per attempt
    pub retry_delay: Duration,
    pub retry_delay_max: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            server_selection_timeout: Duration::from_millis(5000),
            socket_timeout: Duration::from_millis(45000),
            wtimeout: Duration::from_millis(10000),
            read_max_retries: 3,
            write_max_retries: 2,
            retry_delay: Duration::from_millis(100),
            retry_delay_max: Duration::from_secs(2),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            max_pool_size: configuration.max_pool_size(),
            server_selection_timeout: Duration::from_millis(
                configuration.server_selection_timeout_ms(),
            ),
            socket_timeout: Duration::from_millis(configuration.socket_timeout_ms()),
            wtimeout: Duration::from_millis(configuration.wtimeout_ms()),
            read_max_retries: configuration.read_max_retries(),
            write_max_retries: configuration.write_max_retries(),
            retry_delay: Duration::from_millis(configuration.retry_delay_ms()),
            retry_delay_max: Duration::from_secs(2),
            breaker: CircuitBreakerConfig {
                failure_threshold: configuration.breaker_failure_threshold(),
                reset_timeout: Duration::from_millis(configuration.breaker_reset_timeout_ms()),
            },
        }
    }
}

/// Closes the breaker of a freshly elected or recovered node
struct BreakerResetListener {
    breakers: Arc<NodeBreakers>,
}

#[async_trait]
impl RoleChangeListener for BreakerResetListener {
    async fn on_role_change(&self, event: &RoleChangeEvent) {
        let recovered = event.change_type == RoleChangeType::PrimaryElected
            || (event.change_type == RoleChangeType::HealthChange
                && event.health == nexus_core::NodeHealth::Healthy);
        if recovered {
            self.breakers.reset(&event.address);
        }
    }
}

/// Topology-aware access to the replica set
#[derive(Clone)]
pub struct StorageGateway {
    config: Arc<GatewayConfig>,
    monitor: TopologyMonitor,
    pool: Arc<ConnectionPool>,
    breakers: Arc<NodeBreakers>,
    next_secondary: Arc<AtomicUsize>,
}

impl StorageGateway {
    /// Open the pool, discover the topology and start the monitor
    pub async fn connect(
        config: GatewayConfig,
        monitor: TopologyMonitor,
    ) -> Result<Self, StoreError> {
        if monitor.nodes().is_empty() {
            return Err(StoreError::Unreachable(
                "no replica set members configured".to_string(),
            ));
        }

        let pool = ConnectionPool::new(config.max_pool_size, config.server_selection_timeout);
        let breakers = Arc::new(NodeBreakers::new(config.breaker.clone()));
        let gateway = Self {
            config: Arc::new(config),
            monitor,
            pool: Arc::new(pool),
            breakers: breakers.clone(),
            next_secondary: Arc::new(AtomicUsize::new(0)),
        };

        gateway
            .monitor
            .on_role_change(Arc::new(BreakerResetListener { breakers }))
            .await;
        let snapshot = gateway.monitor.refresh().await;
        gateway.monitor.start();

        match snapshot.primary() {
            Some(primary) => info!(
                "Storage gateway connected to '{}', primary {} ({}/{} members healthy)",
                snapshot.replica_set,
                primary.address,
                snapshot.healthy_count(),
                snapshot.total()
            ),
            None => warn!(
                "Storage gateway connected to '{}' without a primary ({}/{} members healthy)",
                snapshot.replica_set,
                snapshot.healthy_count(),
                snapshot.total()
            ),
        }

        Ok(gateway)
    }

    /// Close the pool and stop the monitor. Sessions already open may finish.
    pub fn shutdown(&self) {
        self.pool.close();
        self.monitor.stop();
        info!("Storage gateway shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn monitor(&self) -> &TopologyMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Start a unit of work holding one pooled connection
    pub async fn begin(&self) -> Result<Session, StoreError> {
        let connection = self.pool.acquire().await?;
        Ok(Session {
            gateway: self.clone(),
            _connection: connection,
        })
    }

    pub async fn read(
        &self,
        query: &Query,
        consistency: ReadConsistency,
    ) -> Result<Vec<Document>, StoreError> {
        self.begin().await?.read(query, consistency).await
    }

    pub async fn count(
        &self,
        collection: &str,
        filter: &Filter,
        consistency: ReadConsistency,
    ) -> Result<u64, StoreError> {
        self.begin().await?.count(collection, filter, consistency).await
    }

    pub async fn write(
        &self,
        mutation: &Mutation,
        durability: WriteDurability,
        idempotency: Idempotency,
    ) -> Result<WriteAck, StoreError> {
        self.begin()
            .await?
            .write(mutation, durability, idempotency)
            .await
    }

    /// Run one node call under the breaker and the socket timeout
    async fn call<T, F>(&self, node: &ReplicaNodeRef, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let address = node.address();
        if !self.breakers.allow(address) {
            return Err(StoreError::CircuitOpen(address.to_string()));
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.socket_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                address: address.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };
        self.breakers.record(address, &result);
        result
    }

    fn pick_read_target(
        &self,
        snapshot: &TopologySnapshot,
        consistency: ReadConsistency,
    ) -> Option<String> {
        let usable = |address: &str| !self.breakers.is_open(address);
        let primary = snapshot
            .primary()
            .map(|p| p.address.clone())
            .filter(|a| usable(a.as_str()));
        let secondaries: Vec<String> = snapshot
            .healthy_secondaries()
            .into_iter()
            .map(|n| n.address.clone())
            .filter(|a| usable(a.as_str()))
            .collect();
        let next_secondary = || {
            if secondaries.is_empty() {
                None
            } else {
                let i = self.next_secondary.fetch_add(1, Ordering::Relaxed);
                Some(secondaries[i % secondaries.len()].clone())
            }
        };

        match consistency {
            ReadConsistency::PrimaryPreferred => primary.or_else(next_secondary),
            ReadConsistency::SecondaryPreferred => next_secondary().or(primary),
        }
    }

    /// Resolve a read target, refreshing the topology and waiting up to the
    /// server selection timeout while none is usable
    async fn select_read_target(
        &self,
        consistency: ReadConsistency,
    ) -> Result<ReplicaNodeRef, StoreError> {
        let deadline = tokio::time::Instant::now() + self.config.server_selection_timeout;
        let mut refreshed = false;
        loop {
            let snapshot = if refreshed {
                self.monitor.refresh().await
            } else {
                self.monitor.current_topology()
            };
            if let Some(node) = self
                .pick_read_target(&snapshot, consistency)
                .and_then(|address| self.monitor.node(&address))
            {
                return Ok(node);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(StoreError::Unreachable(format!(
                    "no member of '{}' available for {} reads within {}ms",
                    snapshot.replica_set,
                    consistency.as_str(),
                    self.config.server_selection_timeout.as_millis()
                )));
            }
            if refreshed {
                tokio::time::sleep(SELECTION_POLL_INTERVAL.min(deadline - now)).await;
            }
            refreshed = true;
        }
    }

    async fn read_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        consistency: ReadConsistency,
        run: F,
    ) -> Result<T, StoreError>
    where
        F: Fn(ReplicaNodeRef) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let result = match self.select_read_target(consistency).await {
                Ok(node) => self.call(&node, run(node.clone())).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    metrics::histogram!("nexus_gateway_read_duration_seconds", "op" => operation.to_string())
                        .record(started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.config.read_max_retries => {
                    attempt += 1;
                    warn!(
                        "Read '{}' failed ({}), retrying ({}/{})",
                        operation, e, attempt, self.config.read_max_retries
                    );
                    metrics::counter!("nexus_gateway_retries_total", "op" => "read").increment(1);
                    if e.is_node_failure() || matches!(e, StoreError::NotPrimary(_)) {
                        self.monitor.request_refresh();
                    }
                    tokio::time::sleep(backoff_delay(
                        attempt,
                        self.config.retry_delay,
                        self.config.retry_delay_max,
                    ))
                    .await;
                }
                Err(e) => {
                    metrics::counter!("nexus_gateway_errors_total", "op" => "read").increment(1);
                    return Err(e);
                }
            }
        }
    }

    async fn send(
        node: ReplicaNodeRef,
        mutation: &Mutation,
        concern: &WriteConcern,
    ) -> Result<WriteAck, StoreError> {
        match mutation {
            Mutation::InsertMany { collection, docs } => {
                let outcome = node.insert_many(collection, docs.clone(), concern).await?;
                Ok(WriteAck {
                    node: node.address().to_string(),
                    inserted_ids: outcome.inserted_ids,
                    matched: 0,
                    modified: 0,
                    acknowledged_by: outcome.acknowledged_by,
                })
            }
            Mutation::UpdateOne {
                collection,
                filter,
                update,
            } => {
                let outcome = node.update_one(collection, filter, update, concern).await?;
                Ok(WriteAck {
                    node: node.address().to_string(),
                    inserted_ids: Vec::new(),
                    matched: outcome.matched,
                    modified: outcome.modified,
                    acknowledged_by: outcome.acknowledged_by,
                })
            }
        }
    }

    async fn write_with_retry(
        &self,
        mutation: &Mutation,
        durability: WriteDurability,
        idempotency: Idempotency,
    ) -> Result<WriteAck, StoreError> {
        let concern = match durability {
            WriteDurability::MajorityDurable => WriteConcern::majority_durable(self.config.wtimeout),
        };
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let result = match self
                .monitor
                .select_primary(self.config.server_selection_timeout)
                .await
            {
                Ok(node) => self.call(&node, Self::send(node.clone(), mutation, &concern)).await,
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(ack) => {
                    metrics::histogram!("nexus_gateway_write_duration_seconds", "op" => mutation.kind())
                        .record(started.elapsed().as_secs_f64());
                    return Ok(ack);
                }
                Err(e) => e,
            };

            // The primary we used may be gone, re-resolve before reporting
            if matches!(
                error,
                StoreError::NotPrimary(_) | StoreError::Unreachable(_) | StoreError::CircuitOpen(_)
            ) {
                self.monitor.refresh().await;
            }

            let retry = idempotency == Idempotency::Idempotent
                && error.is_transient()
                && !error.acknowledgment_unknown()
                && attempt < self.config.write_max_retries;
            if !retry {
                if error.acknowledgment_unknown() {
                    warn!(
                        "Write '{}' on '{}' unconfirmed: {}",
                        mutation.kind(),
                        mutation.collection(),
                        error
                    );
                } else {
                    debug!(
                        "Write '{}' on '{}' failed: {}",
                        mutation.kind(),
                        mutation.collection(),
                        error
                    );
                }
                metrics::counter!("nexus_gateway_errors_total", "op" => mutation.kind()).increment(1);
                return Err(error);
            }

            attempt += 1;
            warn!(
                "Write '{}' on '{}' failed ({}), retrying ({}/{})",
                mutation.kind(),
                mutation.collection(),
                error,
                attempt,
                self.config.write_max_retries
            );
            metrics::counter!("nexus_gateway_retries_total", "op" => "write").increment(1);
            tokio::time::sleep(backoff_delay(
                attempt,
                self.config.retry_delay,
                self.config.retry_delay_max,
            ))
            .await;
        }
    }
}

/// One unit of work. Holds a pooled connection until dropped.
pub struct Session {
    gateway: StorageGateway,
    _connection: PooledConnection,
}

impl Session {
    pub async fn read(
        &self,
        query: &Query,
        consistency: ReadConsistency,
    ) -> Result<Vec<Document>, StoreError> {
        self.gateway
            .read_with_retry("find", consistency, |node| async move {
                node.find(&query.collection, &query.filter, query.limit).await
            })
            .await
    }

    /// First matching document, decoded
    pub async fn find_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Filter,
        consistency: ReadConsistency,
    ) -> Result<Option<T>, StoreError> {
        let query = Query::new(collection).filter(filter).limit(1);
        match self.read(&query, consistency).await?.into_iter().next() {
            Some(doc) => Ok(Some(nexus_common::store::from_document(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn count(
        &self,
        collection: &str,
        filter: &Filter,
        consistency: ReadConsistency,
    ) -> Result<u64, StoreError> {
        self.gateway
            .read_with_retry("count", consistency, |node| async move {
                node.count(collection, filter).await
            })
            .await
    }

    /// Count on one named member, bypassing read routing and retries
    pub async fn count_on(
        &self,
        address: &str,
        collection: &str,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        let node = self
            .gateway
            .monitor
            .node(address)
            .ok_or_else(|| StoreError::Unreachable(format!("'{}' is not a member", address)))?;
        self.gateway
            .call(&node, node.count(collection, filter))
            .await
    }

    pub async fn write(
        &self,
        mutation: &Mutation,
        durability: WriteDurability,
        idempotency: Idempotency,
    ) -> Result<WriteAck, StoreError> {
        self.gateway
            .write_with_retry(mutation, durability, idempotency)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FaultTarget, MemoryReplicaSet, MemoryReplicaSetConfig};
    use nexus_common::Update;
    use nexus_core::TopologyConfig;
    use serde_json::json;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            max_pool_size: 4,
            server_selection_timeout: Duration::from_millis(300),
            socket_timeout: Duration::from_millis(500),
            wtimeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(5),
            retry_delay_max: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn connect() -> (MemoryReplicaSet, StorageGateway) {
        let set = MemoryReplicaSet::new(MemoryReplicaSetConfig {
            replica_set: "rsTest".to_string(),
            addresses: vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()],
            replication_lag: Duration::from_millis(10),
        });
        let monitor = TopologyMonitor::new(
            TopologyConfig {
                replica_set: "rsTest".to_string(),
                heartbeat_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(100),
                event_queue_size: 64,
            },
            set.nodes(),
        );
        let gateway = StorageGateway::connect(test_config(), monitor).await.unwrap();
        (set, gateway)
    }

    fn insert(doc: serde_json::Value) -> Mutation {
        Mutation::insert_one("cuentas", doc)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_set, gateway) = connect().await;

        let ack = gateway
            .write(
                &insert(json!({"cuenta": "100", "saldo": 5000})),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await
            .unwrap();
        assert_eq!(ack.node, "a:1");
        assert!(ack.acknowledged_by >= 2);

        let docs = gateway
            .read(
                &Query::new("cuentas").filter(Filter::eq("cuenta", "100")),
                ReadConsistency::PrimaryPreferred,
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_secondary_preferred_may_be_stale() {
        let (set, gateway) = connect().await;
        set.pause_replication("b:2", true).unwrap();
        set.pause_replication("c:3", true).unwrap();

        // No majority for the write, but it stays on the primary
        let err = gateway
            .write(
                &insert(json!({"cuenta": "100"})),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await
            .unwrap_err();
        assert!(err.acknowledgment_unknown());

        let primary_count = gateway
            .count("cuentas", &Filter::all(), ReadConsistency::PrimaryPreferred)
            .await
            .unwrap();
        let secondary_count = gateway
            .count("cuentas", &Filter::all(), ReadConsistency::SecondaryPreferred)
            .await
            .unwrap();
        assert_eq!(primary_count, 1);
        assert_eq!(secondary_count, 0);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_read_retries_transient_failure() {
        let (set, gateway) = connect().await;
        set.inject_fault(
            "a:1",
            FaultTarget::Read,
            2,
            StoreError::Unreachable("a:1".to_string()),
        )
        .unwrap();

        let count = gateway
            .count("cuentas", &Filter::all(), ReadConsistency::PrimaryPreferred)
            .await
            .unwrap();
        assert_eq!(count, 0);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_non_idempotent_write_not_retried() {
        let (set, gateway) = connect().await;
        set.inject_fault(
            "a:1",
            FaultTarget::Insert,
            1,
            StoreError::Unreachable("a:1".to_string()),
        )
        .unwrap();

        let result = gateway
            .write(
                &insert(json!({"cuenta": "100"})),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await;
        assert!(result.is_err());

        let count = gateway
            .count("cuentas", &Filter::all(), ReadConsistency::PrimaryPreferred)
            .await
            .unwrap();
        assert_eq!(count, 0);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_idempotent_write_follows_new_primary() {
        let (set, gateway) = connect().await;
        set.step_down("a:1").unwrap();

        // Topology still points at a:1, which now answers NotPrimary
        let ack = gateway
            .write(
                &Mutation::update_one("cuentas", Filter::eq("cuenta", "1"), Update::set("saldo", 1)),
                WriteDurability::MajorityDurable,
                Idempotency::Idempotent,
            )
            .await
            .unwrap();
        assert_eq!(Some(ack.node), set.primary_address());
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_write_fails_fast_without_primary() {
        let (set, gateway) = connect().await;
        set.stop_node("b:2").unwrap();
        set.stop_node("a:1").unwrap();

        let err = gateway
            .write(
                &insert(json!({"cuenta": "100"})),
                WriteDurability::MajorityDurable,
                Idempotency::Idempotent,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_begin_after_shutdown() {
        let (_set, gateway) = connect().await;

        gateway.shutdown();

        assert_eq!(gateway.begin().await.err(), Some(StoreError::PoolClosed));
        assert!(!gateway.monitor().is_running());
    }

    #[tokio::test]
    async fn test_count_on_reads_one_member() {
        let (set, gateway) = connect().await;
        set.pause_replication("c:3", true).unwrap();
        gateway
            .write(
                &insert(json!({"cuenta": "100"})),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await
            .unwrap();

        let session = gateway.begin().await.unwrap();
        let all = Filter::all();
        assert_eq!(session.count_on("a:1", "cuentas", &all).await.unwrap(), 1);
        assert_eq!(session.count_on("b:2", "cuentas", &all).await.unwrap(), 1);
        assert_eq!(session.count_on("c:3", "cuentas", &all).await.unwrap(), 0);
        assert!(matches!(
            session.count_on("z:9", "cuentas", &all).await,
            Err(StoreError::Unreachable(_))
        ));
        gateway.shutdown();
    }
}
