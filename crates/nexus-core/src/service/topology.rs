//! Replica set topology monitor
//!
//! Keeps the last observed role and health of every member. Readers get the
//! cached snapshot without any I/O; the snapshot changes only through
//! [`TopologyMonitor::refresh`], driven by the heartbeat loop, by failed
//! pings and by the gateway when a node rejects a write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nexus_common::{NodeRole, ReplicaNodeRef, StoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::model::Configuration;

use super::topology_event::{
    RoleChangeEvent, RoleChangeEventPublisher, RoleChangeListener, RoleChangeType,
};

const SELECTION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Topology monitor configuration
#[derive(Clone, Debug)]
pub struct TopologyConfig {
    pub replica_set: String,
    /// Interval between background refreshes (default: 2 seconds)
    pub heartbeat_interval: Duration,
    /// Bound on every `hello` probe (default: 1 second)
    pub probe_timeout: Duration,
    pub event_queue_size: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            replica_set: nexus_common::DEFAULT_REPLICA_SET.to_string(),
            heartbeat_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            event_queue_size: 256,
        }
    }
}

impl TopologyConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            replica_set: configuration.replica_set_name(),
            heartbeat_interval: Duration::from_millis(configuration.heartbeat_interval_ms()),
            probe_timeout: Duration::from_millis(configuration.probe_timeout_ms()),
            event_queue_size: configuration.event_queue_size(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Degraded,
}

/// Last observation of one member
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub address: String,
    pub role: NodeRole,
    pub health: NodeHealth,
    pub term: u64,
    pub applied_index: u64,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeView {
    fn unobserved(address: &str) -> Self {
        Self {
            address: address.to_string(),
            role: NodeRole::Unknown,
            health: NodeHealth::Degraded,
            term: 0,
            applied_index: 0,
            last_error: None,
            last_seen: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary && self.is_healthy()
    }

    pub fn is_secondary(&self) -> bool {
        self.role == NodeRole::Secondary && self.is_healthy()
    }
}

/// Most recently observed role and health of each member
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    pub replica_set: String,
    pub nodes: Vec<NodeView>,
    /// Incremented on every refresh
    pub version: u64,
    pub observed_at: DateTime<Utc>,
}

impl TopologySnapshot {
    fn initial(replica_set: &str, addresses: &[String]) -> Self {
        Self {
            replica_set: replica_set.to_string(),
            nodes: addresses.iter().map(|a| NodeView::unobserved(a)).collect(),
            version: 0,
            observed_at: Utc::now(),
        }
    }

    pub fn primary(&self) -> Option<&NodeView> {
        self.nodes.iter().find(|n| n.is_primary())
    }

    pub fn healthy_secondaries(&self) -> Vec<&NodeView> {
        self.nodes.iter().filter(|n| n.is_secondary()).collect()
    }

    pub fn healthy_nodes(&self) -> Vec<&NodeView> {
        self.nodes.iter().filter(|n| n.is_healthy()).collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_healthy()).count()
    }

    pub fn total(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_majority(&self) -> bool {
        self.healthy_count() > self.total() / 2
    }

    pub fn node(&self, address: &str) -> Option<&NodeView> {
        self.nodes.iter().find(|n| n.address == address)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PingStatus {
    Healthy,
    Unreachable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Primary present and a majority of members healthy
    Ok,
    /// Primary present without a healthy majority
    Degraded,
    /// No primary known
    Unavailable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unavailable => "UNAVAILABLE",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub primary_present: bool,
    pub healthy_node_count: usize,
    pub total_node_count: usize,
    pub replica_set: String,
    pub primary: Option<String>,
}

impl From<&TopologySnapshot> for HealthReport {
    fn from(snapshot: &TopologySnapshot) -> Self {
        let primary = snapshot.primary().map(|n| n.address.clone());
        let status = match (&primary, snapshot.has_majority()) {
            (None, _) => HealthStatus::Unavailable,
            (Some(_), true) => HealthStatus::Ok,
            (Some(_), false) => HealthStatus::Degraded,
        };
        Self {
            status,
            primary_present: primary.is_some(),
            healthy_node_count: snapshot.healthy_count(),
            total_node_count: snapshot.total(),
            replica_set: snapshot.replica_set.clone(),
            primary,
        }
    }
}

/// Tracks primary/secondary roles and surfaces health
#[derive(Clone)]
pub struct TopologyMonitor {
    config: TopologyConfig,
    nodes: Arc<Vec<ReplicaNodeRef>>,
    snapshot: Arc<RwLock<TopologySnapshot>>,
    publisher: Arc<RoleChangeEventPublisher>,
    refresh_hint: Arc<Notify>,
    refresh_lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
}

impl TopologyMonitor {
    pub fn new(config: TopologyConfig, nodes: Vec<ReplicaNodeRef>) -> Self {
        let addresses: Vec<String> = nodes.iter().map(|n| n.address().to_string()).collect();
        let snapshot = TopologySnapshot::initial(&config.replica_set, &addresses);
        let publisher = RoleChangeEventPublisher::new(config.event_queue_size);

        Self {
            config,
            nodes: Arc::new(nodes),
            snapshot: Arc::new(RwLock::new(snapshot)),
            publisher: Arc::new(publisher),
            refresh_hint: Arc::new(Notify::new()),
            refresh_lock: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Last observed snapshot, possibly stale. Never performs I/O.
    pub fn current_topology(&self) -> TopologySnapshot {
        self.snapshot.read().clone()
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport::from(&*self.snapshot.read())
    }

    pub fn node(&self, address: &str) -> Option<ReplicaNodeRef> {
        self.nodes.iter().find(|n| n.address() == address).cloned()
    }

    pub fn nodes(&self) -> Vec<ReplicaNodeRef> {
        self.nodes.iter().cloned().collect()
    }

    /// Node currently believed to be primary
    pub fn primary_node(&self) -> Option<ReplicaNodeRef> {
        let address = self.snapshot.read().primary().map(|n| n.address.clone())?;
        self.node(&address)
    }

    /// Register a handler for topology changes.
    ///
    /// If a primary is already known the handler is immediately told about
    /// it, so a handler registered during a refresh may see that primary twice.
    pub async fn on_role_change(&self, listener: Arc<dyn RoleChangeListener>) {
        self.publisher.register_listener(listener.clone()).await;

        let current = self
            .snapshot
            .read()
            .primary()
            .map(|p| RoleChangeEvent::primary_elected(&p.address, None, p.term));
        if let Some(event) = current {
            listener.on_role_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoleChangeEvent> {
        self.publisher.subscribe()
    }

    /// Ask the heartbeat loop for an immediate re-probe
    pub fn request_refresh(&self) {
        self.refresh_hint.notify_one();
    }

    /// Probe the assumed primary. Roles are left untouched; a failed probe
    /// only wakes the heartbeat loop.
    pub async fn ping(&self) -> PingStatus {
        let Some(node) = self.primary_node() else {
            self.request_refresh();
            return PingStatus::Unreachable;
        };

        match timeout(self.config.probe_timeout, node.hello()).await {
            Ok(Ok(hello)) if hello.role == NodeRole::Primary => PingStatus::Healthy,
            Ok(Ok(hello)) => {
                debug!(
                    "Ping: {} answered as {}, requesting refresh",
                    node.address(),
                    hello.role
                );
                self.request_refresh();
                PingStatus::Unreachable
            }
            Ok(Err(e)) => {
                debug!("Ping: {} failed: {}", node.address(), e);
                self.request_refresh();
                PingStatus::Unreachable
            }
            Err(_) => {
                debug!("Ping: {} timed out", node.address());
                self.request_refresh();
                PingStatus::Unreachable
            }
        }
    }

    /// Probe every member and publish the differences with the last snapshot
    pub async fn refresh(&self) -> TopologySnapshot {
        let _guard = self.refresh_lock.lock().await;

        let probe_timeout = self.config.probe_timeout;
        let probes = self.nodes.iter().map(|node| {
            let node = node.clone();
            async move {
                let result = timeout(probe_timeout, node.hello()).await;
                (node.address().to_string(), result)
            }
        });
        let results = futures::future::join_all(probes).await;

        let previous = self.current_topology();
        let now = Utc::now();

        let mut views: Vec<NodeView> = results
            .into_iter()
            .map(|(address, result)| {
                let last = previous.node(&address);
                match result {
                    Ok(Ok(hello)) => NodeView {
                        address,
                        role: hello.role,
                        health: NodeHealth::Healthy,
                        term: hello.term,
                        applied_index: hello.applied_index,
                        last_error: None,
                        last_seen: Some(now),
                    },
                    Ok(Err(e)) => Self::unreachable_view(address, last, e.to_string()),
                    Err(_) => Self::unreachable_view(
                        address,
                        last,
                        format!("probe timed out after {}ms", probe_timeout.as_millis()),
                    ),
                }
            })
            .collect();

        Self::demote_stale_primaries(&mut views);

        let snapshot = TopologySnapshot {
            replica_set: self.config.replica_set.clone(),
            nodes: views,
            version: previous.version + 1,
            observed_at: now,
        };
        let events = Self::diff(&previous, &snapshot);

        *self.snapshot.write() = snapshot.clone();
        self.record_metrics(&snapshot, &events);

        for event in events {
            self.publisher.publish(event).await;
        }

        snapshot
    }

    /// Wait for a primary, refreshing the topology while none is known
    pub async fn select_primary(&self, wait: Duration) -> Result<ReplicaNodeRef, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(node) = self.primary_node() {
                return Ok(node);
            }
            self.refresh().await;
            if let Some(node) = self.primary_node() {
                return Ok(node);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Unreachable(format!(
                    "no primary for replica set '{}' within {}ms",
                    self.config.replica_set,
                    wait.as_millis()
                )));
            }
            tokio::time::sleep(SELECTION_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Start the background heartbeat loop
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!(
            "Starting topology monitor for replica set '{}' ({} members)",
            self.config.replica_set,
            self.nodes.len()
        );

        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.heartbeat_loop().await;
        });
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.refresh_hint.notify_one();
            info!("Stopped topology monitor");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn heartbeat_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.refresh().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = self.refresh_hint.notified() => {
                    debug!("Topology refresh requested");
                }
            }
        }
    }

    fn unreachable_view(address: String, last: Option<&NodeView>, error: String) -> NodeView {
        NodeView {
            address,
            role: NodeRole::Unknown,
            health: NodeHealth::Degraded,
            term: last.map(|l| l.term).unwrap_or_default(),
            applied_index: last.map(|l| l.applied_index).unwrap_or_default(),
            last_error: Some(error),
            last_seen: last.and_then(|l| l.last_seen),
        }
    }

    /// A member that still claims primary with an older term than another
    /// primary has been superseded and must not receive writes.
    fn demote_stale_primaries(views: &mut [NodeView]) {
        let newest_term = views
            .iter()
            .filter(|v| v.is_primary())
            .map(|v| v.term)
            .max();
        let Some(newest_term) = newest_term else {
            return;
        };

        let mut primary_kept = false;
        for view in views.iter_mut().filter(|v| v.is_primary()) {
            if view.term == newest_term && !primary_kept {
                primary_kept = true;
                continue;
            }
            warn!(
                "Node {} reports PRIMARY with stale term {} (newest {}), ignoring it",
                view.address, view.term, newest_term
            );
            view.role = NodeRole::Unknown;
            view.health = NodeHealth::Degraded;
            view.last_error = Some(format!("stale primary claim (term {})", view.term));
        }
    }

    fn diff(previous: &TopologySnapshot, current: &TopologySnapshot) -> Vec<RoleChangeEvent> {
        let mut events = Vec::new();

        for view in &current.nodes {
            let Some(before) = previous.node(&view.address) else {
                continue;
            };
            if before.role != view.role {
                events.push(RoleChangeEvent::role_change(
                    &view.address,
                    before.role,
                    view.role,
                    view.health,
                    view.term,
                ));
            }
            if before.health != view.health {
                events.push(RoleChangeEvent::health_change(
                    &view.address,
                    view.role,
                    view.health,
                    view.term,
                ));
            }
        }

        match (previous.primary(), current.primary()) {
            (before, Some(now))
                if before.is_none_or(|b| b.address != now.address || b.term != now.term) =>
            {
                let previous_role = previous.node(&now.address).map(|n| n.role);
                events.push(RoleChangeEvent::primary_elected(
                    &now.address,
                    previous_role,
                    now.term,
                ));
            }
            (Some(before), None) => {
                let after = current.node(&before.address);
                events.push(RoleChangeEvent::primary_lost(
                    &before.address,
                    after.map(|n| n.role).unwrap_or_default(),
                    after.map(|n| n.health).unwrap_or(NodeHealth::Degraded),
                    before.term,
                ));
            }
            _ => {}
        }

        events
    }

    fn record_metrics(&self, snapshot: &TopologySnapshot, events: &[RoleChangeEvent]) {
        metrics::gauge!("nexus_topology_healthy_nodes").set(snapshot.healthy_count() as f64);
        metrics::gauge!("nexus_topology_primary_present")
            .set(if snapshot.primary().is_some() { 1.0 } else { 0.0 });

        for event in events {
            if event.change_type == RoleChangeType::PrimaryElected {
                metrics::counter!("nexus_topology_elections_total").increment(1);
            }
            if event.change_type == RoleChangeType::RoleChange {
                metrics::counter!("nexus_topology_role_changes_total").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nexus_common::{
        Document, Filter, InsertOutcome, NodeHello, ReplicaNode, Update, UpdateOutcome,
        WriteConcern,
    };
    use std::sync::atomic::AtomicUsize;

    use crate::service::topology_event::FnRoleChangeListener;

    /// Node whose `hello` answer is scripted by the test
    struct ScriptedNode {
        address: String,
        answer: parking_lot::Mutex<Option<(NodeRole, u64)>>,
    }

    impl ScriptedNode {
        fn new(address: &str, role: NodeRole, term: u64) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                answer: parking_lot::Mutex::new(Some((role, term))),
            })
        }

        fn set(&self, answer: Option<(NodeRole, u64)>) {
            *self.answer.lock() = answer;
        }
    }

    #[async_trait]
    impl ReplicaNode for ScriptedNode {
        fn address(&self) -> &str {
            &self.address
        }

        async fn hello(&self) -> Result<NodeHello, StoreError> {
            let answer = *self.answer.lock();
            match answer {
                Some((role, term)) => Ok(NodeHello {
                    address: self.address.clone(),
                    role,
                    set_name: "rsTest".to_string(),
                    primary: None,
                    applied_index: 0,
                    term,
                }),
                None => Err(StoreError::Unreachable(self.address.clone())),
            }
        }

        async fn find(
            &self,
            _collection: &str,
            _filter: &Filter,
            _limit: Option<usize>,
        ) -> Result<Vec<Document>, StoreError> {
            Ok(Vec::new())
        }

        async fn count(&self, _collection: &str, _filter: &Filter) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn insert_many(
            &self,
            _collection: &str,
            _docs: Vec<Document>,
            _concern: &WriteConcern,
        ) -> Result<InsertOutcome, StoreError> {
            Ok(InsertOutcome::default())
        }

        async fn update_one(
            &self,
            _collection: &str,
            _filter: &Filter,
            _update: &Update,
            _concern: &WriteConcern,
        ) -> Result<UpdateOutcome, StoreError> {
            Ok(UpdateOutcome::default())
        }
    }

    fn three_nodes() -> (Vec<Arc<ScriptedNode>>, TopologyMonitor) {
        let nodes = vec![
            ScriptedNode::new("n1:1", NodeRole::Primary, 1),
            ScriptedNode::new("n2:2", NodeRole::Secondary, 1),
            ScriptedNode::new("n3:3", NodeRole::Secondary, 1),
        ];
        let refs: Vec<ReplicaNodeRef> = nodes.iter().map(|n| n.clone() as ReplicaNodeRef).collect();
        let config = TopologyConfig {
            replica_set: "rsTest".to_string(),
            probe_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        (nodes, TopologyMonitor::new(config, refs))
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_unavailable() {
        let (_nodes, monitor) = three_nodes();

        let report = monitor.health_report();
        assert_eq!(report.status, HealthStatus::Unavailable);
        assert!(!report.primary_present);
        assert_eq!(report.total_node_count, 3);
        assert_eq!(monitor.ping().await, PingStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_refresh_finds_primary() {
        let (_nodes, monitor) = three_nodes();

        let snapshot = monitor.refresh().await;

        assert_eq!(snapshot.primary().map(|p| p.address.as_str()), Some("n1:1"));
        assert_eq!(snapshot.version, 1);
        assert_eq!(monitor.health_report().status, HealthStatus::Ok);
        assert_eq!(monitor.ping().await, PingStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failover_is_announced() {
        let (nodes, monitor) = three_nodes();
        monitor.refresh().await;
        let mut events = monitor.subscribe();

        nodes[0].set(None);
        nodes[1].set(Some((NodeRole::Primary, 2)));
        monitor.refresh().await;

        let mut elected = None;
        while let Ok(event) = events.try_recv() {
            if event.change_type == RoleChangeType::PrimaryElected {
                elected = Some(event);
            }
        }
        let elected = elected.expect("primary elected event");
        assert_eq!(elected.address, "n2:2");
        assert_eq!(elected.term, 2);
        assert_eq!(monitor.health_report().status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn test_lost_majority_is_degraded() {
        let (nodes, monitor) = three_nodes();
        nodes[1].set(None);
        nodes[2].set(None);

        monitor.refresh().await;

        let report = monitor.health_report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.healthy_node_count, 1);
    }

    #[tokio::test]
    async fn test_all_nodes_lost() {
        let (nodes, monitor) = three_nodes();
        monitor.refresh().await;
        let mut events = monitor.subscribe();
        for node in &nodes {
            node.set(None);
        }

        monitor.refresh().await;

        assert_eq!(monitor.health_report().status, HealthStatus::Unavailable);
        let mut lost = false;
        while let Ok(event) = events.try_recv() {
            lost |= event.change_type == RoleChangeType::PrimaryLost;
        }
        assert!(lost);
        assert!(
            monitor
                .select_primary(Duration::from_millis(100))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_stale_primary_is_ignored() {
        let (nodes, monitor) = three_nodes();
        nodes[2].set(Some((NodeRole::Primary, 4)));

        let snapshot = monitor.refresh().await;

        assert_eq!(snapshot.primary().map(|p| p.address.as_str()), Some("n3:3"));
        let stale = snapshot.node("n1:1").unwrap();
        assert_eq!(stale.role, NodeRole::Unknown);
        assert!(stale.last_error.is_some());
    }

    #[tokio::test]
    async fn test_late_listener_gets_current_primary() {
        let (_nodes, monitor) = three_nodes();
        monitor.refresh().await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        monitor
            .on_role_change(Arc::new(FnRoleChangeListener::new(move |event| {
                if event.change_type == RoleChangeType::PrimaryElected {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })))
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_loop_observes_changes() {
        let (nodes, monitor) = three_nodes();
        let monitor = TopologyMonitor {
            config: TopologyConfig {
                heartbeat_interval: Duration::from_millis(20),
                ..monitor.config.clone()
            },
            ..monitor
        };
        monitor.start();
        monitor.select_primary(Duration::from_secs(1)).await.unwrap();

        nodes[0].set(Some((NodeRole::Secondary, 2)));
        nodes[2].set(Some((NodeRole::Primary, 2)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.current_topology().primary().map(|p| p.address.clone())
            != Some("n3:3".to_string())
        {
            assert!(Instant::now() < deadline, "heartbeat did not pick up the new primary");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
