//! In-process replica set
//!
//! Implements the store contract with one primary, a shared oplog and members
//! that apply it at their own pace. Majority writes are applied synchronously
//! on just enough secondaries; the rest catch up through the background
//! replication task or [`MemoryReplicaSet::sync_secondaries`]. Members can be
//! stopped, restarted and stepped down to rehearse failover.

mod node;
mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nexus_common::{ReplicaNodeRef, StoreError};
use nexus_core::Configuration;
use parking_lot::RwLock;
use tracing::{info, warn};

pub use node::MemoryNode;
pub use state::FaultTarget;

use state::ReplicaSetState;

#[derive(Clone, Debug)]
pub struct MemoryReplicaSetConfig {
    pub replica_set: String,
    pub addresses: Vec<String>,
    /// Delay between background replication rounds (default: 50ms)
    pub replication_lag: Duration,
}

impl Default for MemoryReplicaSetConfig {
    fn default() -> Self {
        Self {
            replica_set: nexus_common::DEFAULT_REPLICA_SET.to_string(),
            addresses: nexus_core::model::DEFAULT_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            replication_lag: Duration::from_millis(50),
        }
    }
}

impl MemoryReplicaSetConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            replica_set: configuration.replica_set_name(),
            addresses: configuration.store_nodes(),
            replication_lag: Duration::from_millis(configuration.replication_lag_ms()),
        }
    }
}

pub(crate) struct Shared {
    pub config: MemoryReplicaSetConfig,
    pub state: RwLock<ReplicaSetState>,
    replicating: AtomicBool,
}

/// Handle to the in-memory replica set, cheap to clone
#[derive(Clone)]
pub struct MemoryReplicaSet {
    shared: Arc<Shared>,
    nodes: Arc<Vec<ReplicaNodeRef>>,
}

impl MemoryReplicaSet {
    pub fn new(config: MemoryReplicaSetConfig) -> Self {
        let state = ReplicaSetState::new(&config.addresses);
        let shared = Arc::new(Shared {
            config,
            state: RwLock::new(state),
            replicating: AtomicBool::new(false),
        });
        let nodes: Vec<ReplicaNodeRef> = shared
            .config
            .addresses
            .iter()
            .enumerate()
            .map(|(i, address)| {
                Arc::new(MemoryNode::new(address, i, shared.clone())) as ReplicaNodeRef
            })
            .collect();

        info!(
            "In-memory replica set '{}' created with {} members, primary {}",
            shared.config.replica_set,
            nodes.len(),
            shared.state.read().primary_address().unwrap_or("<none>")
        );

        Self {
            shared,
            nodes: Arc::new(nodes),
        }
    }

    pub fn nodes(&self) -> Vec<ReplicaNodeRef> {
        self.nodes.iter().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.shared.config.addresses.clone()
    }

    pub fn primary_address(&self) -> Option<String> {
        self.shared.state.read().primary_address().map(str::to_string)
    }

    pub fn term(&self) -> u64 {
        self.shared.state.read().term
    }

    pub fn oplog_len(&self) -> u64 {
        self.shared.state.read().oplog.len() as u64
    }

    pub fn applied_index(&self, address: &str) -> Option<u64> {
        let state = self.shared.state.read();
        state.index_of(address).map(|i| state.nodes[i].applied)
    }

    fn member(state: &ReplicaSetState, address: &str) -> Result<usize, StoreError> {
        state
            .index_of(address)
            .ok_or_else(|| StoreError::Unreachable(format!("'{}' is not a member", address)))
    }

    /// Take a member down. Stopping the primary triggers an election among
    /// the remaining members.
    pub fn stop_node(&self, address: &str) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let index = Self::member(&state, address)?;
        if !state.nodes[index].up {
            return Ok(());
        }
        state.nodes[index].up = false;
        warn!("Member {} stopped", address);

        if state.primary == Some(index) {
            state.primary = None;
            match state.elect(None) {
                Some(winner) => info!(
                    "Member {} elected primary (term {})",
                    state.nodes[winner].address, state.term
                ),
                None => warn!("No majority reachable, replica set has no primary"),
            }
        }
        Ok(())
    }

    /// Bring a member back. It rejoins as a secondary rebuilt from the oplog,
    /// so writes only it had are rolled back.
    pub fn start_node(&self, address: &str) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let index = Self::member(&state, address)?;
        if state.nodes[index].up {
            return Ok(());
        }

        let ReplicaSetState { nodes, oplog, .. } = &mut *state;
        nodes[index].up = true;
        nodes[index].resync(oplog);
        info!("Member {} restarted at oplog index {}", address, nodes[index].applied);

        if state.primary.is_none()
            && let Some(winner) = state.elect(None)
        {
            info!(
                "Member {} elected primary (term {})",
                state.nodes[winner].address, state.term
            );
        }
        Ok(())
    }

    /// Ask the primary to step down; another reachable member takes over.
    /// Returns the new primary.
    pub fn step_down(&self, address: &str) -> Result<String, StoreError> {
        let mut state = self.shared.state.write();
        let index = Self::member(&state, address)?;
        if state.primary != Some(index) {
            return Err(StoreError::NotPrimary(address.to_string()));
        }

        // Candidates must hold everything the primary acknowledged
        let until = state.oplog.len() as u64;
        let ReplicaSetState { nodes, oplog, .. } = &mut *state;
        for node in nodes.iter_mut() {
            node.catch_up(oplog, until);
        }

        let previous_term = state.term;
        match state.elect(Some(index)) {
            Some(winner) => {
                let new_primary = state.nodes[winner].address.clone();
                info!(
                    "Member {} stepped down, {} elected primary (term {})",
                    address, new_primary, state.term
                );
                Ok(new_primary)
            }
            None => {
                // Nobody else electable, the old primary keeps its role
                state.term = previous_term;
                state.primary = Some(index);
                Err(StoreError::Unreachable(format!(
                    "no electable member to replace {}",
                    address
                )))
            }
        }
    }

    /// Stop or resume applying the oplog on one member
    pub fn pause_replication(&self, address: &str, paused: bool) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let index = Self::member(&state, address)?;
        state.nodes[index].replication_paused = paused;
        Ok(())
    }

    /// Fail the next `count` operations of `target` kind on a member
    pub fn inject_fault(
        &self,
        address: &str,
        target: FaultTarget,
        count: u32,
        error: StoreError,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let index = Self::member(&state, address)?;
        state.nodes[index].add_fault(target, count, error);
        Ok(())
    }

    pub fn clear_faults(&self) {
        let mut state = self.shared.state.write();
        for node in state.nodes.iter_mut() {
            node.clear_faults();
        }
    }

    /// Bring every reachable, unpaused member up to date. Returns how many
    /// members applied anything.
    pub fn sync_secondaries(&self) -> usize {
        self.shared.state.write().sync_all()
    }

    /// Start the background replication task
    pub fn start_replication(&self) {
        if self
            .shared
            .replicating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let lag = self.shared.config.replication_lag;
        info!("Starting background replication (lag {}ms)", lag.as_millis());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while shared.replicating.load(Ordering::SeqCst) {
                tokio::time::sleep(lag).await;
                shared.state.write().sync_all();
            }
        });
    }

    pub fn stop_replication(&self) {
        if self.shared.replicating.swap(false, Ordering::SeqCst) {
            info!("Stopped background replication");
        }
    }
}
