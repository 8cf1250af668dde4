// One member of the in-memory replica set

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nexus_common::model::ID_FIELD;
use nexus_common::{
    Document, Filter, InsertOutcome, NodeHello, NodeRole, ReplicaNode, StoreError, Update,
    UpdateOutcome, WriteConcern,
};
use tokio::time::Instant;
use tracing::debug;

use super::Shared;
use super::state::{FaultTarget, ReplicaSetState, document_id};

const MAJORITY_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct MemoryNode {
    address: String,
    index: usize,
    shared: Arc<Shared>,
}

impl MemoryNode {
    pub(crate) fn new(address: &str, index: usize, shared: Arc<Shared>) -> Self {
        Self {
            address: address.to_string(),
            index,
            shared,
        }
    }

    fn check_reachable(&self, state: &mut ReplicaSetState, operation: FaultTarget) -> Result<(), StoreError> {
        let node = &mut state.nodes[self.index];
        if !node.up {
            return Err(StoreError::Unreachable(format!("{} is not reachable", self.address)));
        }
        if let Some(error) = node.take_fault(operation) {
            debug!("Injected fault on {}: {}", self.address, error);
            return Err(error);
        }
        Ok(())
    }

    fn check_primary(&self, state: &ReplicaSetState) -> Result<(), StoreError> {
        if state.primary != Some(self.index) {
            return Err(StoreError::NotPrimary(self.address.clone()));
        }
        Ok(())
    }

    /// Wait until the write at `index` is held by the required number of
    /// members, catching up secondaries on the way.
    async fn await_acknowledgment(
        &self,
        index: u64,
        term: u64,
        concern: &WriteConcern,
    ) -> Result<usize, StoreError> {
        if !concern.majority {
            return Ok(1);
        }

        let started = Instant::now();
        loop {
            let (acknowledged, required) = {
                let mut state = self.shared.state.write();
                state.replicate_for_majority(index);
                (state.acknowledgments(index, term), state.majority())
            };
            if acknowledged >= required {
                return Ok(acknowledged);
            }

            let elapsed = started.elapsed();
            if elapsed >= concern.wtimeout {
                return Err(StoreError::WriteTimeout {
                    acknowledged,
                    required,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(MAJORITY_POLL_INTERVAL.min(concern.wtimeout - elapsed)).await;
        }
    }
}

#[async_trait]
impl ReplicaNode for MemoryNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn hello(&self) -> Result<NodeHello, StoreError> {
        let state = self.shared.state.read();
        let node = &state.nodes[self.index];
        if !node.up {
            return Err(StoreError::Unreachable(format!("{} is not reachable", self.address)));
        }
        let role = if state.primary == Some(self.index) {
            NodeRole::Primary
        } else {
            NodeRole::Secondary
        };
        Ok(NodeHello {
            address: self.address.clone(),
            role,
            set_name: self.shared.config.replica_set.clone(),
            primary: state.primary_address().map(str::to_string),
            applied_index: node.applied,
            term: state.term,
        })
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let mut state = self.shared.state.write();
        self.check_reachable(&mut state, FaultTarget::Read)?;
        Ok(state.nodes[self.index]
            .collection(collection)
            .map(|c| c.find(filter, limit))
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut state = self.shared.state.write();
        self.check_reachable(&mut state, FaultTarget::Read)?;
        Ok(state.nodes[self.index]
            .collection(collection)
            .map(|c| c.count(filter))
            .unwrap_or_default())
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
        concern: &WriteConcern,
    ) -> Result<InsertOutcome, StoreError> {
        let (index, term, inserted_ids) = {
            let mut state = self.shared.state.write();
            self.check_reachable(&mut state, FaultTarget::Insert)?;
            self.check_primary(&state)?;

            let existing = state.nodes[self.index].collection(collection);
            let mut inserted_ids = Vec::with_capacity(docs.len());
            let mut entries = Vec::with_capacity(docs.len());
            for mut doc in docs {
                let Some(fields) = doc.as_object_mut() else {
                    return Err(StoreError::Serialization(
                        "only objects can be inserted".to_string(),
                    ));
                };
                let id = match fields.get(ID_FIELD).and_then(|v| v.as_str()) {
                    Some(id) => id.to_string(),
                    None => {
                        let id = uuid::Uuid::new_v4().to_string();
                        fields.insert(ID_FIELD.to_string(), id.clone().into());
                        id
                    }
                };
                if existing.is_some_and(|c| c.contains(&id)) || inserted_ids.contains(&id) {
                    return Err(StoreError::DuplicateKey(format!("{}.{}", collection, id)));
                }
                inserted_ids.push(id);
                entries.push((collection.to_string(), doc));
            }

            let index = state.append(self.index, entries);
            (index, state.term, inserted_ids)
        };

        let acknowledged_by = self.await_acknowledgment(index, term, concern).await?;
        Ok(InsertOutcome {
            inserted_ids,
            acknowledged_by,
        })
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        concern: &WriteConcern,
    ) -> Result<UpdateOutcome, StoreError> {
        let (index, term, matched, modified) = {
            let mut state = self.shared.state.write();
            self.check_reachable(&mut state, FaultTarget::Update)?;
            self.check_primary(&state)?;

            let current = state.nodes[self.index]
                .collection(collection)
                .and_then(|c| c.find_first(filter))
                .cloned();
            match current {
                None => (state.oplog.len() as u64, state.last_term(), 0, 0),
                Some(mut doc) => {
                    if update.apply(&mut doc) && document_id(&doc).is_some() {
                        let index = state.append(self.index, vec![(collection.to_string(), doc)]);
                        (index, state.term, 1, 1)
                    } else {
                        (state.oplog.len() as u64, state.last_term(), 1, 0)
                    }
                }
            }
        };

        let acknowledged_by = self.await_acknowledgment(index, term, concern).await?;
        Ok(UpdateOutcome {
            matched,
            modified,
            acknowledged_by,
        })
    }
}
