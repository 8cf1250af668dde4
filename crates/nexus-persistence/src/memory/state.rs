// Replica set state shared by all in-memory members
// A single oplog; each member applies it up to its own `applied` index

use std::collections::HashMap;

use nexus_common::model::ID_FIELD;
use nexus_common::{Document, Filter, StoreError};

/// Operation kinds that can be made to fail on a member
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultTarget {
    Read,
    Insert,
    Update,
    /// Inserts and updates
    Write,
}

impl FaultTarget {
    fn covers(&self, operation: FaultTarget) -> bool {
        *self == operation
            || (*self == FaultTarget::Write
                && matches!(operation, FaultTarget::Insert | FaultTarget::Update))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Fault {
    target: FaultTarget,
    remaining: u32,
    error: StoreError,
}

/// Replicated write: the full post-image of one document
#[derive(Clone, Debug)]
pub(crate) struct OplogEntry {
    pub term: u64,
    pub collection: String,
    pub doc: Document,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Collection {
    docs: Vec<Document>,
    by_id: HashMap<String, usize>,
}

pub(crate) fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(|v| v.as_str())
}

impl Collection {
    fn put(&mut self, doc: Document) {
        let Some(id) = document_id(&doc).map(str::to_string) else {
            return;
        };
        match self.by_id.get(&id) {
            Some(&position) => self.docs[position] = doc,
            None => {
                self.by_id.insert(id, self.docs.len());
                self.docs.push(doc);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn find(&self, filter: &Filter, limit: Option<usize>) -> Vec<Document> {
        self.docs
            .iter()
            .filter(|d| filter.matches(d))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn find_first(&self, filter: &Filter) -> Option<&Document> {
        self.docs.iter().find(|d| filter.matches(d))
    }

    pub fn count(&self, filter: &Filter) -> u64 {
        self.docs.iter().filter(|d| filter.matches(d)).count() as u64
    }
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub address: String,
    pub up: bool,
    pub applied: u64,
    pub replication_paused: bool,
    pub data: HashMap<String, Collection>,
    faults: Vec<Fault>,
}

impl NodeState {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            up: true,
            applied: 0,
            replication_paused: false,
            data: HashMap::new(),
            faults: Vec::new(),
        }
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.data.get(name)
    }

    pub fn apply(&mut self, entry: &OplogEntry) {
        self.data
            .entry(entry.collection.clone())
            .or_default()
            .put(entry.doc.clone());
        self.applied += 1;
    }

    /// Apply pending oplog entries. Paused or stopped members stay behind.
    pub fn catch_up(&mut self, oplog: &[OplogEntry], until: u64) -> bool {
        if !self.up || self.replication_paused {
            return false;
        }
        let until = until.min(oplog.len() as u64);
        let mut progressed = false;
        while self.applied < until {
            let entry = &oplog[self.applied as usize];
            self.apply(entry);
            progressed = true;
        }
        progressed
    }

    /// Rebuild the member from the oplog, dropping anything rolled back
    pub fn resync(&mut self, oplog: &[OplogEntry]) {
        self.data.clear();
        self.applied = 0;
        for entry in oplog {
            self.apply(entry);
        }
    }

    pub fn add_fault(&mut self, target: FaultTarget, count: u32, error: StoreError) {
        self.faults.push(Fault {
            target,
            remaining: count,
            error,
        });
    }

    pub fn take_fault(&mut self, operation: FaultTarget) -> Option<StoreError> {
        let position = self
            .faults
            .iter()
            .position(|f| f.target.covers(operation) && f.remaining > 0)?;
        let fault = &mut self.faults[position];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(position);
        }
        Some(error)
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }
}

#[derive(Debug)]
pub(crate) struct ReplicaSetState {
    pub nodes: Vec<NodeState>,
    pub primary: Option<usize>,
    pub term: u64,
    pub oplog: Vec<OplogEntry>,
}

impl ReplicaSetState {
    pub fn new(addresses: &[String]) -> Self {
        let mut state = Self {
            nodes: addresses.iter().map(|a| NodeState::new(a)).collect(),
            primary: None,
            term: 0,
            oplog: Vec::new(),
        };
        state.elect(None);
        state
    }

    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn up_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.up).count()
    }

    pub fn index_of(&self, address: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.address == address)
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.primary.map(|i| self.nodes[i].address.as_str())
    }

    /// Hold an election among reachable members. The member with the highest
    /// applied index wins; entries it lacks are discarded, and reachable
    /// members that already applied them are rebuilt from the kept oplog.
    pub fn elect(&mut self, exclude: Option<usize>) -> Option<usize> {
        if self.up_count() < self.majority() {
            self.primary = None;
            return None;
        }

        let winner = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| n.up && Some(*i) != exclude)
            .max_by(|(ia, a), (ib, b)| a.applied.cmp(&b.applied).then(ib.cmp(ia)))
            .map(|(i, _)| i)?;

        self.term += 1;
        self.primary = Some(winner);
        let retained = self.nodes[winner].applied;
        self.oplog.truncate(retained as usize);
        let Self { nodes, oplog, .. } = self;
        for node in nodes.iter_mut().filter(|n| n.up && n.applied > retained) {
            node.resync(oplog);
        }
        Some(winner)
    }

    /// Append writes on the primary and apply them there
    pub fn append(&mut self, primary: usize, entries: Vec<(String, Document)>) -> u64 {
        for (collection, doc) in entries {
            self.oplog.push(OplogEntry {
                term: self.term,
                collection,
                doc,
            });
        }
        let oplog = &self.oplog;
        let until = oplog.len() as u64;
        let node = &mut self.nodes[primary];
        while node.applied < until {
            let entry = &oplog[node.applied as usize];
            node.apply(entry);
        }
        until
    }

    /// Catch up secondaries one at a time until `index` is on a majority
    pub fn replicate_for_majority(&mut self, index: u64) {
        let majority = self.majority();
        let primary = self.primary;
        for i in 0..self.nodes.len() {
            if self.count_applied(index) >= majority {
                return;
            }
            if Some(i) == primary || self.nodes[i].applied >= index {
                continue;
            }
            let oplog = &self.oplog;
            self.nodes[i].catch_up(oplog, index);
        }
    }

    /// Term of the newest oplog entry. A write that appended nothing waits
    /// on that entry instead of one of its own.
    pub fn last_term(&self) -> u64 {
        self.oplog.last().map_or(self.term, |e| e.term)
    }

    /// Members (reachable) that hold `index`, zero if the entry was rolled back
    pub fn acknowledgments(&self, index: u64, term: u64) -> usize {
        if index == 0 {
            return self.nodes.iter().filter(|n| n.up).count();
        }
        let retained = self
            .oplog
            .get(index as usize - 1)
            .is_some_and(|e| e.term == term);
        if !retained {
            return 0;
        }
        self.count_applied(index)
    }

    fn count_applied(&self, index: u64) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.up && n.applied >= index)
            .count()
    }

    pub fn sync_all(&mut self) -> usize {
        let until = self.oplog.len() as u64;
        let oplog = &self.oplog;
        self.nodes
            .iter_mut()
            .map(|n| n.catch_up(oplog, until))
            .filter(|progressed| *progressed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addresses() -> Vec<String> {
        vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]
    }

    #[test]
    fn test_initial_election() {
        let state = ReplicaSetState::new(&addresses());
        assert_eq!(state.primary_address(), Some("a:1"));
        assert_eq!(state.term, 1);
    }

    #[test]
    fn test_majority_replication_leaves_lagging_member() {
        let mut state = ReplicaSetState::new(&addresses());
        let index = state.append(0, vec![("x".to_string(), json!({"_id": "1"}))]);

        state.replicate_for_majority(index);

        assert_eq!(state.acknowledgments(index, 1), 2);
        assert_eq!(state.nodes[2].applied, 0);
        assert_eq!(state.sync_all(), 1);
        assert_eq!(state.acknowledgments(index, 1), 3);
    }

    #[test]
    fn test_election_prefers_most_recent_member() {
        let mut state = ReplicaSetState::new(&addresses());
        state.nodes[1].replication_paused = true;
        let index = state.append(0, vec![("x".to_string(), json!({"_id": "1"}))]);
        state.replicate_for_majority(index);
        state.nodes[0].up = false;

        assert_eq!(state.elect(None), Some(2));
        assert_eq!(state.term, 2);
        assert_eq!(state.oplog.len(), 1);
    }

    #[test]
    fn test_election_rolls_back_members_ahead_of_winner() {
        let mut state = ReplicaSetState::new(&addresses());
        state.nodes[1].replication_paused = true;
        state.nodes[2].replication_paused = true;
        state.append(0, vec![("x".to_string(), json!({"_id": "1"}))]);

        assert_eq!(state.elect(Some(0)), Some(1));
        assert!(state.oplog.is_empty());
        assert_eq!(state.nodes[0].applied, 0);
        assert!(state.nodes[0].collection("x").is_none());

        state.nodes[1].replication_paused = false;
        let index = state.append(1, vec![("x".to_string(), json!({"_id": "2"}))]);
        state.replicate_for_majority(index);

        assert_eq!(state.acknowledgments(index, state.term), 2);
        let old_primary = state.nodes[0].collection("x").unwrap();
        assert!(old_primary.contains("2"));
        assert!(!old_primary.contains("1"));
    }

    #[test]
    fn test_no_election_without_majority() {
        let mut state = ReplicaSetState::new(&addresses());
        state.nodes[0].up = false;
        state.nodes[1].up = false;

        assert_eq!(state.elect(None), None);
        assert_eq!(state.primary, None);
    }

    #[test]
    fn test_fault_is_consumed() {
        let mut node = NodeState::new("a:1");
        node.add_fault(FaultTarget::Write, 1, StoreError::NotPrimary("a:1".to_string()));

        assert!(node.take_fault(FaultTarget::Read).is_none());
        assert!(node.take_fault(FaultTarget::Update).is_some());
        assert!(node.take_fault(FaultTarget::Update).is_none());
    }
}
