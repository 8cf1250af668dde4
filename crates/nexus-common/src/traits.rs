//! Store contract traits
//!
//! The gateway talks to replica nodes only through these traits, so a
//! production driver and the in-memory replica set are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{Document, Filter, InsertOutcome, NodeHello, Update, UpdateOutcome, WriteConcern};

/// One member of a replicated document store
///
/// Writes sent to a node that is not primary fail with
/// [`StoreError::NotPrimary`]. Reads are served by any reachable node and may
/// be stale on secondaries.
#[async_trait]
pub trait ReplicaNode: Send + Sync {
    /// Host and port identifying this member, e.g. `localhost:27017`
    fn address(&self) -> &str;

    /// Role and replication position as seen by the node itself
    async fn hello(&self) -> Result<NodeHello, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
        concern: &WriteConcern,
    ) -> Result<InsertOutcome, StoreError>;

    /// Update the first document matching `filter`
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        concern: &WriteConcern,
    ) -> Result<UpdateOutcome, StoreError>;
}

pub type ReplicaNodeRef = Arc<dyn ReplicaNode>;
