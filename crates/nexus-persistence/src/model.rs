//! Request and response types of the storage gateway

use nexus_common::{Document, Filter, Update};
use serde::{Deserialize, Serialize};

/// Read routing preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadConsistency {
    /// Healthy primary, else any healthy node (possibly stale)
    #[default]
    PrimaryPreferred,
    /// Healthy secondary, else the primary
    SecondaryPreferred,
}

impl ReadConsistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadConsistency::PrimaryPreferred => "primaryPreferred",
            ReadConsistency::SecondaryPreferred => "secondaryPreferred",
        }
    }
}

/// Acknowledgment level required for writes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteDurability {
    /// Replicated to a majority and journaled before acknowledgment
    #[default]
    MajorityDurable,
}

/// Whether the gateway may resend a write after a transient failure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    #[default]
    NonIdempotent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filter: Filter,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filter: Filter::all(),
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    InsertMany {
        collection: String,
        docs: Vec<Document>,
    },
    UpdateOne {
        collection: String,
        filter: Filter,
        update: Update,
    },
}

impl Mutation {
    pub fn insert_one(collection: &str, doc: Document) -> Self {
        Self::insert_many(collection, vec![doc])
    }

    pub fn insert_many(collection: &str, docs: Vec<Document>) -> Self {
        Mutation::InsertMany {
            collection: collection.to_string(),
            docs,
        }
    }

    pub fn update_one(collection: &str, filter: Filter, update: Update) -> Self {
        Mutation::UpdateOne {
            collection: collection.to_string(),
            filter,
            update,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Mutation::InsertMany { collection, .. } | Mutation::UpdateOne { collection, .. } => {
                collection
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::InsertMany { .. } => "insert",
            Mutation::UpdateOne { .. } => "update",
        }
    }
}

/// Acknowledged write
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAck {
    /// Primary that accepted the write
    pub node: String,
    pub inserted_ids: Vec<String>,
    pub matched: u64,
    pub modified: u64,
    pub acknowledged_by: usize,
}
