//! Raw document store vocabulary
//!
//! Documents are JSON objects. Filters are conjunctions of equality clauses,
//! which is all the ledger ever asks the store for.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

pub type Document = Value;

/// Conjunction of `field == value` clauses. An empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::all().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            doc.get(field)
                .is_some_and(|actual| values_equal(actual, expected))
        })
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|(field, value)| format!("{}={}", field, value))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

// 5000 and 5000.0 are the same balance
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Field assignments applied to the first matching document
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Set(Map<String, Value>),
}

impl Update {
    pub fn set(field: &str, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value.into());
        Update::Set(fields)
    }

    /// Apply to a document, returns true when any field changed
    pub fn apply(&self, doc: &mut Document) -> bool {
        let Some(target) = doc.as_object_mut() else {
            return false;
        };
        match self {
            Update::Set(fields) => {
                let mut modified = false;
                for (field, value) in fields {
                    let changed = target
                        .get(field)
                        .is_none_or(|current| !values_equal(current, value));
                    if changed {
                        target.insert(field.clone(), value.clone());
                        modified = true;
                    }
                }
                modified
            }
        }
    }
}

/// Acknowledgment requirements for a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteConcern {
    pub majority: bool,
    pub journal: bool,
    pub wtimeout: Duration,
}

impl WriteConcern {
    /// `{ w: "majority", j: true, wtimeout }`
    pub fn majority_durable(wtimeout: Duration) -> Self {
        Self {
            majority: true,
            journal: true,
            wtimeout,
        }
    }

    pub fn primary_only() -> Self {
        Self {
            majority: false,
            journal: false,
            wtimeout: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted_ids: Vec<String>,
    pub acknowledged_by: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub acknowledged_by: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Primary,
    Secondary,
    #[default]
    Unknown,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Primary => "PRIMARY",
            NodeRole::Secondary => "SECONDARY",
            NodeRole::Unknown => "UNKNOWN",
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answer to a `hello` probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHello {
    pub address: String,
    pub role: NodeRole,
    pub set_name: String,
    /// Primary as seen by this node
    pub primary: Option<String>,
    pub applied_index: u64,
    /// Election term, newer primaries carry a higher term
    pub term: u64,
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    Ok(serde_json::to_value(value)?)
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(doc)?)
}

/// Encode a decimal the way records store it, as a JSON number
pub fn decimal_to_value(value: Decimal) -> Result<Value, StoreError> {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StoreError::Serialization(format!("decimal {} is not representable", value)))
}
