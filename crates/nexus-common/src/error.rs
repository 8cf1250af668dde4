//! Error types and error codes for Nexus
//!
//! This module defines:
//! - `StoreError`: failures reported by the replicated store and the gateway
//! - `NexusError`: configuration and bootstrap failures
//! - `ErrorCode`: structured error codes for API responses

use serde::{Deserialize, Serialize};

/// Errors raised by replica nodes, the connection pool and the storage gateway
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed node is not (or no longer) the primary
    #[error("node '{0}' is not primary")]
    NotPrimary(String),

    /// Write concern could not be satisfied within `wtimeout`.
    /// The write may still be applied on the primary.
    #[error(
        "write concern timed out after {elapsed_ms}ms ({acknowledged}/{required} nodes acknowledged)"
    )]
    WriteTimeout {
        acknowledged: usize,
        required: usize,
        elapsed_ms: u64,
    },

    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Socket-level timeout, the request outcome is unknown
    #[error("operation on '{address}' timed out after {elapsed_ms}ms")]
    Timeout { address: String, elapsed_ms: u64 },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("circuit open for node '{0}'")]
    CircuitOpen(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Infrastructure errors that may clear up after a topology change
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::NotPrimary(_)
                | StoreError::WriteTimeout { .. }
                | StoreError::Unreachable(_)
                | StoreError::Timeout { .. }
                | StoreError::CircuitOpen(_)
        )
    }

    /// True when a write may or may not have been applied.
    ///
    /// Such writes must never be retried blindly.
    pub fn acknowledgment_unknown(&self) -> bool {
        matches!(
            self,
            StoreError::WriteTimeout { .. } | StoreError::Timeout { .. }
        )
    }

    /// True for failures that say something about the node's health
    pub fn is_node_failure(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Timeout { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Application-level error types
#[derive(thiserror::Error, Debug)]
pub enum NexusError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("bootstrap error: {0}")]
    BootstrapError(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error code structure for API responses
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const PARAMETER_VALIDATE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "parameter validate error",
};

pub const RESOURCE_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 20004,
    message: "resource not found",
};

pub const ACCOUNT_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 30001,
    message: "account not found",
};

pub const INSUFFICIENT_FUNDS: ErrorCode<'static> = ErrorCode {
    code: 30002,
    message: "insufficient funds",
};

pub const STORAGE_UNAVAILABLE: ErrorCode<'static> = ErrorCode {
    code: 30003,
    message: "storage unavailable, nothing was written",
};

pub const LEDGER_WRITE_FAILED: ErrorCode<'static> = ErrorCode {
    code: 30004,
    message: "ledger entry was not written",
};

pub const LEDGER_WRITE_UNCONFIRMED: ErrorCode<'static> = ErrorCode {
    code: 30005,
    message: "ledger entry write unconfirmed, verify before retrying",
};

pub const BALANCE_UPDATE_FAILED: ErrorCode<'static> = ErrorCode {
    code: 30006,
    message: "ledger entry written but balance not updated, verify before retrying",
};

pub const AUDIT_FAILED: ErrorCode<'static> = ErrorCode {
    code: 30010,
    message: "audit failed",
};

pub const BALANCE_CORRECTION_CONFLICT: ErrorCode<'static> = ErrorCode {
    code: 30011,
    message: "balance changed during correction, run the reconciliation again",
};

pub const NEGATIVE_REPLAY: ErrorCode<'static> = ErrorCode {
    code: 30012,
    message: "ledger replays to a negative balance, review its entries before correcting",
};

pub const DRILL_UNSUPPORTED: ErrorCode<'static> = ErrorCode {
    code: 30020,
    message: "failover drill requires the in-memory replica set",
};
