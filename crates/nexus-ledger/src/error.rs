//! Ledger error taxonomy
//!
//! Every error tells the caller whether anything was persisted:
//! [`LedgerError::is_retry_safe`] is true only when nothing was written.

use nexus_common::error::{
    ACCOUNT_NOT_FOUND, BALANCE_UPDATE_FAILED, ErrorCode, INSUFFICIENT_FUNDS, LEDGER_WRITE_FAILED,
    LEDGER_WRITE_UNCONFIRMED, PARAMETER_VALIDATE_ERROR, STORAGE_UNAVAILABLE,
};
use nexus_common::StoreError;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::{FailureReason, LedgerState, OperationTrace};

/// Whether the ledger entry of a failed operation exists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerRecordStatus {
    NotWritten,
    Written,
    /// The write may or may not have been applied
    Unknown,
}

/// Why the balance was not updated after the ledger entry was written
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DivergenceCause {
    #[error("balance update failed: {0}")]
    StoreFailure(StoreError),

    /// The update may have been applied
    #[error("balance update unconfirmed: {0}")]
    Unconfirmed(StoreError),

    #[error("balance kept changing, gave up after {attempts} conditional updates")]
    ConcurrentModification { attempts: u32 },

    #[error("balance dropped to {available} before the withdrawal could be applied")]
    InsufficientFundsAfterRace { available: Decimal },

    #[error("account disappeared before the balance update")]
    AccountVanished,
}

impl DivergenceCause {
    pub fn balance_may_be_updated(&self) -> bool {
        matches!(self, DivergenceCause::Unconfirmed(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error(
        "insufficient funds in account '{account_number}': available {available}, requested {requested}"
    )]
    InsufficientFunds {
        account_number: String,
        available: Decimal,
        requested: Decimal,
    },

    /// Nothing was written
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] StoreError),

    #[error("ledger entry '{transaction_id}' for account '{account_number}' not written: {source}")]
    LedgerWriteFailed {
        account_number: String,
        transaction_id: String,
        #[source]
        source: StoreError,
    },

    /// The ledger entry is durable but the stored balance does not include it
    #[error(
        "ledger entry '{transaction_id}' written but balance of account '{account_number}' not updated: {cause}"
    )]
    BalanceUpdateFailed {
        account_number: String,
        transaction_id: String,
        after_ledger_write: bool,
        cause: DivergenceCause,
    },
}

impl LedgerError {
    pub fn reason(&self) -> FailureReason {
        match self {
            LedgerError::InvalidInput(_) => FailureReason::InvalidInput,
            LedgerError::AccountNotFound(_) => FailureReason::AccountNotFound,
            LedgerError::InsufficientFunds { .. } => FailureReason::InsufficientFunds,
            LedgerError::Unavailable(_) => FailureReason::Unavailable,
            LedgerError::LedgerWriteFailed { .. } => FailureReason::LedgerWriteFailed,
            LedgerError::BalanceUpdateFailed { .. } => FailureReason::BalanceUpdateFailed,
        }
    }

    pub fn ledger_record_status(&self) -> LedgerRecordStatus {
        match self {
            LedgerError::LedgerWriteFailed { source, .. } if source.acknowledgment_unknown() => {
                LedgerRecordStatus::Unknown
            }
            LedgerError::BalanceUpdateFailed { .. } => LedgerRecordStatus::Written,
            _ => LedgerRecordStatus::NotWritten,
        }
    }

    pub fn ledger_record_written(&self) -> bool {
        self.ledger_record_status() == LedgerRecordStatus::Written
    }

    /// True when nothing was persisted, so resubmitting cannot apply twice
    pub fn is_retry_safe(&self) -> bool {
        self.ledger_record_status() == LedgerRecordStatus::NotWritten
    }

    /// Last state reached before the failure
    pub fn failed_after(&self) -> Option<LedgerState> {
        self.trace()
            .states()
            .iter()
            .rev()
            .find(|s| !matches!(s, LedgerState::Failed(_)))
            .copied()
    }

    /// States visited by the failed operation
    pub fn trace(&self) -> OperationTrace {
        let mut states = match self {
            LedgerError::InvalidInput(_) => vec![],
            LedgerError::AccountNotFound(_) | LedgerError::Unavailable(_) => {
                vec![LedgerState::Validated]
            }
            LedgerError::InsufficientFunds { .. } | LedgerError::LedgerWriteFailed { .. } => {
                vec![LedgerState::Validated, LedgerState::BalanceRead]
            }
            LedgerError::BalanceUpdateFailed { .. } => vec![
                LedgerState::Validated,
                LedgerState::BalanceRead,
                LedgerState::TransactionWritten,
            ],
        };
        states.push(LedgerState::Failed(self.reason()));
        OperationTrace::from_states(&states)
    }

    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            LedgerError::InvalidInput(_) => PARAMETER_VALIDATE_ERROR,
            LedgerError::AccountNotFound(_) => ACCOUNT_NOT_FOUND,
            LedgerError::InsufficientFunds { .. } => INSUFFICIENT_FUNDS,
            LedgerError::Unavailable(_) => STORAGE_UNAVAILABLE,
            LedgerError::LedgerWriteFailed { .. } => {
                if self.ledger_record_status() == LedgerRecordStatus::Unknown {
                    LEDGER_WRITE_UNCONFIRMED
                } else {
                    LEDGER_WRITE_FAILED
                }
            }
            LedgerError::BalanceUpdateFailed { .. } => BALANCE_UPDATE_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn divergence() -> LedgerError {
        LedgerError::BalanceUpdateFailed {
            account_number: "100".to_string(),
            transaction_id: "t-1".to_string(),
            after_ledger_write: true,
            cause: DivergenceCause::ConcurrentModification { attempts: 6 },
        }
    }

    #[test]
    fn test_retry_safety() {
        assert!(LedgerError::AccountNotFound("999".to_string()).is_retry_safe());
        assert!(LedgerError::Unavailable(StoreError::Unreachable("x".to_string())).is_retry_safe());
        assert!(!divergence().is_retry_safe());
        assert!(divergence().ledger_record_written());

        let unconfirmed = LedgerError::LedgerWriteFailed {
            account_number: "100".to_string(),
            transaction_id: "t-2".to_string(),
            source: StoreError::WriteTimeout {
                acknowledged: 1,
                required: 2,
                elapsed_ms: 10,
            },
        };
        assert_eq!(unconfirmed.ledger_record_status(), LedgerRecordStatus::Unknown);
        assert!(!unconfirmed.is_retry_safe());
        assert_eq!(unconfirmed.error_code().code, LEDGER_WRITE_UNCONFIRMED.code);
    }

    #[test]
    fn test_failed_after() {
        assert_eq!(
            divergence().failed_after(),
            Some(LedgerState::TransactionWritten)
        );
        let insufficient = LedgerError::InsufficientFunds {
            account_number: "100".to_string(),
            available: dec!(4500),
            requested: dec!(10000),
        };
        assert_eq!(insufficient.failed_after(), Some(LedgerState::BalanceRead));
        assert_eq!(LedgerError::InvalidInput("x".to_string()).failed_after(), None);
    }

    #[test]
    fn test_trace_ends_in_failure() {
        let trace = divergence().trace();
        assert_eq!(
            trace.last(),
            Some(LedgerState::Failed(FailureReason::BalanceUpdateFailed))
        );
        assert_eq!(trace.states().len(), 4);
    }
}
