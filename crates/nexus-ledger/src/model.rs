//! Ledger operation types

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use nexus_common::model::{LedgerEntry, TransactionKind};
use nexus_core::Configuration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Money is kept to cents
pub const AMOUNT_SCALE: u32 = 2;

/// Deposit or withdrawal as submitted by a caller
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationRequest {
    pub account_number: String,
    /// `deposito` / `retiro` (English `deposit` / `withdrawal` accepted)
    pub kind: String,
    pub amount: f64,
    pub branch: Option<String>,
}

impl OperationRequest {
    pub fn new(account_number: &str, kind: &str, amount: f64) -> Self {
        Self {
            account_number: account_number.to_string(),
            kind: kind.to_string(),
            amount,
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string());
        self
    }

    pub fn deposit(account_number: &str, amount: f64) -> Self {
        Self::new(account_number, TransactionKind::Deposit.as_str(), amount)
    }

    pub fn withdrawal(account_number: &str, amount: f64) -> Self {
        Self::new(account_number, TransactionKind::Withdrawal.as_str(), amount)
    }

    /// Check the request without touching the store
    pub fn validate(&self) -> Result<ValidatedOperation, LedgerError> {
        let account_number = self.account_number.trim();
        if account_number.is_empty() {
            return Err(LedgerError::InvalidInput(
                "account number must not be empty".to_string(),
            ));
        }

        let kind = TransactionKind::from_str(&self.kind).map_err(LedgerError::InvalidInput)?;

        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(LedgerError::InvalidInput(format!(
                "amount must be a positive number, got {}",
                self.amount
            )));
        }
        // Display of f64 is the shortest representation that round-trips
        let amount = Decimal::from_str(&self.amount.to_string())
            .map_err(|e| LedgerError::InvalidInput(format!("amount {}: {}", self.amount, e)))?
            .normalize();
        if amount.scale() > AMOUNT_SCALE {
            return Err(LedgerError::InvalidInput(format!(
                "amount {} has more than {} decimal places",
                amount, AMOUNT_SCALE
            )));
        }

        let branch = self
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string);

        Ok(ValidatedOperation {
            account_number: account_number.to_string(),
            kind,
            amount,
            branch,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedOperation {
    pub account_number: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub branch: Option<String>,
}

impl ValidatedOperation {
    pub fn signed_amount(&self) -> Decimal {
        self.kind.signed(self.amount)
    }
}

/// Why an operation stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InvalidInput,
    AccountNotFound,
    InsufficientFunds,
    Unavailable,
    LedgerWriteFailed,
    BalanceUpdateFailed,
}

/// Steps of the two-write ledger update
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerState {
    Validated,
    BalanceRead,
    TransactionWritten,
    BalanceUpdated,
    Committed,
    Failed(FailureReason),
}

impl Display for LedgerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerState::Validated => write!(f, "VALIDATED"),
            LedgerState::BalanceRead => write!(f, "BALANCE_READ"),
            LedgerState::TransactionWritten => write!(f, "TRANSACTION_WRITTEN"),
            LedgerState::BalanceUpdated => write!(f, "BALANCE_UPDATED"),
            LedgerState::Committed => write!(f, "COMMITTED"),
            LedgerState::Failed(reason) => write!(f, "FAILED({:?})", reason),
        }
    }
}

/// States visited by one operation, in order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OperationTrace {
    states: Vec<LedgerState>,
}

impl OperationTrace {
    pub fn from_states(states: &[LedgerState]) -> Self {
        Self {
            states: states.to_vec(),
        }
    }

    pub fn push(&mut self, state: LedgerState) {
        self.states.push(state);
    }

    pub fn states(&self) -> &[LedgerState] {
        &self.states
    }

    pub fn last(&self) -> Option<LedgerState> {
        self.states.last().copied()
    }

    pub fn reached(&self, state: LedgerState) -> bool {
        self.states.contains(&state)
    }
}

impl Display for OperationTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.states.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

/// Committed operation
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub transaction_id: String,
    pub account_number: String,
    pub kind: TransactionKind,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub previous_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub new_balance: Decimal,
    /// Conditional update attempts needed, 1 without contention
    pub balance_update_attempts: u32,
    pub entry: LedgerEntry,
    pub trace: OperationTrace,
}

/// Compare-and-swap bounds and journal size
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// Retries after the first conditional update (default: 5)
    pub cas_max_retries: u32,
    pub cas_backoff_base: Duration,
    pub cas_backoff_max: Duration,
    pub journal_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cas_max_retries: 5,
            cas_backoff_base: Duration::from_millis(10),
            cas_backoff_max: Duration::from_millis(200),
            journal_capacity: 1024,
        }
    }
}

impl LedgerConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            cas_max_retries: configuration.cas_max_retries(),
            cas_backoff_base: Duration::from_millis(configuration.cas_backoff_base_ms()),
            cas_backoff_max: Duration::from_millis(configuration.cas_backoff_max_ms()),
            journal_capacity: configuration.journal_capacity(),
        }
    }
}
