//! Persisted record shapes
//!
//! Field and collection names match the layout the banking frontend reads,
//! so they stay in the store's original (Spanish) vocabulary.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CUSTOMERS: &str = "clientes";
pub const ACCOUNTS: &str = "cuentas";
pub const TRANSACTIONS: &str = "transacciones";

/// Every collection the ledger owns, in dependency order
pub const COLLECTIONS: [&str; 3] = [CUSTOMERS, ACCOUNTS, TRANSACTIONS];

pub const ID_FIELD: &str = "_id";
pub const NATIONAL_ID_FIELD: &str = "curp";
pub const ACCOUNT_NUMBER_FIELD: &str = "cuenta";
pub const OWNER_FIELD: &str = "cliente";
pub const BALANCE_FIELD: &str = "saldo";

/// Bank customer, keyed by national id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "nombre")]
    pub full_name: String,
    #[serde(rename = "curp")]
    pub national_id: String,
}

impl Customer {
    pub fn new(full_name: &str, national_id: &str) -> Self {
        Self {
            id: String::new(),
            full_name: full_name.to_string(),
            national_id: national_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "cuenta")]
    pub account_number: String,
    #[serde(rename = "cliente")]
    pub owner_national_id: String,
    #[serde(rename = "saldo", with = "rust_decimal::serde::float")]
    pub balance: Decimal,
}

impl Account {
    pub fn new(account_number: &str, owner_national_id: &str, balance: Decimal) -> Self {
        Self {
            id: String::new(),
            account_number: account_number.to_string(),
            owner_national_id: owner_national_id.to_string(),
            balance,
        }
    }
}

/// Direction of a ledger movement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    #[serde(rename = "deposito")]
    Deposit,
    #[serde(rename = "retiro")]
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposito",
            TransactionKind::Withdrawal => "retiro",
        }
    }

    /// Apply the movement's sign to a positive amount
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            TransactionKind::Deposit => amount,
            TransactionKind::Withdrawal => -amount,
        }
    }
}

impl Display for TransactionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deposito" | "depósito" | "deposit" => Ok(TransactionKind::Deposit),
            "retiro" | "withdrawal" | "withdraw" => Ok(TransactionKind::Withdrawal),
            other => Err(format!("unrecognized transaction kind '{}'", other)),
        }
    }
}

/// Append-only ledger entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "cuenta")]
    pub account_number: String,
    #[serde(rename = "tipo")]
    pub kind: TransactionKind,
    #[serde(rename = "monto", with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(rename = "sucursal", default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(rename = "fecha")]
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create an entry with a fresh id, stamped now
    pub fn new(
        account_number: &str,
        kind: TransactionKind,
        amount: Decimal,
        branch: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_number: account_number.to_string(),
            kind,
            amount,
            branch,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn signed_amount(&self) -> Decimal {
        self.kind.signed(self.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "deposito".parse::<TransactionKind>(),
            Ok(TransactionKind::Deposit)
        );
        assert_eq!(
            "Withdrawal".parse::<TransactionKind>(),
            Ok(TransactionKind::Withdrawal)
        );
        assert!("transfer".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn test_signed_amount() {
        let deposit = LedgerEntry::new("100", TransactionKind::Deposit, dec!(250), None);
        let withdrawal = LedgerEntry::new("100", TransactionKind::Withdrawal, dec!(75.5), None);
        assert_eq!(deposit.signed_amount(), dec!(250));
        assert_eq!(withdrawal.signed_amount(), dec!(-75.5));
    }

    #[test]
    fn test_account_uses_store_field_names() {
        let account = Account::new("100", "RUAA900101MDFXXX01", dec!(5000));
        let value = serde_json::to_value(&account).unwrap();

        assert_eq!(value["cuenta"], "100");
        assert_eq!(value["cliente"], "RUAA900101MDFXXX01");
        assert_eq!(value["saldo"].as_f64(), Some(5000.0));
        assert!(value.get("_id").is_none());
    }

    #[test]
    fn test_entry_reads_integer_amounts() {
        let value = serde_json::json!({
            "_id": "t-1",
            "cuenta": "101",
            "tipo": "retiro",
            "monto": 500,
            "fecha": "2025-05-02T11:00:00Z"
        });
        let entry: LedgerEntry = serde_json::from_value(value).unwrap();

        assert_eq!(entry.kind, TransactionKind::Withdrawal);
        assert_eq!(entry.amount, dec!(500));
        assert_eq!(entry.branch, None);
    }
}
