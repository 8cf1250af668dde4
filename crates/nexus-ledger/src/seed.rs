//! Sample data bootstrap
//!
//! Loads the ten demo customers with one account each, an opening deposit
//! per account and one sample movement, then verifies what was written.
//! Does nothing when customers already exist.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use nexus_common::model::{
    ACCOUNTS, Account, CUSTOMERS, Customer, LedgerEntry, TRANSACTIONS, TransactionKind,
};
use nexus_common::store::to_document;
use nexus_common::{Document, Filter, NexusError};
use nexus_persistence::{
    Idempotency, Mutation, ReadConsistency, StorageGateway, WriteDurability,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::verifier::{AuditReport, IntegrityVerifier};

pub const OPENING_BRANCH: &str = "apertura";

/// (full name, national id)
pub const SAMPLE_CUSTOMERS: [(&str, &str); 10] = [
    ("Ana Ruiz", "RUAA900101MDFXXX01"),
    ("Luis Pérez", "PELU850203HDFXXX02"),
    ("Marta Gómez", "GOMM920304MDFXXX03"),
    ("Carlos Díaz", "DIAC750605HDFXXX04"),
    ("Elena Torres", "TORE830706MDFXXX05"),
    ("José Sánchez", "SAJJ880808HDFXXX06"),
    ("Lucía Morales", "MORL940909MDFXXX07"),
    ("Miguel Herrera", "HERM700101HDFXXX08"),
    ("Patricia Lozano", "LOZP951112MDFXXX09"),
    ("Andrés Castro", "CASA860213HDFXXX10"),
];

/// (account number, balance); owned by the customer at the same position
pub const SAMPLE_ACCOUNTS: [(&str, i64); 10] = [
    ("100", 5000),
    ("101", 7500),
    ("102", 6200),
    ("103", 4100),
    ("104", 9800),
    ("105", 3000),
    ("106", 8900),
    ("107", 2000),
    ("108", 6700),
    ("109", 4500),
];

/// One movement per account, applied after the opening deposit
pub const SAMPLE_MOVEMENTS: [(TransactionKind, i64); 10] = [
    (TransactionKind::Deposit, 1000),
    (TransactionKind::Withdrawal, 500),
    (TransactionKind::Deposit, 1500),
    (TransactionKind::Withdrawal, 700),
    (TransactionKind::Deposit, 1200),
    (TransactionKind::Withdrawal, 800),
    (TransactionKind::Deposit, 1100),
    (TransactionKind::Withdrawal, 600),
    (TransactionKind::Deposit, 1300),
    (TransactionKind::Withdrawal, 900),
];

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    /// True when data already existed and nothing was written
    pub skipped: bool,
    pub customers: usize,
    pub accounts: usize,
    pub transactions: usize,
    pub verification: Option<AuditReport>,
}

impl SeedReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            customers: 0,
            accounts: 0,
            transactions: 0,
            verification: None,
        }
    }
}

fn timestamp(month: u32, day: u32, hour: u32) -> Result<DateTime<Utc>, NexusError> {
    Utc.with_ymd_and_hms(2025, month, day, hour, 0, 0)
        .single()
        .ok_or_else(|| {
            NexusError::BootstrapError(format!("invalid sample date 2025-{month}-{day} {hour}h"))
        })
}

/// Customers, accounts and ledger entries of the demo dataset
pub fn sample_records() -> Result<(Vec<Customer>, Vec<Account>, Vec<LedgerEntry>), NexusError> {
    let customers = SAMPLE_CUSTOMERS
        .iter()
        .map(|(name, curp)| Customer::new(name, curp))
        .collect();

    let mut accounts = Vec::with_capacity(SAMPLE_ACCOUNTS.len());
    let mut entries = Vec::with_capacity(SAMPLE_ACCOUNTS.len() * 2);
    for (i, ((number, balance), (kind, amount))) in SAMPLE_ACCOUNTS
        .iter()
        .zip(SAMPLE_MOVEMENTS.iter())
        .enumerate()
    {
        let balance = Decimal::from(*balance);
        let amount = Decimal::from(*amount);
        let (_, owner) = SAMPLE_CUSTOMERS[i];
        accounts.push(Account::new(number, owner, balance));

        // Opening deposit so the ledger folds to the sample balance
        let opening = balance - kind.signed(amount);
        entries.push(
            LedgerEntry::new(
                number,
                TransactionKind::Deposit,
                opening,
                Some(OPENING_BRANCH.to_string()),
            )
            .at(timestamp(4, 1, 9)?),
        );
        let offset = i as u32;
        entries.push(
            LedgerEntry::new(number, *kind, amount, None).at(timestamp(5, 1 + offset, 10 + offset)?),
        );
    }

    Ok((customers, accounts, entries))
}

fn documents<T: Serialize>(records: &[T]) -> Result<Vec<Document>, NexusError> {
    records
        .iter()
        .map(|r| to_document(r).map_err(NexusError::from))
        .collect()
}

/// Seed the demo dataset, then verify counts, references, balances and
/// replica convergence
pub async fn seed_sample_data(
    gateway: &StorageGateway,
    convergence_timeout: Duration,
) -> Result<SeedReport, NexusError> {
    let existing = gateway
        .count(CUSTOMERS, &Filter::all(), ReadConsistency::PrimaryPreferred)
        .await?;
    if existing > 0 {
        info!(
            "Sample data already present ({} customers), skipping bootstrap",
            existing
        );
        return Ok(SeedReport::skipped());
    }

    let (customers, accounts, entries) = sample_records()?;
    let session = gateway.begin().await?;
    for (collection, docs) in [
        (CUSTOMERS, documents(&customers)?),
        (ACCOUNTS, documents(&accounts)?),
        (TRANSACTIONS, documents(&entries)?),
    ] {
        let ack = session
            .write(
                &Mutation::insert_many(collection, docs),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await?;
        info!(
            "Inserted {} documents into '{}' (acknowledged by {} members)",
            ack.inserted_ids.len(),
            collection,
            ack.acknowledged_by
        );
    }
    drop(session);

    let verifier = IntegrityVerifier::new(gateway.clone());
    let verification = verifier
        .run_audit(convergence_timeout)
        .await
        .map_err(|e| NexusError::BootstrapError(format!("post-seed verification failed: {}", e)))?;

    if verification.is_clean() {
        info!(
            "Sample data seeded and verified: {} customers, {} accounts, {} transactions, total balance {}",
            customers.len(),
            accounts.len(),
            entries.len(),
            verification.balances.total
        );
    } else {
        warn!(
            "Sample data seeded with {} verification findings",
            verification.finding_count()
        );
    }

    Ok(SeedReport {
        skipped: false,
        customers: customers.len(),
        accounts: accounts.len(),
        transactions: entries.len(),
        verification: Some(verification),
    })
}
