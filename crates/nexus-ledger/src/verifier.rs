//! Integrity verifier
//!
//! Out-of-band checks over what the ledger processor persisted: owner and
//! account references, balance arithmetic, replay of the ledger against the
//! stored balances, and replica convergence. Findings are reported, never
//! repaired; [`IntegrityVerifier::correct_balance`] is an explicit operator
//! action.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nexus_common::error::{
    ACCOUNT_NOT_FOUND, AUDIT_FAILED, BALANCE_CORRECTION_CONFLICT, ErrorCode, NEGATIVE_REPLAY,
};
use nexus_common::model::{
    ACCOUNT_NUMBER_FIELD, ACCOUNTS, Account, BALANCE_FIELD, COLLECTIONS, CUSTOMERS, Customer,
    LedgerEntry, TRANSACTIONS,
};
use nexus_common::store::{decimal_to_value, from_document};
use nexus_common::{Filter, StoreError, Update};
use nexus_persistence::{
    Idempotency, Mutation, Query, ReadConsistency, Session, StorageGateway, WriteDurability,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum AuditError {
    #[error("audit read failed: {0}")]
    Store(#[from] StoreError),

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("balance of account '{0}' changed while it was being corrected")]
    CorrectionConflict(String),

    #[error("ledger of account '{account_number}' replays to {replayed}, refusing to store a negative balance")]
    NegativeReplay {
        account_number: String,
        replayed: Decimal,
    },
}

impl AuditError {
    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            AuditError::Store(_) => AUDIT_FAILED,
            AuditError::AccountNotFound(_) => ACCOUNT_NOT_FOUND,
            AuditError::CorrectionConflict(_) => BALANCE_CORRECTION_CONFLICT,
            AuditError::NegativeReplay { .. } => NEGATIVE_REPLAY,
        }
    }
}

/// A record whose reference resolves to zero or several targets
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceIssue {
    pub record_id: String,
    /// The dangling or ambiguous key
    pub reference: String,
    pub matches: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferentialReport {
    pub customers_checked: usize,
    pub accounts_checked: usize,
    pub transactions_checked: usize,
    /// Accounts whose owner is not exactly one customer
    pub accounts_without_owner: Vec<ReferenceIssue>,
    /// Transactions whose account is not exactly one account
    pub transactions_without_account: Vec<ReferenceIssue>,
}

impl ReferentialReport {
    pub fn is_clean(&self) -> bool {
        self.accounts_without_owner.is_empty() && self.transactions_without_account.is_empty()
    }

    pub fn issue_count(&self) -> usize {
        self.accounts_without_owner.len() + self.transactions_without_account.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSummary {
    pub account_count: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub average: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub max: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub min: Decimal,
    /// Accounts holding a negative balance
    pub negative_accounts: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDiscrepancy {
    pub account_number: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub stored_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub replayed_balance: Decimal,
    /// stored minus replayed
    #[serde(with = "rust_decimal::serde::float")]
    pub difference: Decimal,
    pub transaction_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedEntry {
    pub transaction_id: String,
    pub account_number: String,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub accounts_checked: usize,
    pub transactions_replayed: usize,
    pub discrepancies: Vec<BalanceDiscrepancy>,
    pub orphaned_entries: Vec<OrphanedEntry>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty() && self.orphaned_entries.is_empty()
    }

    pub fn discrepancy(&self, account_number: &str) -> Option<&BalanceDiscrepancy> {
        self.discrepancies
            .iter()
            .find(|d| d.account_number == account_number)
    }
}

/// Document count per collection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CollectionCounts {
    counts: BTreeMap<String, u64>,
}

impl CollectionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, collection: &str, count: u64) -> Self {
        self.insert(collection, count);
        self
    }

    pub fn insert(&mut self, collection: &str, count: u64) {
        self.counts.insert(collection.to_string(), count);
    }

    pub fn get(&self, collection: &str) -> Option<u64> {
        self.counts.get(collection).copied()
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvergenceOutcome {
    #[serde(rename_all = "camelCase")]
    Converged {
        counts: CollectionCounts,
        elapsed_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Diverged {
        expected: CollectionCounts,
        observed: CollectionCounts,
        details: Vec<String>,
    },
}

impl ConvergenceOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceOutcome::Converged { .. })
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub referential: ReferentialReport,
    pub balances: BalanceSummary,
    pub reconciliation: ReconciliationReport,
    pub convergence: ConvergenceOutcome,
}

impl AuditReport {
    pub fn finding_count(&self) -> usize {
        self.referential.issue_count()
            + self.balances.negative_accounts.len()
            + self.reconciliation.discrepancies.len()
            + self.reconciliation.orphaned_entries.len()
            + usize::from(!self.convergence.is_converged())
    }

    pub fn is_clean(&self) -> bool {
        self.finding_count() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceCorrection {
    pub account_number: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub previous_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub corrected_balance: Decimal,
    pub transaction_count: usize,
    /// False when the stored balance already matched the ledger
    pub changed: bool,
}

/// Per-account fold of the ledger
#[derive(Default)]
struct Replay {
    balance: Decimal,
    entries: usize,
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    gateway: StorageGateway,
}

impl IntegrityVerifier {
    pub fn new(gateway: StorageGateway) -> Self {
        Self { gateway }
    }

    async fn load<T: DeserializeOwned>(
        session: &Session,
        collection: &str,
        filter: Filter,
    ) -> Result<Vec<T>, StoreError> {
        session
            .read(
                &Query::new(collection).filter(filter),
                ReadConsistency::PrimaryPreferred,
            )
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    fn replay(entries: &[LedgerEntry]) -> HashMap<&str, Replay> {
        let mut replays: HashMap<&str, Replay> = HashMap::new();
        for entry in entries {
            let replay = replays.entry(entry.account_number.as_str()).or_default();
            replay.balance += entry.signed_amount();
            replay.entries += 1;
        }
        replays
    }

    /// Accounts without exactly one owner, transactions without exactly one
    /// account
    pub async fn check_referential_integrity(&self) -> Result<ReferentialReport, AuditError> {
        let session = self.gateway.begin().await?;
        let customers: Vec<Customer> = Self::load(&session, CUSTOMERS, Filter::all()).await?;
        let accounts: Vec<Account> = Self::load(&session, ACCOUNTS, Filter::all()).await?;
        let entries: Vec<LedgerEntry> = Self::load(&session, TRANSACTIONS, Filter::all()).await?;

        let mut owners: HashMap<&str, usize> = HashMap::new();
        for customer in &customers {
            *owners.entry(customer.national_id.as_str()).or_default() += 1;
        }
        let mut account_numbers: HashMap<&str, usize> = HashMap::new();
        for account in &accounts {
            *account_numbers
                .entry(account.account_number.as_str())
                .or_default() += 1;
        }

        let accounts_without_owner = accounts
            .iter()
            .filter_map(|a| {
                let matches = owners
                    .get(a.owner_national_id.as_str())
                    .copied()
                    .unwrap_or(0);
                (matches != 1).then(|| ReferenceIssue {
                    record_id: a.id.clone(),
                    reference: a.owner_national_id.clone(),
                    matches,
                })
            })
            .collect();
        let transactions_without_account = entries
            .iter()
            .filter_map(|t| {
                let matches = account_numbers
                    .get(t.account_number.as_str())
                    .copied()
                    .unwrap_or(0);
                (matches != 1).then(|| ReferenceIssue {
                    record_id: t.id.clone(),
                    reference: t.account_number.clone(),
                    matches,
                })
            })
            .collect();

        let report = ReferentialReport {
            customers_checked: customers.len(),
            accounts_checked: accounts.len(),
            transactions_checked: entries.len(),
            accounts_without_owner,
            transactions_without_account,
        };
        if !report.is_clean() {
            warn!(
                "Referential integrity: {} accounts without a single owner, {} transactions without a single account",
                report.accounts_without_owner.len(),
                report.transactions_without_account.len()
            );
        }
        Ok(report)
    }

    /// Aggregate of the stored balances
    pub async fn check_balance_consistency(&self) -> Result<BalanceSummary, AuditError> {
        let session = self.gateway.begin().await?;
        let accounts: Vec<Account> = Self::load(&session, ACCOUNTS, Filter::all()).await?;
        Ok(Self::summarize(&accounts))
    }

    fn summarize(accounts: &[Account]) -> BalanceSummary {
        if accounts.is_empty() {
            return BalanceSummary::default();
        }

        let total: Decimal = accounts.iter().map(|a| a.balance).sum();
        let max = accounts.iter().map(|a| a.balance).max().unwrap_or_default();
        let min = accounts.iter().map(|a| a.balance).min().unwrap_or_default();
        let negative_accounts = accounts
            .iter()
            .filter(|a| a.balance.is_sign_negative() && !a.balance.is_zero())
            .map(|a| a.account_number.clone())
            .collect();

        BalanceSummary {
            account_count: accounts.len(),
            total,
            average: (total / Decimal::from(accounts.len())).round_dp(2),
            max,
            min,
            negative_accounts,
        }
    }

    /// Replay every account's ledger and compare with its stored balance
    pub async fn reconcile_balances(&self) -> Result<ReconciliationReport, AuditError> {
        let session = self.gateway.begin().await?;
        let accounts: Vec<Account> = Self::load(&session, ACCOUNTS, Filter::all()).await?;
        let entries: Vec<LedgerEntry> = Self::load(&session, TRANSACTIONS, Filter::all()).await?;

        let replays = Self::replay(&entries);
        let discrepancies: Vec<BalanceDiscrepancy> = accounts
            .iter()
            .filter_map(|account| {
                let (replayed, count) = replays
                    .get(account.account_number.as_str())
                    .map(|r| (r.balance, r.entries))
                    .unwrap_or_default();
                (replayed != account.balance).then(|| BalanceDiscrepancy {
                    account_number: account.account_number.clone(),
                    stored_balance: account.balance,
                    replayed_balance: replayed,
                    difference: account.balance - replayed,
                    transaction_count: count,
                })
            })
            .collect();

        let known: HashSet<&str> = accounts.iter().map(|a| a.account_number.as_str()).collect();
        let orphaned_entries: Vec<OrphanedEntry> = entries
            .iter()
            .filter(|e| !known.contains(e.account_number.as_str()))
            .map(|e| OrphanedEntry {
                transaction_id: e.id.clone(),
                account_number: e.account_number.clone(),
            })
            .collect();

        for d in &discrepancies {
            warn!(
                "Account {} stores {} but its {} ledger entries add up to {} (difference {})",
                d.account_number,
                d.stored_balance,
                d.transaction_count,
                d.replayed_balance,
                d.difference
            );
        }
        if !orphaned_entries.is_empty() {
            warn!(
                "{} ledger entries reference unknown accounts",
                orphaned_entries.len()
            );
        }

        Ok(ReconciliationReport {
            accounts_checked: accounts.len(),
            transactions_replayed: entries.len(),
            discrepancies,
            orphaned_entries,
        })
    }

    /// Counts on the primary, used as the convergence target
    pub async fn expected_counts(&self) -> Result<CollectionCounts, AuditError> {
        let session = self.gateway.begin().await?;
        let mut counts = CollectionCounts::new();
        for collection in COLLECTIONS {
            let count = session
                .count(collection, &Filter::all(), ReadConsistency::PrimaryPreferred)
                .await?;
            counts.insert(collection, count);
        }
        Ok(counts)
    }

    /// Poll every healthy secondary until each one holds `expected`
    ///
    /// Each collection is counted on each member directly, so a lagging
    /// secondary cannot hide behind one that already caught up. Without
    /// healthy secondaries the primary is compared instead.
    pub async fn check_replica_convergence(
        &self,
        expected: &CollectionCounts,
        timeout: Duration,
    ) -> ConvergenceOutcome {
        let started = Instant::now();
        let (observed, details) = loop {
            let (observed, details) = self.poll_members(expected).await;
            if details.is_empty() {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!("Replicas converged after {}ms", elapsed_ms);
                return ConvergenceOutcome::Converged {
                    counts: observed,
                    elapsed_ms,
                };
            }

            if started.elapsed() + CONVERGENCE_POLL_INTERVAL > timeout {
                break (observed, details);
            }
            tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
        };

        warn!(
            "Replicas did not converge within {}ms: {}",
            timeout.as_millis(),
            details.join("; ")
        );
        ConvergenceOutcome::Diverged {
            expected: expected.clone(),
            observed,
            details,
        }
    }

    /// One round of per-member counts. `observed` keeps the lowest count
    /// seen for each collection.
    async fn poll_members(&self, expected: &CollectionCounts) -> (CollectionCounts, Vec<String>) {
        let mut observed = CollectionCounts::new();
        let mut details = Vec::new();

        let snapshot = self.gateway.monitor().current_topology();
        let mut members: Vec<String> = snapshot
            .healthy_secondaries()
            .into_iter()
            .map(|n| n.address.clone())
            .collect();
        if members.is_empty() {
            members.extend(snapshot.primary().map(|p| p.address.clone()));
        }
        if members.is_empty() {
            details.push("no healthy member to count on".to_string());
            return (observed, details);
        }

        let session = match self.gateway.begin().await {
            Ok(session) => session,
            Err(e) => {
                details.push(format!("no connection available: {}", e));
                return (observed, details);
            }
        };

        for (collection, want) in expected.iter() {
            let mut lowest: Option<u64> = None;
            for address in &members {
                match session.count_on(address, collection, &Filter::all()).await {
                    Ok(count) => {
                        lowest = Some(lowest.map_or(count, |l| l.min(count)));
                        if count != want {
                            details.push(format!(
                                "{}: expected {}, observed {} on {}",
                                collection, want, count, address
                            ));
                        }
                    }
                    Err(e) => details.push(format!(
                        "{}: count on {} failed: {}",
                        collection, address, e
                    )),
                }
            }
            if let Some(count) = lowest {
                observed.insert(collection, count);
            }
        }
        (observed, details)
    }

    /// Every check in one pass
    pub async fn run_audit(&self, convergence_timeout: Duration) -> Result<AuditReport, AuditError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let referential = self.check_referential_integrity().await?;
        let balances = self.check_balance_consistency().await?;
        let reconciliation = self.reconcile_balances().await?;
        let expected = self.expected_counts().await?;
        let convergence = self
            .check_replica_convergence(&expected, convergence_timeout)
            .await;

        let report = AuditReport {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            referential,
            balances,
            reconciliation,
            convergence,
        };

        let findings = report.finding_count();
        metrics::gauge!("nexus_audit_findings").set(findings as f64);
        metrics::counter!("nexus_audit_runs_total").increment(1);
        if findings > 0 {
            metrics::counter!("nexus_audit_findings_total").increment(findings as u64);
        }
        Ok(report)
    }

    /// Set the stored balance to the ledger replay, if nobody changed it
    /// since it was read
    pub async fn correct_balance(
        &self,
        account_number: &str,
    ) -> Result<BalanceCorrection, AuditError> {
        let session = self.gateway.begin().await?;
        let account: Account = session
            .find_one(
                ACCOUNTS,
                Filter::eq(ACCOUNT_NUMBER_FIELD, account_number),
                ReadConsistency::PrimaryPreferred,
            )
            .await?
            .ok_or_else(|| AuditError::AccountNotFound(account_number.to_string()))?;
        let entries: Vec<LedgerEntry> = Self::load(
            &session,
            TRANSACTIONS,
            Filter::eq(ACCOUNT_NUMBER_FIELD, account_number),
        )
        .await?;

        let replayed: Decimal = entries.iter().map(LedgerEntry::signed_amount).sum();
        let mut correction = BalanceCorrection {
            account_number: account.account_number.clone(),
            previous_balance: account.balance,
            corrected_balance: replayed,
            transaction_count: entries.len(),
            changed: false,
        };
        if replayed == account.balance {
            return Ok(correction);
        }
        if replayed < Decimal::ZERO {
            warn!(
                "Ledger of account {} replays to a negative balance {}, leaving {} in place",
                account_number, replayed, account.balance
            );
            return Err(AuditError::NegativeReplay {
                account_number: account_number.to_string(),
                replayed,
            });
        }

        let filter = Filter::eq(ACCOUNT_NUMBER_FIELD, account_number)
            .and_eq(BALANCE_FIELD, decimal_to_value(account.balance)?);
        let ack = session
            .write(
                &Mutation::update_one(
                    ACCOUNTS,
                    filter,
                    Update::set(BALANCE_FIELD, decimal_to_value(replayed)?),
                ),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await?;
        if ack.matched == 0 {
            return Err(AuditError::CorrectionConflict(account_number.to_string()));
        }

        info!(
            "Corrected balance of account {} from {} to {} ({} ledger entries)",
            account_number,
            account.balance,
            replayed,
            entries.len()
        );
        correction.changed = true;
        Ok(correction)
    }
}
