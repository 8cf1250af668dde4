//! Ledger processor
//!
//! Applies a deposit or withdrawal as two majority-durable writes: the ledger
//! entry first, then the account balance through a conditional update keyed
//! on the balance read earlier. A balance that moved in between is re-read,
//! re-checked and retried within the configured bounds.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use nexus_common::model::{
    ACCOUNT_NUMBER_FIELD, ACCOUNTS, Account, BALANCE_FIELD, LedgerEntry, TRANSACTIONS,
};
use nexus_common::store::{decimal_to_value, to_document};
use nexus_common::{Filter, StoreError, Update, backoff_delay};
use nexus_persistence::{
    Idempotency, Mutation, ReadConsistency, Session, StorageGateway, WriteDurability,
};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::error::{DivergenceCause, LedgerError, LedgerRecordStatus};
use crate::journal::{DivergenceJournal, DivergenceRecord};
use crate::model::{
    LedgerConfig, LedgerReceipt, LedgerState, OperationRequest, OperationTrace,
    ValidatedOperation,
};

struct BalanceUpdate {
    previous: Decimal,
    new_balance: Decimal,
    attempts: u32,
}

#[derive(Clone)]
pub struct LedgerProcessor {
    gateway: StorageGateway,
    config: LedgerConfig,
    journal: Arc<DivergenceJournal>,
}

impl LedgerProcessor {
    pub fn new(gateway: StorageGateway, config: LedgerConfig) -> Self {
        let journal = Arc::new(DivergenceJournal::new(config.journal_capacity));
        Self {
            gateway,
            config,
            journal,
        }
    }

    pub fn journal(&self) -> Arc<DivergenceJournal> {
        self.journal.clone()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Apply one deposit or withdrawal
    ///
    /// Once the ledger entry is written it stays written; dropping the
    /// returned future afterwards cannot undo it.
    pub async fn apply(&self, request: OperationRequest) -> Result<LedgerReceipt, LedgerError> {
        let started = Instant::now();
        let result = self.run(&request).await;

        let outcome = match &result {
            Ok(_) => "committed".to_string(),
            Err(e) => format!("{:?}", e.reason()),
        };
        metrics::counter!("nexus_ledger_operations_total", "outcome" => outcome).increment(1);
        metrics::histogram!("nexus_ledger_apply_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            match e {
                LedgerError::BalanceUpdateFailed { .. } => {}
                e if e.is_retry_safe() => debug!("Ledger operation rejected: {}", e),
                e => warn!("Ledger operation failed: {}", e),
            }
        }
        result
    }

    async fn run(&self, request: &OperationRequest) -> Result<LedgerReceipt, LedgerError> {
        let mut trace = OperationTrace::default();

        let operation = request.validate()?;
        trace.push(LedgerState::Validated);

        let session = self.gateway.begin().await.map_err(LedgerError::Unavailable)?;

        let account = Self::read_account(&session, &operation.account_number)
            .await
            .map_err(LedgerError::Unavailable)?
            .ok_or_else(|| LedgerError::AccountNotFound(operation.account_number.clone()))?;
        trace.push(LedgerState::BalanceRead);

        Self::check_funds(&operation, account.balance)?;

        let entry = LedgerEntry::new(
            &operation.account_number,
            operation.kind,
            operation.amount,
            operation.branch.clone(),
        );
        self.write_entry(&session, &entry).await?;
        trace.push(LedgerState::TransactionWritten);

        let update = self
            .update_balance(&session, &operation, account.balance)
            .await
            .map_err(|cause| self.diverged(&entry, cause))?;
        trace.push(LedgerState::BalanceUpdated);
        trace.push(LedgerState::Committed);

        info!(
            "Committed {} of {} on account {} ({} -> {}, transaction {})",
            entry.kind,
            entry.amount,
            entry.account_number,
            update.previous,
            update.new_balance,
            entry.id
        );

        Ok(LedgerReceipt {
            transaction_id: entry.id.clone(),
            account_number: entry.account_number.clone(),
            kind: entry.kind,
            amount: entry.amount,
            previous_balance: update.previous,
            new_balance: update.new_balance,
            balance_update_attempts: update.attempts,
            entry,
            trace,
        })
    }

    async fn read_account(
        session: &Session,
        account_number: &str,
    ) -> Result<Option<Account>, StoreError> {
        session
            .find_one(
                ACCOUNTS,
                Filter::eq(ACCOUNT_NUMBER_FIELD, account_number),
                ReadConsistency::PrimaryPreferred,
            )
            .await
    }

    fn check_funds(operation: &ValidatedOperation, available: Decimal) -> Result<(), LedgerError> {
        if available + operation.signed_amount() < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                account_number: operation.account_number.clone(),
                available,
                requested: operation.amount,
            });
        }
        Ok(())
    }

    async fn write_entry(&self, session: &Session, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let failed = |source: StoreError| LedgerError::LedgerWriteFailed {
            account_number: entry.account_number.clone(),
            transaction_id: entry.id.clone(),
            source,
        };

        let doc = to_document(entry).map_err(failed)?;
        let result = session
            .write(
                &Mutation::insert_one(TRANSACTIONS, doc),
                WriteDurability::MajorityDurable,
                Idempotency::NonIdempotent,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(source) => {
                let err = failed(source);
                if err.ledger_record_status() == LedgerRecordStatus::Unknown {
                    // May surface later as an entry the balance does not include
                    self.journal.record(DivergenceRecord {
                        transaction_id: entry.id.clone(),
                        account_number: entry.account_number.clone(),
                        kind: entry.kind,
                        amount: entry.amount,
                        cause: err.to_string(),
                        ledger_record: LedgerRecordStatus::Unknown,
                        recorded_at: Utc::now(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Conditional update of the balance, retried while other writers win
    async fn update_balance(
        &self,
        session: &Session,
        operation: &ValidatedOperation,
        read_balance: Decimal,
    ) -> Result<BalanceUpdate, DivergenceCause> {
        let mut expected = read_balance;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let new_balance = expected + operation.signed_amount();
            if new_balance < Decimal::ZERO {
                return Err(DivergenceCause::InsufficientFundsAfterRace {
                    available: expected,
                });
            }

            let filter = Filter::eq(ACCOUNT_NUMBER_FIELD, operation.account_number.as_str())
                .and_eq(
                    BALANCE_FIELD,
                    decimal_to_value(expected).map_err(DivergenceCause::StoreFailure)?,
                );
            let update = Update::set(
                BALANCE_FIELD,
                decimal_to_value(new_balance).map_err(DivergenceCause::StoreFailure)?,
            );
            let result = session
                .write(
                    &Mutation::update_one(ACCOUNTS, filter, update),
                    WriteDurability::MajorityDurable,
                    Idempotency::NonIdempotent,
                )
                .await;

            let retries_left = attempts <= self.config.cas_max_retries;
            match result {
                Ok(ack) if ack.matched > 0 => {
                    return Ok(BalanceUpdate {
                        previous: expected,
                        new_balance,
                        attempts,
                    });
                }
                Ok(_) if retries_left => {
                    metrics::counter!("nexus_ledger_cas_conflicts_total").increment(1);
                    debug!(
                        "Balance of account {} moved away from {}, retrying ({}/{})",
                        operation.account_number, expected, attempts, self.config.cas_max_retries
                    );
                }
                Ok(_) => return Err(DivergenceCause::ConcurrentModification { attempts }),
                Err(e) if e.acknowledgment_unknown() => {
                    return Err(DivergenceCause::Unconfirmed(e));
                }
                Err(e) if e.is_transient() && retries_left => {
                    warn!(
                        "Balance update of account {} failed ({}), retrying ({}/{})",
                        operation.account_number, e, attempts, self.config.cas_max_retries
                    );
                }
                Err(e) => return Err(DivergenceCause::StoreFailure(e)),
            }

            tokio::time::sleep(backoff_delay(
                attempts - 1,
                self.config.cas_backoff_base,
                self.config.cas_backoff_max,
            ))
            .await;

            expected = Self::read_account(session, &operation.account_number)
                .await
                .map_err(DivergenceCause::StoreFailure)?
                .ok_or(DivergenceCause::AccountVanished)?
                .balance;
        }
    }

    fn diverged(&self, entry: &LedgerEntry, cause: DivergenceCause) -> LedgerError {
        metrics::counter!("nexus_ledger_divergences_total").increment(1);
        error!(
            "Ledger divergence: transaction {} ({} {}) on account {} is durable but the balance was not updated: {}",
            entry.id, entry.kind, entry.amount, entry.account_number, cause
        );
        self.journal.record(DivergenceRecord {
            transaction_id: entry.id.clone(),
            account_number: entry.account_number.clone(),
            kind: entry.kind,
            amount: entry.amount,
            cause: cause.to_string(),
            ledger_record: LedgerRecordStatus::Written,
            recorded_at: Utc::now(),
        });

        LedgerError::BalanceUpdateFailed {
            account_number: entry.account_number.clone(),
            transaction_id: entry.id.clone(),
            after_ledger_write: true,
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestStore;
    use nexus_common::model::TransactionKind;
    use nexus_persistence::FaultTarget;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_deposit_commits() {
        let store = TestStore::with_account("100", dec!(5000)).await;

        let receipt = store
            .processor
            .apply(OperationRequest::deposit("100", 250.0).with_branch("cdmx"))
            .await
            .unwrap();

        assert_eq!(receipt.previous_balance, dec!(5000));
        assert_eq!(receipt.new_balance, dec!(5250));
        assert_eq!(receipt.kind, TransactionKind::Deposit);
        assert_eq!(receipt.balance_update_attempts, 1);
        assert_eq!(receipt.trace.last(), Some(LedgerState::Committed));
        assert_eq!(store.balance("100").await, dec!(5250));
        assert_eq!(store.entry_count("100").await, 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_writes_nothing() {
        let store = TestStore::with_account("100", dec!(100)).await;

        let err = store
            .processor
            .apply(OperationRequest::withdrawal("100", 100.01))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(err.is_retry_safe());
        assert_eq!(store.balance("100").await, dec!(100));
        assert_eq!(store.entry_count("100").await, 0);
    }

    #[tokio::test]
    async fn test_withdraw_entire_balance() {
        let store = TestStore::with_account("100", dec!(100)).await;

        let receipt = store
            .processor
            .apply(OperationRequest::withdrawal("100", 100.0))
            .await
            .unwrap();

        assert_eq!(receipt.new_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_ledger_write_failure_leaves_balance() {
        let store = TestStore::with_account("100", dec!(100)).await;
        store
            .set
            .inject_fault(
                "a:1",
                FaultTarget::Insert,
                1,
                StoreError::NotPrimary("a:1".to_string()),
            )
            .unwrap();

        let err = store
            .processor
            .apply(OperationRequest::deposit("100", 5.0))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::LedgerWriteFailed { .. }));
        assert!(err.is_retry_safe());
        assert_eq!(store.balance("100").await, dec!(100));
        assert!(store.processor.journal().is_empty());
    }

    #[tokio::test]
    async fn test_balance_update_failure_is_journaled() {
        let store = TestStore::with_account("100", dec!(100)).await;
        store
            .set
            .inject_fault(
                "a:1",
                FaultTarget::Update,
                1,
                StoreError::WriteTimeout {
                    acknowledged: 1,
                    required: 2,
                    elapsed_ms: 10,
                },
            )
            .unwrap();

        let err = store
            .processor
            .apply(OperationRequest::deposit("100", 5.0))
            .await
            .unwrap_err();

        let LedgerError::BalanceUpdateFailed {
            transaction_id,
            after_ledger_write,
            ..
        } = &err
        else {
            panic!("unexpected error {err}");
        };
        assert!(after_ledger_write);
        assert!(err.ledger_record_written());
        assert_eq!(err.failed_after(), Some(LedgerState::TransactionWritten));
        assert_eq!(store.entry_count("100").await, 1);
        assert_eq!(store.balance("100").await, dec!(100));

        let records = store.processor.journal().records();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].transaction_id, transaction_id);
    }

    #[tokio::test]
    async fn test_transient_update_failure_is_retried() {
        let store = TestStore::with_account("100", dec!(100)).await;
        store
            .set
            .inject_fault(
                "a:1",
                FaultTarget::Update,
                2,
                StoreError::NotPrimary("a:1".to_string()),
            )
            .unwrap();

        let receipt = store
            .processor
            .apply(OperationRequest::deposit("100", 5.0))
            .await
            .unwrap();

        assert_eq!(receipt.balance_update_attempts, 3);
        assert_eq!(store.balance("100").await, dec!(105));
    }

    #[tokio::test]
    async fn test_concurrent_deposits_all_land() {
        let store = TestStore::with_account("100", dec!(0)).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let processor = store.processor.clone();
                tokio::spawn(async move {
                    processor.apply(OperationRequest::deposit("100", 10.0)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.balance("100").await, dec!(80));
        assert_eq!(store.entry_count("100").await, 8);
    }
}
