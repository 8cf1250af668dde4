// Integration tests for concurrent operations on shared accounts
// The conditional balance update must never lose a concurrent change

mod common;

use common::Cluster;
use futures::future::join_all;
use nexus_ledger::{LedgerError, OperationRequest, run_stress};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deposits_all_land() {
    let cluster = Cluster::seeded("rsDeposits").await;
    let entries_before = cluster.entry_count("105").await;

    let results = join_all(
        (0..20).map(|_| cluster.processor.apply(OperationRequest::deposit("105", 10.0))),
    )
    .await;

    for result in &results {
        assert!(result.is_ok(), "{:?}", result.as_ref().err());
    }
    assert_eq!(cluster.balance("105").await, dec!(3200));
    assert_eq!(cluster.entry_count("105").await, entries_before + 20);
    assert!(cluster.processor.journal().is_empty());

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_never_overdraw() {
    let cluster = Cluster::seeded("rsWithdrawals").await;

    // Account 107 holds 2000, only four of these fit
    let results = join_all(
        (0..10).map(|_| cluster.processor.apply(OperationRequest::withdrawal("107", 500.0))),
    )
    .await;

    let committed = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count();
    let diverged: Vec<&LedgerError> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .filter(|e| e.ledger_record_written())
        .collect();

    // A withdrawal that lost the race after its entry was written shows up
    // as a divergence, never as a negative balance
    assert_eq!(committed + rejected + diverged.len(), 10);
    assert_eq!(committed, 4);
    let balance = cluster.balance("107").await;
    assert_eq!(balance, Decimal::ZERO);
    assert_eq!(cluster.processor.journal().len(), diverged.len());

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_operations_across_accounts_reconcile() {
    let cluster = Cluster::seeded("rsMixed").await;

    let report = run_stress(&cluster.processor, 5).await;
    assert_eq!(report.attempted, 50);
    assert_eq!(report.failed, 0);

    let reconciliation = cluster.verifier.reconcile_balances().await.unwrap();
    assert_eq!(
        reconciliation.discrepancies.len(),
        report.diverged,
        "{:?}",
        reconciliation.discrepancies
    );
    let summary = cluster.verifier.check_balance_consistency().await.unwrap();
    assert!(summary.negative_accounts.is_empty());

    cluster.shutdown();
}
