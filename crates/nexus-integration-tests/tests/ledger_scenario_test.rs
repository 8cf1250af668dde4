// Integration tests for deposits and withdrawals against the sample data
// Covers the happy path, rejected withdrawals and unknown accounts

mod common;

use common::Cluster;
use nexus_ledger::{LedgerError, LedgerState, OperationRequest};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_withdraw_then_overdraw() {
    let cluster = Cluster::seeded("rsScenario").await;
    assert_eq!(cluster.balance("100").await, dec!(5000));
    let entries_before = cluster.entry_count("100").await;

    let receipt = cluster
        .processor
        .apply(OperationRequest::withdrawal("100", 500.0).with_branch("chametla"))
        .await
        .unwrap();
    assert_eq!(receipt.previous_balance, dec!(5000));
    assert_eq!(receipt.new_balance, dec!(4500));
    assert_eq!(receipt.trace.last(), Some(LedgerState::Committed));
    assert_eq!(cluster.balance("100").await, dec!(4500));
    assert_eq!(cluster.entry_count("100").await, entries_before + 1);

    let err = cluster
        .processor
        .apply(OperationRequest::withdrawal("100", 10000.0))
        .await
        .unwrap_err();
    match &err {
        LedgerError::InsufficientFunds {
            available,
            requested,
            ..
        } => {
            assert_eq!(*available, dec!(4500));
            assert_eq!(*requested, dec!(10000));
        }
        other => panic!("expected insufficient funds, got {other}"),
    }
    assert!(err.is_retry_safe());
    assert_eq!(cluster.balance("100").await, dec!(4500));
    assert_eq!(cluster.entry_count("100").await, entries_before + 1);

    cluster.shutdown();
}

#[tokio::test]
async fn test_unknown_account_has_no_side_effects() {
    let cluster = Cluster::seeded("rsUnknown").await;
    let total_before = cluster.total_entries().await;

    let err = cluster
        .processor
        .apply(OperationRequest::deposit("999", 100.0))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::AccountNotFound(ref n) if n == "999"));
    assert_eq!(err.failed_after(), Some(LedgerState::Validated));
    assert_eq!(cluster.total_entries().await, total_before);
    assert!(cluster.processor.journal().is_empty());

    cluster.shutdown();
}

#[tokio::test]
async fn test_sequential_operations_fold() {
    let cluster = Cluster::seeded("rsSequential").await;
    let operations = [
        OperationRequest::deposit("103", 120.50),
        OperationRequest::withdrawal("103", 20.25),
        OperationRequest::deposit("103", 0.75),
        OperationRequest::withdrawal("103", 1000.0),
    ];

    for request in operations {
        cluster.processor.apply(request).await.unwrap();
    }

    // 4100 + 120.50 - 20.25 + 0.75 - 1000
    assert_eq!(cluster.balance("103").await, dec!(3201.00));
    let report = cluster.verifier.reconcile_balances().await.unwrap();
    assert!(report.is_consistent());

    cluster.shutdown();
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_reading() {
    let cluster = Cluster::seeded("rsInvalid").await;

    for request in [
        OperationRequest::deposit("100", 0.0),
        OperationRequest::deposit("100", -5.0),
        OperationRequest::deposit("100", 1.005),
        OperationRequest::new("100", "transferencia", 10.0),
        OperationRequest::deposit("", 10.0),
    ] {
        let err = cluster.processor.apply(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)), "{err}");
        assert_eq!(err.failed_after(), None);
    }
    assert_eq!(cluster.balance("100").await, dec!(5000));

    cluster.shutdown();
}
