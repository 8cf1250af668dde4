// Stress run: rounds of concurrent operations over the sample accounts

use std::time::Instant;

use futures::future::join_all;
use nexus_common::model::TransactionKind;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::error::LedgerError;
use crate::model::OperationRequest;
use crate::processor::LedgerProcessor;

pub const STRESS_BRANCHES: [&str; 3] = ["chametla", "cdmx", "centenario"];

/// Sample account range `100..110`
pub const STRESS_FIRST_ACCOUNT: u32 = 100;
pub const STRESS_ACCOUNT_COUNT: u32 = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressReport {
    pub rounds: u32,
    pub attempted: usize,
    pub committed: usize,
    /// Insufficient funds and other rejections where nothing was written
    pub rejected: usize,
    /// Ledger entry written but balance not updated
    pub diverged: usize,
    pub failed: usize,
    /// Balance updates that needed more than one conditional write
    pub contended: usize,
    pub duration_ms: u64,
}

fn operation(account: u32) -> OperationRequest {
    let mut rng = rand::rng();
    let kind = if rng.random_bool(0.5) {
        TransactionKind::Deposit
    } else {
        TransactionKind::Withdrawal
    };
    let branch = STRESS_BRANCHES[rng.random_range(0..STRESS_BRANCHES.len())];
    OperationRequest::new(&account.to_string(), kind.as_str(), f64::from(account) * 1.5)
        .with_branch(branch)
}

/// Each round sends one operation per sample account, all at once; account
/// `n` moves `n * 1.5` in a random direction from a random branch
pub async fn run_stress(processor: &LedgerProcessor, rounds: u32) -> StressReport {
    let started = Instant::now();
    let mut report = StressReport {
        rounds,
        ..Default::default()
    };

    for _ in 0..rounds {
        let results = join_all(
            (STRESS_FIRST_ACCOUNT..STRESS_FIRST_ACCOUNT + STRESS_ACCOUNT_COUNT)
                .map(|account| processor.apply(operation(account))),
        )
        .await;

        for result in results {
            report.attempted += 1;
            match result {
                Ok(receipt) => {
                    report.committed += 1;
                    if receipt.balance_update_attempts > 1 {
                        report.contended += 1;
                    }
                }
                Err(LedgerError::BalanceUpdateFailed { .. }) => report.diverged += 1,
                Err(e) if e.is_retry_safe() => report.rejected += 1,
                Err(_) => report.failed += 1,
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Stress run finished: {} operations in {}ms, {} committed, {} rejected, {} diverged, {} failed",
        report.attempted,
        report.duration_ms,
        report.committed,
        report.rejected,
        report.diverged,
        report.failed
    );
    report
}
