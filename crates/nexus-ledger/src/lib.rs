//! Nexus Ledger - money movement and integrity verification
//!
//! This crate provides:
//! - `LedgerProcessor`, the two-write deposit/withdrawal state machine
//! - `IntegrityVerifier` and the background `AuditScheduler`
//! - The divergence journal for half-applied operations
//! - Sample data bootstrap and the stress run

pub mod audit;
pub mod error;
pub mod journal;
pub mod model;
pub mod processor;
pub mod seed;
pub mod stress;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use audit::{AuditConfig, AuditScheduler};
pub use error::{DivergenceCause, LedgerError, LedgerRecordStatus};
pub use journal::{DivergenceJournal, DivergenceRecord};
pub use model::{
    FailureReason, LedgerConfig, LedgerReceipt, LedgerState, OperationRequest, OperationTrace,
    ValidatedOperation,
};
pub use processor::LedgerProcessor;
pub use seed::{SeedReport, seed_sample_data};
pub use stress::{StressReport, run_stress};
pub use verifier::{
    AuditError, AuditReport, BalanceCorrection, BalanceDiscrepancy, BalanceSummary,
    CollectionCounts, ConvergenceOutcome, IntegrityVerifier, OrphanedEntry, ReconciliationReport,
    ReferenceIssue, ReferentialReport,
};
