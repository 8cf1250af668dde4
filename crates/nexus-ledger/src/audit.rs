//! Audit scheduler - background task running the integrity verifier
//!
//! Runs a full audit every interval and keeps the latest report for the
//! HTTP surface. Findings are logged at warn level; nothing is repaired.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use nexus_core::Configuration;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::verifier::{AuditError, AuditReport, ConvergenceOutcome, IntegrityVerifier};

#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Time between two audits (default: 60 seconds)
    pub interval: Duration,
    pub convergence_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(60000),
            convergence_timeout: Duration::from_millis(2000),
        }
    }
}

impl AuditConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            enabled: configuration.audit_enabled(),
            interval: Duration::from_millis(configuration.audit_interval_ms()),
            convergence_timeout: Duration::from_millis(configuration.convergence_timeout_ms()),
        }
    }
}

#[derive(Clone)]
pub struct AuditScheduler {
    verifier: IntegrityVerifier,
    config: AuditConfig,
    last_report: Arc<RwLock<Option<AuditReport>>>,
    runs: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
}

impl AuditScheduler {
    pub fn new(verifier: IntegrityVerifier, config: AuditConfig) -> Self {
        Self {
            verifier,
            config,
            last_report: Arc::new(RwLock::new(None)),
            runs: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn last_report(&self) -> Option<AuditReport> {
        self.last_report.read().clone()
    }

    /// Audits completed since start, successful or not
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the audit loop; does nothing when disabled or already running
    pub fn start(&self) {
        if !self.config.enabled {
            info!("Audit scheduler disabled");
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!(
            "Audit scheduler started with interval: {}ms",
            self.config.interval.as_millis()
        );
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.audit_loop().await;
        });
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop_signal.notify_one();
            info!("Stopped audit scheduler");
        }
    }

    async fn audit_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.stop_signal.notified() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.run_once().await {
                error!("Scheduled audit failed: {}", e);
            }
        }
    }

    /// Run one audit now and keep its report
    pub async fn run_once(&self) -> Result<AuditReport, AuditError> {
        let result = self.verifier.run_audit(self.config.convergence_timeout).await;
        self.runs.fetch_add(1, Ordering::SeqCst);

        let report = result?;
        Self::log_findings(&report);
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    fn log_findings(report: &AuditReport) {
        if report.is_clean() {
            debug!(
                "Audit clean: {} accounts, {} ledger entries in {}ms",
                report.reconciliation.accounts_checked,
                report.reconciliation.transactions_replayed,
                report.duration_ms
            );
            return;
        }

        for issue in &report.referential.accounts_without_owner {
            warn!(
                "Audit: account {} references owner '{}' matching {} customers",
                issue.record_id, issue.reference, issue.matches
            );
        }
        for issue in &report.referential.transactions_without_account {
            warn!(
                "Audit: transaction {} references account '{}' matching {} accounts",
                issue.record_id, issue.reference, issue.matches
            );
        }
        for account in &report.balances.negative_accounts {
            warn!("Audit: account {} holds a negative balance", account);
        }
        for d in &report.reconciliation.discrepancies {
            warn!(
                "Audit: account {} stores {} but replays to {}",
                d.account_number, d.stored_balance, d.replayed_balance
            );
        }
        if let ConvergenceOutcome::Diverged { details, .. } = &report.convergence {
            warn!("Audit: replicas not converged: {}", details.join("; "));
        }
        warn!("Audit finished with {} findings", report.finding_count());
    }
}
