//! Integrity verification endpoints

use std::time::Duration;

use actix_web::{HttpResponse, Responder, get, http::StatusCode, post, web};
use nexus_common::error::RESOURCE_NOT_FOUND;
use nexus_ledger::AuditError;
use serde::Deserialize;
use tracing::info;

use crate::model::{AppState, Result};

/// Upper bound for `timeout_ms` on the replication check
const MAX_CONVERGENCE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
pub struct ConvergenceParam {
    pub timeout_ms: Option<u64>,
}

fn audit_error_response(error: AuditError) -> HttpResponse {
    let status = match &error {
        AuditError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        AuditError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        AuditError::CorrectionConflict(_) | AuditError::NegativeReplay { .. } => {
            StatusCode::CONFLICT
        }
    };
    Result::<()>::http_error(status, error.error_code(), error.to_string(), ())
}

/// GET /audit/integrity
#[get("/integrity")]
pub async fn integrity(data: web::Data<AppState>) -> impl Responder {
    match data.verifier.check_referential_integrity().await {
        Ok(report) => Result::<()>::http_success(report),
        Err(e) => audit_error_response(e),
    }
}

/// GET /audit/balances
#[get("/balances")]
pub async fn balances(data: web::Data<AppState>) -> impl Responder {
    match data.verifier.check_balance_consistency().await {
        Ok(summary) => Result::<()>::http_success(summary),
        Err(e) => audit_error_response(e),
    }
}

/// GET /audit/reconciliation
#[get("/reconciliation")]
pub async fn reconciliation(data: web::Data<AppState>) -> impl Responder {
    match data.verifier.reconcile_balances().await {
        Ok(report) => Result::<()>::http_success(report),
        Err(e) => audit_error_response(e),
    }
}

/// GET /audit/replication?timeout_ms=
#[get("/replication")]
pub async fn replication(
    data: web::Data<AppState>,
    params: web::Query<ConvergenceParam>,
) -> impl Responder {
    let timeout = params
        .timeout_ms
        .map(|ms| Duration::from_millis(ms.min(MAX_CONVERGENCE_TIMEOUT_MS)))
        .unwrap_or_else(|| data.convergence_timeout());

    let expected = match data.verifier.expected_counts().await {
        Ok(expected) => expected,
        Err(e) => return audit_error_response(e),
    };
    let outcome = data
        .verifier
        .check_replica_convergence(&expected, timeout)
        .await;
    Result::<()>::http_success(outcome)
}

/// GET /audit/divergences
#[get("/divergences")]
pub async fn divergences(data: web::Data<AppState>) -> impl Responder {
    Result::<()>::http_success(data.processor.journal().records())
}

/// GET /audit/report
#[get("/report")]
pub async fn last_report(data: web::Data<AppState>) -> impl Responder {
    match data.scheduler.last_report() {
        Some(report) => Result::<()>::http_success(report),
        None => Result::<()>::http_error(
            StatusCode::NOT_FOUND,
            RESOURCE_NOT_FOUND,
            "no audit has completed yet".to_string(),
            (),
        ),
    }
}

/// POST /audit/accounts/{cuenta}/correct
#[post("/accounts/{cuenta}/correct")]
pub async fn correct_balance(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let account_number = path.into_inner();
    match data.verifier.correct_balance(&account_number).await {
        Ok(correction) => {
            if correction.changed {
                info!(
                    "Balance of account {} corrected from {} to {}",
                    account_number, correction.previous_balance, correction.corrected_balance
                );
            }
            Result::<()>::http_success(correction)
        }
        Err(e) => audit_error_response(e),
    }
}

pub fn routes() -> actix_web::Scope {
    web::scope("/audit")
        .service(integrity)
        .service(balances)
        .service(reconciliation)
        .service(replication)
        .service(divergences)
        .service(last_report)
        .service(correct_balance)
}
