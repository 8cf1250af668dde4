//! Money movement endpoint

use actix_web::{HttpResponse, Responder, http::StatusCode, post, web};
use nexus_common::model::LedgerEntry;
use nexus_ledger::{LedgerError, LedgerRecordStatus, LedgerState, OperationRequest};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{AppState, Result};

#[derive(Debug, Deserialize)]
pub struct TransactionBody {
    pub tipo: String,
    pub monto: f64,
    #[serde(default)]
    pub sucursal: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub cuenta: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub saldo: Decimal,
    pub transaccion: LedgerEntry,
    /// Conditional balance updates needed
    pub intentos: u32,
}

/// What the caller needs to decide whether resubmitting is safe
#[derive(Debug, Serialize)]
pub struct LedgerFailure {
    pub cuenta: String,
    pub retry_safe: bool,
    pub ledger_record: LedgerRecordStatus,
    pub ledger_record_written: bool,
    pub failed_after: Option<LedgerState>,
    pub trace: Vec<LedgerState>,
}

pub fn status_for(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        LedgerError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Unavailable(_) | LedgerError::LedgerWriteFailed { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LedgerError::BalanceUpdateFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn ledger_error_response(account_number: &str, error: LedgerError) -> HttpResponse {
    let failure = LedgerFailure {
        cuenta: account_number.to_string(),
        retry_safe: error.is_retry_safe(),
        ledger_record: error.ledger_record_status(),
        ledger_record_written: error.ledger_record_written(),
        failed_after: error.failed_after(),
        trace: error.trace().states().to_vec(),
    };
    Result::<LedgerFailure>::http_error(
        status_for(&error),
        error.error_code(),
        error.to_string(),
        failure,
    )
}

/// POST /accounts/{cuenta}/transactions
#[post("/{cuenta}/transactions")]
pub async fn apply_transaction(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TransactionBody>,
) -> impl Responder {
    let account_number = path.into_inner();
    let body = body.into_inner();

    let mut request = OperationRequest::new(&account_number, &body.tipo, body.monto);
    if let Some(branch) = body.sucursal.as_deref() {
        request = request.with_branch(branch);
    }

    match data.processor.apply(request).await {
        Ok(receipt) => Result::<TransactionResponse>::http_success(TransactionResponse {
            cuenta: receipt.account_number,
            saldo: receipt.new_balance,
            transaccion: receipt.entry,
            intentos: receipt.balance_update_attempts,
        }),
        Err(e) => {
            if !e.is_retry_safe() {
                warn!("Operation on account {} needs verification: {}", account_number, e);
            }
            ledger_error_response(&account_number, e)
        }
    }
}

pub fn routes() -> actix_web::Scope {
    web::scope("/accounts").service(apply_transaction)
}
