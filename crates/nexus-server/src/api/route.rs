use actix_web::web;

use super::{admin, audit, health, ledger};

/// Register every endpoint on `cfg`
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health)
        .service(ledger::routes())
        .service(audit::routes())
        .service(admin::routes());
}
