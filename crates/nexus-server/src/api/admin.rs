//! Topology inspection and failover drills

use actix_web::{HttpResponse, Responder, get, http::StatusCode, post, web};
use nexus_common::StoreError;
use nexus_common::error::{DRILL_UNSUPPORTED, RESOURCE_NOT_FOUND, STORAGE_UNAVAILABLE};
use nexus_core::TopologySnapshot;
use nexus_ledger::{StressReport, run_stress};
use nexus_persistence::{MemoryReplicaSet, PoolStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{AppState, Result};

const DEFAULT_STRESS_ROUNDS: u32 = 10;
const MAX_STRESS_ROUNDS: u32 = 1000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyResponse {
    pub topology: TopologySnapshot,
    pub pool: PoolStatus,
    pub monitor_running: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillResponse {
    pub action: &'static str,
    pub address: String,
    /// Primary after the drill, once the monitor has refreshed
    pub primary: Option<String>,
    pub topology: TopologySnapshot,
}

#[derive(Debug, Deserialize)]
pub struct StressParam {
    pub rounds: Option<u32>,
}

fn drill_unsupported() -> HttpResponse {
    Result::<()>::http_error(
        StatusCode::NOT_IMPLEMENTED,
        DRILL_UNSUPPORTED,
        "the server is not running against the in-memory replica set".to_string(),
        (),
    )
}

fn drill_error_response(error: StoreError) -> HttpResponse {
    Result::<()>::http_error(
        StatusCode::CONFLICT,
        STORAGE_UNAVAILABLE,
        error.to_string(),
        (),
    )
}

/// Run `action` against the demo replica set, then refresh the monitor so
/// the response reflects the new roles
async fn run_drill<F, T>(
    data: &AppState,
    action: &'static str,
    address: String,
    drill: F,
) -> HttpResponse
where
    F: FnOnce(&MemoryReplicaSet, &str) -> std::result::Result<T, StoreError>,
{
    let Some(replica_set) = data.replica_set.as_ref() else {
        return drill_unsupported();
    };
    if !replica_set.addresses().contains(&address) {
        return Result::<()>::http_error(
            StatusCode::NOT_FOUND,
            RESOURCE_NOT_FOUND,
            format!("'{}' is not a member of the replica set", address),
            (),
        );
    }
    if let Err(e) = drill(replica_set, &address) {
        warn!("Failover drill '{}' on {} failed: {}", action, address, e);
        return drill_error_response(e);
    }

    let snapshot = data.gateway.monitor().refresh().await;
    let primary = snapshot.primary().map(|n| n.address.clone());
    info!(
        "Failover drill '{}' on {} done, primary is now {:?}",
        action, address, primary
    );
    Result::<()>::http_success(DrillResponse {
        action,
        address,
        primary,
        topology: snapshot,
    })
}

/// GET /admin/topology
#[get("/topology")]
pub async fn topology(data: web::Data<AppState>) -> impl Responder {
    let monitor = data.gateway.monitor();
    Result::<()>::http_success(TopologyResponse {
        topology: monitor.current_topology(),
        pool: data.gateway.pool_status(),
        monitor_running: monitor.is_running(),
    })
}

/// POST /admin/nodes/{address}/stop
#[post("/nodes/{address}/stop")]
pub async fn stop_node(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    run_drill(&data, "stop", path.into_inner(), |set, address| {
        set.stop_node(address)
    })
    .await
}

/// POST /admin/nodes/{address}/start
#[post("/nodes/{address}/start")]
pub async fn start_node(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    run_drill(&data, "start", path.into_inner(), |set, address| {
        set.start_node(address)
    })
    .await
}

/// POST /admin/nodes/{address}/step-down
#[post("/nodes/{address}/step-down")]
pub async fn step_down(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    run_drill(&data, "step-down", path.into_inner(), |set, address| {
        set.step_down(address)
    })
    .await
}

/// POST /admin/stress?rounds=
#[post("/stress")]
pub async fn stress(data: web::Data<AppState>, params: web::Query<StressParam>) -> impl Responder {
    let rounds = params
        .rounds
        .unwrap_or(DEFAULT_STRESS_ROUNDS)
        .clamp(1, MAX_STRESS_ROUNDS);
    let report: StressReport = run_stress(&data.processor, rounds).await;
    Result::<()>::http_success(report)
}

pub fn routes() -> actix_web::Scope {
    web::scope("/admin")
        .service(topology)
        .service(stop_node)
        .service(start_node)
        .service(step_down)
        .service(stress)
}
