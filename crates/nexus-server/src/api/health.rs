//! Health endpoint

use actix_web::{HttpResponse, Responder, get, web};
use nexus_core::{HealthReport, HealthStatus};
use serde::Serialize;

use crate::model::AppState;

#[derive(Debug, Serialize)]
pub struct ReplicaSetHealth {
    pub name: String,
    pub primario: Option<String>,
    pub miembros_activos: usize,
    pub total_miembros: usize,
}

/// Body of `GET /health`, shaped for load balancer probes
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub primary_present: bool,
    pub healthy_node_count: usize,
    pub total_node_count: usize,
    pub replica_set: ReplicaSetHealth,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            status: report.status.as_str(),
            primary_present: report.primary_present,
            healthy_node_count: report.healthy_node_count,
            total_node_count: report.total_node_count,
            replica_set: ReplicaSetHealth {
                name: report.replica_set,
                primario: report.primary,
                miembros_activos: report.healthy_node_count,
                total_miembros: report.total_node_count,
            },
        }
    }
}

/// GET /health
#[get("/health")]
pub async fn health(data: web::Data<AppState>) -> impl Responder {
    let report = data.gateway.monitor().health_report();
    let unavailable = report.status == HealthStatus::Unavailable;
    let body = HealthResponse::from(report);

    if unavailable {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}
