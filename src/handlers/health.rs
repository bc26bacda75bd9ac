use actix_web::{HttpResponse, Responder, web};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::connection::{DatabasePools, verify_connection};

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    status: String,
    database: String,
    timestamp: String,
}

/// Liveness plus database reachability.
pub async fn health_check(pools: web::Data<DatabasePools>) -> impl Responder {
    match verify_connection(&pools.primary).await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ok".to_string(),
            database: "connected".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }),
        Err(e) => {
            log::error!("Health check failed to reach the database: {}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "degraded".to_string(),
                database: "unreachable".to_string(),
                timestamp: Utc::now().to_rfc3339(),
            })
        }
    }
}
