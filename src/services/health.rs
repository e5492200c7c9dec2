//! Health check HTTP server
//!
//! Liveness and readiness probes for process supervision, plus the engine
//! counters as JSON and in Prometheus text format.

use crate::services::{EngineStats, StatsSnapshot};
use crate::store::LedgerStore;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub store: Arc<dyn LedgerStore>,
    pub stats: Arc<EngineStats>,
}

impl HealthState {
    pub fn new(store: Arc<dyn LedgerStore>, stats: Arc<EngineStats>) -> Self {
        Self {
            started_at: Utc::now(),
            store,
            stats,
        }
    }

    /// Get overall health status
    pub async fn get_health(&self) -> HealthResponse {
        let ledger = match self.store.ping().await {
            Ok(()) => ComponentHealth {
                name: "ledger".to_string(),
                status: HealthStatus::Healthy,
                message: None,
            },
            Err(e) => {
                warn!("Ledger health check failed: {}", e);
                ComponentHealth {
                    name: "ledger".to_string(),
                    status: HealthStatus::Unhealthy,
                    message: Some(e.to_string()),
                }
            }
        };

        HealthResponse {
            status: ledger.status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            components: vec![ledger],
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    addr: String,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, addr: impl Into<String>) -> Self {
        Self {
            state,
            addr: addr.into(),
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("Starting health server on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::LoyaltyError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

/// Full health check endpoint
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness probe - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn stats_handler(State(state): State<Arc<HealthState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot().await)
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.stats.prometheus(),
    )
}
