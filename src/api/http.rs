//! HTTP API Server
//!
//! Read-only view of this candidate's election state.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::election::{ElectionEngine, ElectionState};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Election engine being reported on
    pub engine: Arc<ElectionEngine>,
    /// Namespace the election runs in
    pub namespace: String,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, engine: Arc<ElectionEngine>, namespace: String) -> Self {
        Self {
            config,
            state: Arc::new(AppState { engine, namespace }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub identity: String,
    pub namespace: String,
    pub lease_name: String,
    pub state: ElectionState,
    pub is_leader: bool,
    pub holder: Option<String>,
    pub leader_transitions: u64,
    pub last_renewal: Option<DateTime<Utc>>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub identity: String,
    pub is_leader: bool,
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot().await;

    Json(StatusResponse {
        identity: snapshot.identity,
        namespace: state.namespace.clone(),
        lease_name: state.engine.config().lease_name.clone(),
        is_leader: snapshot.state == ElectionState::Leader,
        state: snapshot.state,
        holder: snapshot.holder,
        leader_transitions: snapshot.leader_transitions,
        last_renewal: snapshot.last_renewal,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        identity: state.engine.identity().to_string(),
        is_leader: state.engine.state().await == ElectionState::Leader,
    })
}
