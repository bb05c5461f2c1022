//! HTTP surface: health, chain table, approval scans, prometheus metrics.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ScanError;
use crate::metrics::Metrics;
use crate::rpc_rotator::RpcRotator;
use crate::scanner::session::{ScanOutcome, ScanSession};

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<ScanSession>,
    pub rotator: Arc<RpcRotator>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    rpc_healthy: usize,
    rpc_total: usize,
}

#[derive(Debug, Serialize)]
struct ChainSummary {
    key: String,
    name: String,
    chain_id: u64,
    scanning_supported: bool,
    batch_revoke: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

fn error_response(status: StatusCode, error: String, detail: String) -> Response {
    (status, Json(ErrorBody { error, detail })).into_response()
}

fn scan_error_status(e: &ScanError) -> StatusCode {
    match e {
        ScanError::UnsupportedChain(_) | ScanError::ScanningDisabled(_) => StatusCode::BAD_REQUEST,
        ScanError::QueryFailure { .. }
        | ScanError::Transport(_)
        | ScanError::MalformedResponse(_)
        | ScanError::Rpc(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    let (rpc_healthy, rpc_total) = state.rotator.health_summary().await;
    Json(HealthBody {
        status: "ok",
        rpc_healthy,
        rpc_total,
    })
}

async fn chains(State(state): State<AppState>) -> Json<Vec<ChainSummary>> {
    Json(
        state
            .session
            .chains()
            .iter()
            .map(|c| ChainSummary {
                key: c.key.clone(),
                name: c.name.clone(),
                chain_id: c.chain_id,
                scanning_supported: c.scanning_supported,
                batch_revoke: c.delegate.is_some(),
            })
            .collect(),
    )
}

async fn approvals(
    State(state): State<AppState>,
    Path((chain, address)): Path<(String, String)>,
) -> Response {
    let owner: Address = match address.parse() {
        Ok(owner) => owner,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid address: {}", address),
                e.to_string(),
            )
        }
    };

    match state.session.scan(&chain, owner).await {
        Ok(ScanOutcome::Completed(report)) => Json(report).into_response(),
        Ok(ScanOutcome::AlreadyInFlight) => error_response(
            StatusCode::CONFLICT,
            "A scan for this address is already running".to_string(),
            format!("{} {:?}", chain, owner),
        ),
        Err(e) => {
            let status = scan_error_status(&e);
            if status.is_server_error() {
                warn!("[HTTP] scan {} {:?} -> {}: {}", chain, owner, status, e);
            }
            error_response(status, e.user_message(), e.to_string())
        }
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chains", get(chains))
        .route("/approvals/:chain/:address", get(approvals))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
