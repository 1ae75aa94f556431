use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;

use super::{Site, SiteStats, SubmitError, Submission};

/// `POST /v1/observations` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationRequest {
    pub symptoms: Vec<String>,
    pub severity: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `POST /v1/sync` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub backlog: usize,
}

/// Site HTTP routes.
pub fn router(site: Arc<Site>) -> Router {
    Router::new()
        .route("/v1/observations", post(submit_handler))
        .route("/v1/stats", get(stats_handler))
        .route("/v1/sync", post(sync_handler))
        .with_state(site)
}

/// Serves the site API on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, site: Arc<Site>, cancel: CancellationToken) -> Result<()> {
    let local_addr = listener.local_addr().context("getting local address")?;
    tracing::info!(addr = %local_addr, site = %site.site_id(), "site API started");

    axum::serve(listener, router(site))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("serving site API")
}

/// POST /v1/observations
async fn submit_handler(
    State(site): State<Arc<Site>>,
    body: Result<Json<ObservationRequest>, JsonRejection>,
) -> Result<Json<Submission>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request("invalid_body", e.body_text()))?;

    let result = match req.timestamp {
        Some(ts) => site.submit_observation_at(&req.symptoms, req.severity, ts),
        None => site.submit_observation(&req.symptoms, req.severity),
    };

    result.map(Json).map_err(|e| match e {
        SubmitError::Validation(_) => ApiError::unprocessable("validation", e.to_string()),
        SubmitError::Privacy(_) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "privacy", e.to_string())
        }
        SubmitError::QueueFull(_) => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "queue_full", e.to_string())
        }
    })
}

/// GET /v1/stats
async fn stats_handler(State(site): State<Arc<Site>>) -> Json<SiteStats> {
    Json(site.stats())
}

/// POST /v1/sync - wakes the delivery loop.
async fn sync_handler(State(site): State<Arc<Site>>) -> (StatusCode, Json<SyncResponse>) {
    site.flush_now();
    (
        StatusCode::ACCEPTED,
        Json(SyncResponse {
            backlog: site.sync().backlog(),
        }),
    )
}
