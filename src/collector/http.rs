use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;
use crate::record::{BatchResponse, MetricKey, MetricName, RecordBatch};

use super::forecast::{ForecastError, ForecastResult};
use super::series::{AggregateSnapshot, Point};
use super::store::SeriesOverview;
use super::Collector;

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    pub horizon: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OverviewResponse {
    pub series: Vec<SeriesOverview>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub group: String,
    pub metric: MetricName,
    pub snapshot: AggregateSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub group: String,
    pub metric: MetricName,
    pub points: Vec<Point>,
}

/// Collector HTTP routes.
pub fn router(collector: Arc<Collector>) -> Router {
    Router::new()
        .route("/v1/records", post(ingest_handler))
        .route("/v1/metrics", get(overview_handler))
        .route("/v1/metrics/:group/:metric/snapshot", get(snapshot_handler))
        .route("/v1/metrics/:group/:metric/history", get(history_handler))
        .route("/v1/metrics/:group/:metric/forecast", get(forecast_handler))
        .with_state(collector)
}

/// Serves the collector API on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    collector: Arc<Collector>,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("getting local address")?;
    tracing::info!(addr = %local_addr, "collector API started");

    axum::serve(listener, router(collector))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("serving collector API")
}

fn metric_key(group: String, metric: &str) -> Result<MetricKey, ApiError> {
    let metric = MetricName::from_name(metric)
        .ok_or_else(|| ApiError::not_found("unknown_metric", format!("unknown metric: {metric}")))?;
    Ok(MetricKey::new(group, metric))
}

fn unknown(key: &MetricKey) -> ApiError {
    ApiError::not_found("unknown_metric", format!("unknown metric: {key}"))
}

impl From<ForecastError> for ApiError {
    fn from(e: ForecastError) -> Self {
        let status = match e {
            ForecastError::InvalidHorizon { .. } => StatusCode::BAD_REQUEST,
            ForecastError::UnknownMetric(_) => StatusCode::NOT_FOUND,
            ForecastError::InsufficientData { .. } | ForecastError::FitFailure(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        };
        ApiError::new(status, e.kind(), e.to_string())
    }
}

/// POST /v1/records
async fn ingest_handler(
    State(collector): State<Arc<Collector>>,
    body: Result<Json<RecordBatch>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let Json(batch) = body.map_err(|e| ApiError::bad_request("invalid_body", e.body_text()))?;
    let outcomes = collector.ingest_batch(&batch.records);
    Ok(Json(BatchResponse { outcomes }))
}

/// GET /v1/metrics
async fn overview_handler(State(collector): State<Arc<Collector>>) -> Json<OverviewResponse> {
    Json(OverviewResponse {
        series: collector.store().overview(),
    })
}

/// GET /v1/metrics/:group/:metric/snapshot
async fn snapshot_handler(
    State(collector): State<Arc<Collector>>,
    Path((group, metric)): Path<(String, String)>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let key = metric_key(group, &metric)?;
    let snapshot = collector.store().snapshot(&key).ok_or_else(|| unknown(&key))?;
    Ok(Json(SnapshotResponse {
        group: key.group,
        metric: key.metric,
        snapshot,
    }))
}

/// GET /v1/metrics/:group/:metric/history?limit=N
async fn history_handler(
    State(collector): State<Arc<Collector>>,
    Path((group, metric)): Path<(String, String)>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request("invalid_query", e.body_text()))?;
    let key = metric_key(group, &metric)?;
    let points = collector
        .store()
        .history(&key, query.limit)
        .ok_or_else(|| unknown(&key))?;
    Ok(Json(HistoryResponse {
        group: key.group,
        metric: key.metric,
        points,
    }))
}

/// GET /v1/metrics/:group/:metric/forecast?horizon=N
async fn forecast_handler(
    State(collector): State<Arc<Collector>>,
    Path((group, metric)): Path<(String, String)>,
    query: Result<Query<ForecastQuery>, QueryRejection>,
) -> Result<Json<ForecastResult>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request("invalid_query", e.body_text()))?;
    let key = metric_key(group, &metric)?;
    let result = collector.forecast(key, query.horizon).await?;
    Ok(Json(result))
}
