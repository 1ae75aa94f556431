use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::bind_addr;

const NAMESPACE: &str = "epiwatch";

/// Prometheus metrics for site and collector health.
///
/// All metrics use the "epiwatch" namespace. A process registers every
/// metric regardless of role; the ones its role never touches stay at zero.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Site ===
    /// Observations submitted, by result (processed/invalid/queue_full).
    pub observations_total: CounterVec,
    /// Records waiting for acknowledgement.
    pub sync_backlog: Gauge,
    /// Delivery requests sent to the collector.
    pub delivery_attempts: Counter,
    /// Delivery requests that failed and will be retried.
    pub delivery_failures: Counter,
    /// Acknowledged records by outcome (accepted/duplicate/rejected).
    pub records_acknowledged: CounterVec,
    /// Records dropped from the queue by reason.
    pub records_dropped: CounterVec,
    /// Records per delivery request.
    pub delivery_batch_size: Histogram,

    // === Collector ===
    /// Ingested records by outcome.
    pub records_ingested: CounterVec,
    /// Rejected records by reason.
    pub records_rejected: CounterVec,
    /// Records per ingest request.
    pub ingest_batch_size: Histogram,
    /// Number of aggregated series.
    pub series_tracked: Gauge,
    /// Forecast requests by result.
    pub forecasts_total: CounterVec,
    /// Forecast fit and projection time.
    pub forecast_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Site ===
        let observations_total = CounterVec::new(
            Opts::new("observations_total", "Observations submitted by result.")
                .namespace(NAMESPACE),
            &["result"],
        )?;
        let sync_backlog = Gauge::with_opts(
            Opts::new("sync_backlog", "Records waiting for collector acknowledgement.")
                .namespace(NAMESPACE),
        )?;
        let delivery_attempts = Counter::with_opts(
            Opts::new(
                "delivery_attempts_total",
                "Delivery requests sent to the collector.",
            )
            .namespace(NAMESPACE),
        )?;
        let delivery_failures = Counter::with_opts(
            Opts::new(
                "delivery_failures_total",
                "Delivery requests that failed and were retried.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_acknowledged = CounterVec::new(
            Opts::new(
                "records_acknowledged_total",
                "Records acknowledged by the collector by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Records dropped from the delivery queue by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let delivery_batch_size = Histogram::with_opts(
            HistogramOpts::new("delivery_batch_size", "Records per delivery request.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 4.0, 16.0, 64.0, 256.0, 1024.0]),
        )?;

        // === Collector ===
        let records_ingested = CounterVec::new(
            Opts::new("records_ingested_total", "Ingested records by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let records_rejected = CounterVec::new(
            Opts::new("records_rejected_total", "Rejected records by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let ingest_batch_size = Histogram::with_opts(
            HistogramOpts::new("ingest_batch_size", "Records per ingest request.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 4.0, 16.0, 64.0, 256.0, 1024.0]),
        )?;
        let series_tracked = Gauge::with_opts(
            Opts::new("series_tracked", "Number of aggregated series.").namespace(NAMESPACE),
        )?;
        let forecasts_total = CounterVec::new(
            Opts::new("forecasts_total", "Forecast requests by result.").namespace(NAMESPACE),
            &["result"],
        )?;
        let forecast_duration = Histogram::with_opts(
            HistogramOpts::new(
                "forecast_duration_seconds",
                "Time to fit and project a forecast.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        // Site
        registry.register(Box::new(observations_total.clone()))?;
        registry.register(Box::new(sync_backlog.clone()))?;
        registry.register(Box::new(delivery_attempts.clone()))?;
        registry.register(Box::new(delivery_failures.clone()))?;
        registry.register(Box::new(records_acknowledged.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(delivery_batch_size.clone()))?;

        // Collector
        registry.register(Box::new(records_ingested.clone()))?;
        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(ingest_batch_size.clone()))?;
        registry.register(Box::new(series_tracked.clone()))?;
        registry.register(Box::new(forecasts_total.clone()))?;
        registry.register(Box::new(forecast_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            observations_total,
            sync_backlog,
            delivery_attempts,
            delivery_failures,
            records_acknowledged,
            records_dropped,
            delivery_batch_size,
            records_ingested,
            records_rejected,
            ingest_batch_size,
            series_tracked,
            forecasts_total,
            forecast_duration,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = bind_addr(addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_namespaced() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.sync_backlog.set(3.0);
        metrics
            .records_ingested
            .with_label_values(&["accepted"])
            .inc();

        let text = metrics.encode().expect("encode");
        assert!(text.contains("epiwatch_sync_backlog 3"));
        assert!(text.contains("epiwatch_records_ingested_total{outcome=\"accepted\"} 1"));
    }

    #[test]
    fn test_instances_have_independent_registries() {
        let a = HealthMetrics::new("").expect("metrics");
        let b = HealthMetrics::new("").expect("metrics");
        a.delivery_attempts.inc();
        assert_eq!(a.delivery_attempts.get(), 1.0);
        assert_eq!(b.delivery_attempts.get(), 0.0);
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_metrics() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").expect("reserved bind");
        let addr = reserved.local_addr().expect("reserved addr");
        drop(reserved);

        let metrics = HealthMetrics::new(&addr.to_string()).expect("metrics");
        metrics.start().await.expect("start");

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("healthz")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(body.contains("epiwatch_delivery_attempts_total"));

        metrics.stop().await.expect("stop");
    }
}
