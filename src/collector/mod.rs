//! Collector role: ingests records from sites, keeps aggregated series and
//! forecasts them on demand.

pub mod forecast;
pub mod http;
pub mod series;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

use crate::config::CollectorConfig;
use crate::export::health::HealthMetrics;
use crate::record::{AnonymizedRecord, MetricKey, RecordOutcome};

use self::forecast::{ForecastEngine, ForecastError, ForecastResult};
use self::store::{AggregationStore, IngestOutcome, StoreSettings};

/// Collector service state shared by the HTTP handlers.
pub struct Collector {
    store: Arc<AggregationStore>,
    engine: Arc<ForecastEngine>,
    metrics: Arc<HealthMetrics>,
}

impl Collector {
    pub fn new(cfg: &CollectorConfig, metrics: Arc<HealthMetrics>) -> Self {
        Self {
            store: Arc::new(AggregationStore::new(StoreSettings::from(cfg))),
            engine: Arc::new(ForecastEngine::new(cfg.forecast.clone())),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    pub fn engine(&self) -> &ForecastEngine {
        &self.engine
    }

    /// Ingests a batch and returns the wire outcome of every record, in
    /// order. One bad record never affects the rest.
    pub fn ingest_batch(&self, records: &[AnonymizedRecord]) -> Vec<RecordOutcome> {
        self.metrics.ingest_batch_size.observe(records.len() as f64);

        let outcomes = self.store.ingest_batch(records);

        for (record, outcome) in records.iter().zip(&outcomes) {
            self.metrics
                .records_ingested
                .with_label_values(&[outcome.as_str()])
                .inc();
            if let IngestOutcome::Rejected(reason) = outcome {
                self.metrics
                    .records_rejected
                    .with_label_values(&[reason.as_str()])
                    .inc();
                tracing::warn!(
                    site = %record.site_id,
                    digest = %record.digest,
                    reason = reason.as_str(),
                    "record rejected",
                );
            }
        }
        self.metrics.series_tracked.set(self.store.len() as f64);

        tracing::debug!(records = records.len(), "ingested batch");

        outcomes.into_iter().map(RecordOutcome::from).collect()
    }

    /// Forecasts `key` on the blocking pool over a copy of its series.
    pub async fn forecast(
        &self,
        key: MetricKey,
        horizon: Option<usize>,
    ) -> Result<ForecastResult, ForecastError> {
        let result = self.forecast_inner(key, horizon).await;

        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.metrics.forecasts_total.with_label_values(&[label]).inc();

        result
    }

    async fn forecast_inner(
        &self,
        key: MetricKey,
        horizon: Option<usize>,
    ) -> Result<ForecastResult, ForecastError> {
        let horizon = horizon.unwrap_or(self.engine.config().default_horizon);
        let points = self
            .store
            .series_copy(&key)
            .ok_or_else(|| ForecastError::UnknownMetric(key.to_string()))?;

        let engine = Arc::clone(&self.engine);
        let started = Instant::now();

        let result = tokio::task::spawn_blocking(move || engine.forecast(&key, &points, horizon))
            .await
            .map_err(|e| ForecastError::FitFailure(format!("forecast task failed: {e}")))?;

        self.metrics
            .forecast_duration
            .observe(started.elapsed().as_secs_f64());

        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::privacy::digest::digest;
    use crate::record::{MetricName, RejectReason};

    fn collector() -> Collector {
        Collector::new(
            &CollectorConfig::default(),
            Arc::new(HealthMetrics::new("").expect("metrics")),
        )
    }

    fn records(n: i64) -> Vec<AnonymizedRecord> {
        let start = Utc::now() - ChronoDuration::hours(1);
        (0..n)
            .map(|i| AnonymizedRecord {
                site_id: "clinic-1".to_string(),
                risk_score: 0.5,
                severity: i as f64,
                digest: digest(&i.to_be_bytes()),
                timestamp: start + ChronoDuration::seconds(i),
            })
            .collect()
    }

    #[test]
    fn test_ingest_batch_maps_outcomes() {
        let c = collector();
        let mut batch = records(2);
        batch.push(batch[0].clone());
        batch.push(AnonymizedRecord {
            severity: f64::INFINITY,
            ..records(3)[2].clone()
        });

        let outcomes = c.ingest_batch(&batch);
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Accepted,
                RecordOutcome::Accepted,
                RecordOutcome::Duplicate,
                RecordOutcome::Rejected {
                    reason: RejectReason::NonFiniteValue
                },
            ]
        );
        assert_eq!(c.store().len(), 2);
    }

    #[tokio::test]
    async fn test_forecast_unknown_metric() {
        let c = collector();
        let err = c
            .forecast(MetricKey::new("nowhere", MetricName::Severity), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::UnknownMetric(_)));
    }

    #[tokio::test]
    async fn test_forecast_uses_default_horizon() {
        let c = collector();
        c.ingest_batch(&records(20));
        let result = c
            .forecast(MetricKey::new("clinic-1", MetricName::Severity), None)
            .await
            .expect("forecast");
        assert_eq!(result.steps.len(), 7);
        assert_eq!(result.steps[0].point, 20.0);
    }
}
