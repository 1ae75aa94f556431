//! Site role: turns local observations into anonymized records and keeps
//! them flowing to the collector.

pub mod http;
pub mod observation;
pub mod processor;
pub mod sync;
pub mod transport;

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SiteConfig;
use crate::export::health::HealthMetrics;
use crate::privacy::digest::RecordDigest;
use crate::privacy::{LaplaceNoise, PrivacyError};

use self::observation::{Observation, ObservationPolicy, ValidationError};
use self::processor::RecordProcessor;
use self::sync::{QueueFull, SyncClient};
use self::transport::Transport;

/// Why an observation was not queued.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid observation: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Privacy(#[from] PrivacyError),

    #[error(transparent)]
    QueueFull(#[from] QueueFull),
}

/// Result of a queued observation. The risk score is the local, pre-noise
/// value and never leaves the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub risk_score: f64,
    pub digest: RecordDigest,
    pub timestamp: DateTime<Utc>,
    pub backlog: usize,
}

/// Local site statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteStats {
    pub site_id: String,
    pub records_processed: u64,
    pub backlog: usize,
}

struct SubmitState {
    last_timestamp: Option<DateTime<Utc>>,
    processed: u64,
}

/// One reporting site.
pub struct Site {
    policy: ObservationPolicy,
    processor: RecordProcessor,
    sync: Arc<SyncClient>,
    metrics: Arc<HealthMetrics>,
    state: Mutex<SubmitState>,
}

impl Site {
    pub fn new(cfg: &SiteConfig, noise: Arc<LaplaceNoise>, metrics: Arc<HealthMetrics>) -> Self {
        let sync = Arc::new(SyncClient::new(
            cfg.site_id.clone(),
            cfg.sync.clone(),
            Arc::clone(&metrics),
        ));

        Self {
            policy: ObservationPolicy::from_config(cfg),
            processor: RecordProcessor::new(cfg.site_id.clone(), &cfg.privacy, noise),
            sync,
            metrics,
            state: Mutex::new(SubmitState {
                last_timestamp: None,
                processed: 0,
            }),
        }
    }

    pub fn site_id(&self) -> &str {
        self.processor.site_id()
    }

    pub fn sync(&self) -> &Arc<SyncClient> {
        &self.sync
    }

    /// Records an observation taken now.
    pub fn submit_observation<I, S>(&self, symptoms: I, severity: f64) -> Result<Submission, SubmitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.submit_observation_at(symptoms, severity, Utc::now())
    }

    /// Records an observation with an explicit timestamp.
    ///
    /// Timestamps are strictly increasing per site: a timestamp at or before
    /// the previous one is moved to one nanosecond after it.
    pub fn submit_observation_at<I, S>(
        &self,
        symptoms: I,
        severity: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Submission, SubmitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let result = self.submit_locked(symptoms, severity, timestamp);

        let label = match &result {
            Ok(_) => "processed",
            Err(SubmitError::Validation(_)) => "invalid",
            Err(SubmitError::Privacy(_)) => "privacy_error",
            Err(SubmitError::QueueFull(_)) => "queue_full",
        };
        self.metrics
            .observations_total
            .with_label_values(&[label])
            .inc();

        result
    }

    fn submit_locked<I, S>(
        &self,
        symptoms: I,
        severity: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Submission, SubmitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // Held across processing and enqueue so queue order matches
        // timestamp order.
        let mut state = self.state.lock();

        let timestamp = match state.last_timestamp {
            Some(last) if timestamp <= last => last + ChronoDuration::nanoseconds(1),
            _ => timestamp,
        };

        let obs = Observation::new(symptoms, severity, timestamp, &self.policy)?;
        let record = self.processor.process(&obs)?;
        let digest = record.digest;

        self.sync.enqueue(record)?;

        state.last_timestamp = Some(timestamp);
        state.processed += 1;

        tracing::debug!(
            site = %self.site_id(),
            digest = %digest,
            symptoms = obs.symptoms().len(),
            "observation queued",
        );

        Ok(Submission {
            risk_score: obs.risk_score(),
            digest,
            timestamp,
            backlog: self.sync.backlog(),
        })
    }

    pub fn stats(&self) -> SiteStats {
        SiteStats {
            site_id: self.site_id().to_string(),
            records_processed: self.state.lock().processed,
            backlog: self.sync.backlog(),
        }
    }

    /// Wakes the delivery loop.
    pub fn flush_now(&self) {
        self.sync.flush_now();
    }

    /// Starts background delivery over `transport`.
    pub fn start<T: Transport>(&self, transport: T, ctx: CancellationToken) {
        self.sync.start(transport, ctx);
    }

    pub async fn stop(&self) {
        self.sync.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::{OverflowPolicy, SyncConfig};

    fn site(cfg: SiteConfig) -> Site {
        Site::new(
            &cfg,
            Arc::new(LaplaceNoise::from_seed(1)),
            Arc::new(HealthMetrics::new("").expect("metrics")),
        )
    }

    fn cfg() -> SiteConfig {
        SiteConfig {
            site_id: "clinic-1".to_string(),
            collector_url: "http://localhost:8000".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_queues_record_and_counts() {
        let s = site(cfg());
        let sub = s.submit_observation(["fever"], 8.0).expect("submit");
        assert_eq!(sub.risk_score, 1.0);
        assert_eq!(sub.backlog, 1);
        assert_eq!(
            s.stats(),
            SiteStats {
                site_id: "clinic-1".to_string(),
                records_processed: 1,
                backlog: 1,
            }
        );
    }

    #[test]
    fn test_invalid_observation_is_not_queued() {
        let s = site(cfg());
        let err = s.submit_observation(["cough"], 12.0).unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
        assert_eq!(s.stats().backlog, 0);
        assert_eq!(s.stats().records_processed, 0);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let s = site(cfg());
        let t = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("valid time");

        let a = s.submit_observation_at(["cough"], 2.0, t).expect("submit");
        let b = s.submit_observation_at(["cough"], 2.0, t).expect("submit");
        let c = s
            .submit_observation_at(["cough"], 2.0, t - ChronoDuration::seconds(1))
            .expect("submit");

        assert_eq!(a.timestamp, t);
        assert!(b.timestamp > a.timestamp);
        assert!(c.timestamp > b.timestamp);
        assert_ne!(a.digest, b.digest);

        let pending = s.sync().pending();
        assert!(pending.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_queue_full_surfaces_to_caller() {
        let s = site(SiteConfig {
            sync: SyncConfig {
                max_queue_size: 1,
                overflow_policy: OverflowPolicy::RejectNew,
                ..Default::default()
            },
            ..cfg()
        });
        s.submit_observation(["cough"], 2.0).expect("submit");
        let err = s.submit_observation(["cough"], 2.0).unwrap_err();
        assert!(matches!(err, SubmitError::QueueFull(_)));
        assert_eq!(s.stats().records_processed, 1);
    }
}
