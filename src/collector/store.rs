use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CollectorConfig;
use crate::record::{AnonymizedRecord, MetricKey, MetricName, RecordOutcome, RejectReason};

use super::series::{AggregateSnapshot, DedupWindow, MetricSeries, Point};

/// Result of ingesting one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    DuplicateIgnored,
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::DuplicateIgnored => "duplicate",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl From<IngestOutcome> for RecordOutcome {
    fn from(outcome: IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Accepted => RecordOutcome::Accepted,
            IngestOutcome::DuplicateIgnored => RecordOutcome::Duplicate,
            IngestOutcome::Rejected(reason) => RecordOutcome::Rejected { reason },
        }
    }
}

/// One key's snapshot, as listed by [`AggregationStore::overview`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesOverview {
    pub group: String,
    pub metric: MetricName,
    pub snapshot: AggregateSnapshot,
}

struct SeriesState {
    series: MetricSeries,
    dedup: DedupWindow,
}

/// Store tuning taken from the collector config.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
    pub max_future_skew: Duration,
    pub history_limit: usize,
    pub site_groups: HashMap<String, String>,
}

impl From<&CollectorConfig> for StoreSettings {
    fn from(cfg: &CollectorConfig) -> Self {
        Self {
            dedup_window: cfg.dedup_window,
            dedup_capacity: cfg.dedup_capacity,
            max_future_skew: cfg.max_future_skew,
            history_limit: cfg.history_limit,
            site_groups: cfg.site_groups.clone(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&CollectorConfig::default())
    }
}

/// Concurrent aggregation state keyed by (site group, metric).
///
/// Each series sits behind its own mutex inside a `DashMap`. An ingest locks
/// every series the record touches in sorted key order, so concurrent
/// ingests never deadlock and never take a global lock.
pub struct AggregationStore {
    series: DashMap<MetricKey, Arc<Mutex<SeriesState>>>,
    settings: StoreSettings,
    future_skew: ChronoDuration,
}

impl AggregationStore {
    pub fn new(settings: StoreSettings) -> Self {
        let future_skew = ChronoDuration::from_std(settings.max_future_skew)
            .unwrap_or_else(|_| ChronoDuration::days(1));
        Self {
            series: DashMap::with_capacity(16),
            settings,
            future_skew,
        }
    }

    /// Aggregation group for a site.
    pub fn group_for<'a>(&'a self, site_id: &'a str) -> &'a str {
        self.settings
            .site_groups
            .get(site_id)
            .map(String::as_str)
            .unwrap_or(site_id)
    }

    /// Ingests a record against the current wall clock.
    pub fn ingest(&self, record: &AnonymizedRecord) -> IngestOutcome {
        self.ingest_at(record, Utc::now())
    }

    /// Ingests a record arriving at `now`. Future timestamps are judged
    /// against `now` and digests are retained relative to it.
    pub fn ingest_at(&self, record: &AnonymizedRecord, now: DateTime<Utc>) -> IngestOutcome {
        if let Err(reason) = self.check(record, now) {
            return IngestOutcome::Rejected(reason);
        }

        let group = self.group_for(&record.site_id).to_string();
        let mut keys: Vec<MetricKey> = MetricName::ALL
            .iter()
            .map(|m| MetricKey::new(group.clone(), *m))
            .collect();
        keys.sort();

        // Handles are cloned out so no DashMap shard lock is held while the
        // series mutexes are taken.
        let handles: Vec<Arc<Mutex<SeriesState>>> = keys
            .iter()
            .map(|k| Arc::clone(self.entry(k).value()))
            .collect();
        let mut guards: Vec<_> = handles.iter().map(|h| h.lock()).collect();

        if guards.iter().any(|g| g.dedup.contains(&record.digest)) {
            return IngestOutcome::DuplicateIgnored;
        }

        let ts = record.timestamp;
        if guards.iter().any(|g| g.series.contains_timestamp(ts)) {
            return IngestOutcome::Rejected(RejectReason::TimestampConflict);
        }

        for (guard, key) in guards.iter_mut().zip(&keys) {
            let evicted = guard.series.insert(Point {
                timestamp: ts,
                value: record.value(key.metric),
            });
            if evicted > 0 {
                tracing::debug!(key = %key, evicted, "history limit reached");
            }
            guard.dedup.insert(record.digest, now);
        }

        IngestOutcome::Accepted
    }

    /// Ingests records independently, returning one outcome per record.
    pub fn ingest_batch(&self, records: &[AnonymizedRecord]) -> Vec<IngestOutcome> {
        let now = Utc::now();
        records.iter().map(|r| self.ingest_at(r, now)).collect()
    }

    fn check(&self, record: &AnonymizedRecord, now: DateTime<Utc>) -> Result<(), RejectReason> {
        if record.site_id.trim().is_empty() {
            return Err(RejectReason::MissingSiteId);
        }
        if !record.risk_score.is_finite() || !record.severity.is_finite() {
            return Err(RejectReason::NonFiniteValue);
        }
        let limit = now.checked_add_signed(self.future_skew).unwrap_or(now);
        if record.timestamp > limit {
            return Err(RejectReason::FutureTimestamp);
        }
        Ok(())
    }

    fn entry(&self, key: &MetricKey) -> dashmap::mapref::one::RefMut<'_, MetricKey, Arc<Mutex<SeriesState>>> {
        self.series.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(SeriesState {
                series: MetricSeries::new(self.settings.history_limit),
                dedup: DedupWindow::new(self.settings.dedup_window, self.settings.dedup_capacity),
            }))
        })
    }

    fn handle(&self, key: &MetricKey) -> Option<Arc<Mutex<SeriesState>>> {
        self.series.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn snapshot(&self, key: &MetricKey) -> Option<AggregateSnapshot> {
        self.handle(key).map(|h| h.lock().series.snapshot())
    }

    /// The most recent `limit` points (all when `None`), oldest first.
    pub fn history(&self, key: &MetricKey, limit: Option<usize>) -> Option<Vec<Point>> {
        let mut points = self.series_copy(key)?;
        if let Some(limit) = limit {
            let skip = points.len().saturating_sub(limit);
            points.drain(..skip);
        }
        Some(points)
    }

    /// Immutable copy of a series taken under a brief lock.
    pub fn series_copy(&self, key: &MetricKey) -> Option<Vec<Point>> {
        self.handle(key).map(|h| h.lock().series.points())
    }

    pub fn keys(&self) -> Vec<MetricKey> {
        let mut keys: Vec<MetricKey> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Every key with its snapshot, sorted by key.
    pub fn overview(&self) -> Vec<SeriesOverview> {
        self.keys()
            .into_iter()
            .filter_map(|key| {
                let snapshot = self.snapshot(&key)?;
                Some(SeriesOverview {
                    group: key.group,
                    metric: key.metric,
                    snapshot,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::TimeZone;

    use super::*;
    use crate::privacy::digest::digest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid time")
            + ChronoDuration::seconds(secs)
    }

    fn record(site: &str, secs: i64, severity: f64) -> AnonymizedRecord {
        AnonymizedRecord {
            site_id: site.to_string(),
            risk_score: severity / 10.0,
            severity,
            digest: digest(format!("{site}/{secs}").as_bytes()),
            timestamp: at(secs),
        }
    }

    fn store() -> AggregationStore {
        AggregationStore::new(StoreSettings::default())
    }

    fn key(group: &str, metric: MetricName) -> MetricKey {
        MetricKey::new(group, metric)
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let s = store();
        let r = record("a", 0, 8.0);
        assert_eq!(s.ingest_at(&r, at(10)), IngestOutcome::Accepted);
        assert_eq!(s.ingest_at(&r, at(10)), IngestOutcome::DuplicateIgnored);

        let snap = s
            .snapshot(&key("a", MetricName::Severity))
            .expect("series");
        assert_eq!(snap.count, 1);
        assert_eq!(snap.mean, 8.0);
    }

    #[test]
    fn test_record_feeds_both_metrics() {
        let s = store();
        s.ingest_at(&record("a", 0, 6.0), at(10));
        assert_eq!(
            s.keys(),
            vec![key("a", MetricName::RiskScore), key("a", MetricName::Severity)]
        );
        let risk = s
            .snapshot(&key("a", MetricName::RiskScore))
            .expect("series");
        assert!((risk.mean - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_late_record_is_inserted_in_order() {
        let s = store();
        s.ingest_at(&record("a", 10, 1.0), at(100));
        s.ingest_at(&record("a", 30, 3.0), at(100));
        s.ingest_at(&record("a", 20, 2.0), at(100));

        let values: Vec<f64> = s
            .history(&key("a", MetricName::Severity), None)
            .expect("series")
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rejections() {
        let s = store();

        let mut r = record("", 0, 1.0);
        assert_eq!(
            s.ingest_at(&r, at(10)),
            IngestOutcome::Rejected(RejectReason::MissingSiteId)
        );

        r = record("a", 0, f64::NAN);
        assert_eq!(
            s.ingest_at(&r, at(10)),
            IngestOutcome::Rejected(RejectReason::NonFiniteValue)
        );

        r = record("a", 3_600, 1.0);
        assert_eq!(
            s.ingest_at(&r, at(0)),
            IngestOutcome::Rejected(RejectReason::FutureTimestamp)
        );
        assert!(s.is_empty());
    }

    #[test]
    fn test_timestamp_conflict_is_rejected() {
        let s = store();
        s.ingest_at(&record("a", 5, 1.0), at(10));

        let mut other = record("a", 5, 9.0);
        other.digest = digest(b"different event");
        assert_eq!(
            s.ingest_at(&other, at(10)),
            IngestOutcome::Rejected(RejectReason::TimestampConflict)
        );
    }

    #[test]
    fn test_newest_first_record_order() {
        let s = store();
        for (secs, v) in [(30, 3.0), (10, 1.0), (20, 2.0)] {
            assert_eq!(s.ingest_at(&record("a", secs, v), at(100)), IngestOutcome::Accepted);
        }

        let history = s
            .history(&key("a", MetricName::Severity), None)
            .expect("series");
        let ts: Vec<_> = history.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![at(10), at(20), at(30)]);
        let snap = s
            .snapshot(&key("a", MetricName::Severity))
            .expect("series");
        assert_eq!(snap.count, 3);
        assert_eq!(snap.first, Some(at(10)));
    }

    #[test]
    fn test_site_back_from_long_outage_is_accepted() {
        let mut settings = StoreSettings::default();
        settings
            .site_groups
            .insert("a".to_string(), "north".to_string());
        settings
            .site_groups
            .insert("b".to_string(), "north".to_string());
        let s = AggregationStore::new(settings);

        let hour = 3_600;
        s.ingest_at(&record("b", 26 * hour, 5.0), at(26 * hour));

        // Site a delivers its backlog 25 hours late, twice.
        let late = record("a", hour, 1.0);
        assert_eq!(s.ingest_at(&late, at(26 * hour)), IngestOutcome::Accepted);
        assert_eq!(
            s.ingest_at(&late, at(26 * hour + 5)),
            IngestOutcome::DuplicateIgnored
        );

        let history = s
            .history(&key("north", MetricName::Severity), None)
            .expect("series");
        assert_eq!(
            history.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![1.0, 5.0]
        );
    }

    #[test]
    fn test_redelivery_within_window_is_a_duplicate_however_old() {
        let s = AggregationStore::new(StoreSettings {
            dedup_window: Duration::from_secs(60),
            ..StoreSettings::default()
        });
        let old = record("a", 0, 1.0);
        s.ingest_at(&record("a", 10_000, 2.0), at(10_000));
        assert_eq!(s.ingest_at(&old, at(10_000)), IngestOutcome::Accepted);
        assert_eq!(
            s.ingest_at(&old, at(10_030)),
            IngestOutcome::DuplicateIgnored
        );
    }

    #[test]
    fn test_site_groups_merge_sites() {
        let mut settings = StoreSettings::default();
        settings
            .site_groups
            .insert("a".to_string(), "north".to_string());
        settings
            .site_groups
            .insert("b".to_string(), "north".to_string());
        let s = AggregationStore::new(settings);

        s.ingest_at(&record("a", 0, 2.0), at(10));
        s.ingest_at(&record("b", 1, 4.0), at(10));
        s.ingest_at(&record("c", 2, 6.0), at(10));

        let north = s
            .snapshot(&key("north", MetricName::Severity))
            .expect("north");
        assert_eq!(north.count, 2);
        assert_eq!(north.mean, 3.0);
        assert!(s.snapshot(&key("c", MetricName::Severity)).is_some());
        assert_eq!(s.overview().len(), 4);
    }

    #[test]
    fn test_batch_outcomes_are_per_record() {
        let s = store();
        let now = Utc::now();
        let good = AnonymizedRecord {
            timestamp: now,
            ..record("a", 0, 1.0)
        };
        let bad = AnonymizedRecord {
            site_id: String::new(),
            ..good.clone()
        };
        let outcomes = s.ingest_batch(&[good.clone(), bad, good]);
        assert_eq!(
            outcomes,
            vec![
                IngestOutcome::Accepted,
                IngestOutcome::Rejected(RejectReason::MissingSiteId),
                IngestOutcome::DuplicateIgnored,
            ]
        );
    }

    #[test]
    fn test_concurrent_ingest_counts_every_record_once() {
        let s = Arc::new(store());
        let mut handles = Vec::new();
        for t in 0..4i64 {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                for i in 0..250i64 {
                    let r = record("a", t * 1_000 + i, 1.0);
                    // Every record is sent twice.
                    s.ingest_at(&r, at(10_000));
                    s.ingest_at(&r, at(10_000));
                }
            }));
        }
        for h in handles {
            h.join().expect("ingest thread");
        }

        let snap = s
            .snapshot(&key("a", MetricName::Severity))
            .expect("series");
        assert_eq!(snap.count, 1_000);
    }

    #[test]
    fn test_history_limit_query() {
        let s = store();
        for i in 0..5 {
            s.ingest_at(&record("a", i, i as f64), at(100));
        }
        let last_two = s
            .history(&key("a", MetricName::Severity), Some(2))
            .expect("series");
        assert_eq!(
            last_two.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![3.0, 4.0]
        );
        assert!(s.history(&key("zzz", MetricName::Severity), None).is_none());
    }
}
