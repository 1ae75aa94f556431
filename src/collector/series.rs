//! Per-key time series, running statistics and digest retention.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::privacy::digest::RecordDigest;

/// One aggregated value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Summary statistics of a series. Variance is the population variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl AggregateSnapshot {
    /// Recomputes the snapshot from scratch. Points must be in timestamp
    /// order.
    pub fn from_points<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a Point>,
    {
        let mut stats = RunningStats::default();
        for p in points {
            stats.push(p);
        }
        stats.snapshot()
    }
}

/// Welford accumulator behind [`AggregateSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl RunningStats {
    pub fn push(&mut self, p: &Point) {
        self.count += 1;
        if self.count == 1 {
            self.mean = p.value;
            self.m2 = 0.0;
            self.min = p.value;
            self.max = p.value;
        } else {
            let delta = p.value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (p.value - self.mean);
            self.min = self.min.min(p.value);
            self.max = self.max.max(p.value);
        }

        // Late points can land anywhere in time.
        self.first = Some(self.first.map_or(p.timestamp, |t| t.min(p.timestamp)));
        self.last = Some(self.last.map_or(p.timestamp, |t| t.max(p.timestamp)));
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        if self.count == 0 {
            return AggregateSnapshot::default();
        }
        AggregateSnapshot {
            count: self.count,
            mean: self.mean,
            variance: (self.m2 / self.count as f64).max(0.0),
            min: self.min,
            max: self.max,
            first: self.first,
            last: self.last,
        }
    }
}

/// Ordered points for one metric key, bounded to the most recent `limit`.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    points: VecDeque<Point>,
    limit: usize,
    stats: RunningStats,
}

impl MetricSeries {
    pub fn new(limit: usize) -> Self {
        Self {
            points: VecDeque::new(),
            limit: limit.max(1),
            stats: RunningStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Newest timestamp held.
    pub fn tail(&self) -> Option<DateTime<Utc>> {
        self.points.back().map(|p| p.timestamp)
    }

    pub fn contains_timestamp(&self, ts: DateTime<Utc>) -> bool {
        let idx = self.points.partition_point(|p| p.timestamp < ts);
        self.points.get(idx).is_some_and(|p| p.timestamp == ts)
    }

    /// Inserts in timestamp order and returns how many old points were
    /// evicted. The caller guarantees the timestamp is not already held.
    pub fn insert(&mut self, point: Point) -> usize {
        let idx = self.points.partition_point(|p| p.timestamp < point.timestamp);
        self.points.insert(idx, point);
        self.stats.push(&point);

        let mut evicted = 0;
        while self.points.len() > self.limit {
            self.points.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            let mut stats = RunningStats::default();
            for p in &self.points {
                stats.push(p);
            }
            self.stats = stats;
        }
        evicted
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.stats.snapshot()
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.iter().copied().collect()
    }
}

/// Digests seen by one series, retained for `window` of collector arrival
/// time and bounded by a count cap.
///
/// Retention follows arrival rather than record timestamps: a redelivery
/// arrives shortly after the original no matter how old the record is, and
/// a late first-time record never has to be refused.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    window: ChronoDuration,
    capacity: usize,
    digests: HashSet<RecordDigest>,
    /// Arrival order, oldest first.
    arrivals: VecDeque<(DateTime<Utc>, RecordDigest)>,
}

impl DedupWindow {
    pub fn new(window: std::time::Duration, capacity: usize) -> Self {
        Self {
            window: ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::weeks(52 * 100)),
            capacity: capacity.max(1),
            digests: HashSet::new(),
            arrivals: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn contains(&self, digest: &RecordDigest) -> bool {
        self.digests.contains(digest)
    }

    /// Records a digest that arrived at `arrived` and forgets digests that
    /// arrived more than `window` earlier or overflow the cap.
    pub fn insert(&mut self, digest: RecordDigest, arrived: DateTime<Utc>) {
        if self.digests.insert(digest) {
            self.arrivals.push_back((arrived, digest));
        }

        if let Some(horizon) = arrived.checked_sub_signed(self.window) {
            while self.arrivals.front().is_some_and(|(at, _)| *at < horizon) {
                if let Some((_, d)) = self.arrivals.pop_front() {
                    self.digests.remove(&d);
                }
            }
        }

        while self.arrivals.len() > self.capacity {
            if let Some((_, d)) = self.arrivals.pop_front() {
                self.digests.remove(&d);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::privacy::digest::digest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid time")
            + ChronoDuration::seconds(secs)
    }

    fn point(secs: i64, value: f64) -> Point {
        Point {
            timestamp: at(secs),
            value,
        }
    }

    fn values(series: &MetricSeries) -> Vec<f64> {
        series.points().iter().map(|p| p.value).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_welford_matches_recomputation() {
        let mut series = MetricSeries::new(1_000);
        let values = [3.0, -1.5, 8.25, 0.0, 4.75, 4.75, 12.0, -7.0];
        for (i, v) in values.iter().enumerate() {
            series.insert(point(i as i64, *v));
        }

        let incremental = series.snapshot();
        let recomputed = AggregateSnapshot::from_points(&series.points());
        assert_eq!(incremental.count, recomputed.count);
        assert!(close(incremental.mean, recomputed.mean));
        assert!(close(incremental.variance, recomputed.variance));

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert!(close(incremental.mean, mean));
        assert!(close(incremental.variance, var));
        assert_eq!(incremental.min, -7.0);
        assert_eq!(incremental.max, 12.0);
        assert_eq!(incremental.first, Some(at(0)));
        assert_eq!(incremental.last, Some(at(7)));
    }

    #[test]
    fn test_late_points_insert_in_order() {
        let mut series = MetricSeries::new(100);
        series.insert(point(10, 1.0));
        series.insert(point(30, 3.0));
        series.insert(point(20, 2.0));
        series.insert(point(5, 0.5));

        let ts: Vec<_> = series.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![at(5), at(10), at(20), at(30)]);
        assert_eq!(values(&series), vec![0.5, 1.0, 2.0, 3.0]);
        assert_eq!(series.tail(), Some(at(30)));
        assert!(series.contains_timestamp(at(20)));
        assert!(!series.contains_timestamp(at(21)));
    }

    #[test]
    fn test_newest_first_then_older_points() {
        let mut series = MetricSeries::new(100);
        series.insert(point(30, 3.0));
        series.insert(point(10, 1.0));
        series.insert(point(20, 2.0));

        assert_eq!(values(&series), vec![1.0, 2.0, 3.0]);
        assert_eq!(series.tail(), Some(at(30)));

        let snap = series.snapshot();
        assert_eq!(snap.first, Some(at(10)));
        assert_eq!(snap.last, Some(at(30)));
        assert!(close(snap.mean, 2.0));
    }

    #[test]
    fn test_history_limit_evicts_oldest_and_recomputes() {
        let mut series = MetricSeries::new(3);
        for i in 0..5 {
            series.insert(point(i, i as f64));
        }
        assert_eq!(values(&series), vec![2.0, 3.0, 4.0]);

        let snap = series.snapshot();
        assert_eq!(snap.count, 3);
        assert!(close(snap.mean, 3.0));
        assert!(close(snap.variance, 2.0 / 3.0));
        assert_eq!(snap.first, Some(at(2)));
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = MetricSeries::new(10).snapshot();
        assert_eq!(snap, AggregateSnapshot::default());
    }

    #[test]
    fn test_dedup_window_prunes_by_arrival() {
        let mut w = DedupWindow::new(Duration::from_secs(60), 100);
        let a = digest(b"a");
        let b = digest(b"b");

        w.insert(a, at(0));
        w.insert(b, at(30));
        assert!(w.contains(&a));

        w.insert(digest(b"c"), at(90));
        assert!(!w.contains(&a));
        assert!(w.contains(&b));
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_dedup_window_capacity_forgets_oldest_arrival() {
        let mut w = DedupWindow::new(Duration::from_secs(3600), 2);
        for i in 0..3i64 {
            w.insert(digest(&i.to_be_bytes()), at(i));
        }
        assert_eq!(w.len(), 2);
        assert!(!w.contains(&digest(&0i64.to_be_bytes())));
        assert!(w.contains(&digest(&2i64.to_be_bytes())));
    }

    #[test]
    fn test_repeated_digest_keeps_first_arrival() {
        let mut w = DedupWindow::new(Duration::from_secs(60), 100);
        let a = digest(b"a");
        w.insert(a, at(0));
        w.insert(a, at(50));
        w.insert(digest(b"b"), at(61));
        assert!(!w.contains(&a));
    }
}
