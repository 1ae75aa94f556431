//! Records and wire types shared by sites and the collector.
//!
//! [`AnonymizedRecord`] is the only entity that crosses the network. All
//! wire structs reject unknown fields so shape mismatches fail at the
//! boundary instead of deep inside ingestion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::privacy::digest::RecordDigest;

/// Statistic released by a site for every observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    RiskScore,
    Severity,
}

impl MetricName {
    pub const ALL: [MetricName; 2] = [MetricName::RiskScore, MetricName::Severity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RiskScore => "risk_score",
            Self::Severity => "severity",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "risk_score" => Some(Self::RiskScore),
            "severity" => Some(Self::Severity),
            _ => None,
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one aggregated series: a site group and a metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub group: String,
    pub metric: MetricName,
}

impl MetricKey {
    pub fn new(group: impl Into<String>, metric: MetricName) -> Self {
        Self {
            group: group.into(),
            metric,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.metric)
    }
}

/// Noisy, integrity-stamped summary of one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnonymizedRecord {
    /// Opaque configured site identifier.
    pub site_id: String,
    pub risk_score: f64,
    pub severity: f64,
    /// SHA-256 over the pre-noise canonical observation.
    pub digest: RecordDigest,
    pub timestamp: DateTime<Utc>,
}

impl AnonymizedRecord {
    /// Released value for `metric`.
    pub fn value(&self, metric: MetricName) -> f64 {
        match metric {
            MetricName::RiskScore => self.risk_score,
            MetricName::Severity => self.severity,
        }
    }
}

/// Site → collector request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordBatch {
    pub records: Vec<AnonymizedRecord>,
}

/// Collector → site response body, one outcome per record in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchResponse {
    pub outcomes: Vec<RecordOutcome>,
}

/// Per-record acknowledgement on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Accepted,
    Duplicate,
    Rejected { reason: RejectReason },
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Why the collector refused a record. Rejections are permanent.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("site id is empty")]
    MissingSiteId,

    #[error("record carries a non-finite value")]
    NonFiniteValue,

    #[error("timestamp is too far in the future")]
    FutureTimestamp,

    #[error("another record already holds this timestamp")]
    TimestampConflict,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSiteId => "missing_site_id",
            Self::NonFiniteValue => "non_finite_value",
            Self::FutureTimestamp => "future_timestamp",
            Self::TimestampConflict => "timestamp_conflict",
        }
    }
}
