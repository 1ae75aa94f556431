//! Site-local observations and the risk score derived from them.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::SiteConfig;
use crate::privacy::digest::CanonicalBytes;

/// Domain tag mixed into every record digest.
pub const RECORD_DOMAIN: &str = "epiwatch-record-v1";

/// Risk added per symptom that matches a high-risk keyword.
const HIGH_RISK_WEIGHT: f64 = 0.2;

/// Errors for observations that can never become records.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("severity {value} outside [{min}, {max}]")]
    SeverityOutOfRange { value: f64, min: f64, max: f64 },

    #[error("severity must be finite")]
    NonFiniteSeverity,

    #[error("symptom tags must not be empty strings")]
    EmptySymptom,
}

/// Severity bounds and risk keywords used to score observations.
#[derive(Debug, Clone)]
pub struct ObservationPolicy {
    severity_min: f64,
    severity_max: f64,
    high_risk: Vec<String>,
}

impl ObservationPolicy {
    pub fn new(severity_min: f64, severity_max: f64, high_risk: &[String]) -> Self {
        Self {
            severity_min,
            severity_max,
            high_risk: high_risk.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn from_config(cfg: &SiteConfig) -> Self {
        Self::new(cfg.severity_min, cfg.severity_max, &cfg.high_risk_symptoms)
    }

    /// `severity / severity_max` plus a fixed weight per high-risk symptom,
    /// capped at 1.0. Tags are expected lower-cased.
    pub fn risk_score(&self, symptoms: &[String], severity: f64) -> f64 {
        let matches = symptoms
            .iter()
            .filter(|s| self.high_risk.iter().any(|k| s.contains(k.as_str())))
            .count();
        let score = severity / self.severity_max + HIGH_RISK_WEIGHT * matches as f64;
        score.min(1.0)
    }
}

impl Default for ObservationPolicy {
    fn default() -> Self {
        Self::from_config(&SiteConfig::default())
    }
}

/// A validated observation. Never leaves the site.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    symptoms: Vec<String>,
    severity: f64,
    risk_score: f64,
    timestamp: DateTime<Utc>,
}

impl Observation {
    /// Validates severity, normalises tags (trimmed, lower-cased, sorted,
    /// unique) and computes the risk score.
    pub fn new<I, S>(
        symptoms: I,
        severity: f64,
        timestamp: DateTime<Utc>,
        policy: &ObservationPolicy,
    ) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !severity.is_finite() {
            return Err(ValidationError::NonFiniteSeverity);
        }
        if severity < policy.severity_min || severity > policy.severity_max {
            return Err(ValidationError::SeverityOutOfRange {
                value: severity,
                min: policy.severity_min,
                max: policy.severity_max,
            });
        }

        let mut tags = Vec::new();
        for s in symptoms {
            let tag = s.as_ref().trim().to_lowercase();
            if tag.is_empty() {
                return Err(ValidationError::EmptySymptom);
            }
            tags.push(tag);
        }
        tags.sort();
        tags.dedup();

        let risk_score = policy.risk_score(&tags, severity);

        Ok(Self {
            symptoms: tags,
            severity,
            risk_score,
            timestamp,
        })
    }

    pub fn symptoms(&self) -> &[String] {
        &self.symptoms
    }

    pub fn severity(&self) -> f64 {
        self.severity
    }

    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Canonical pre-noise encoding bound to `site_id`.
    pub fn canonical_bytes(&self, site_id: &str) -> CanonicalBytes {
        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000));

        let mut c = CanonicalBytes::new(RECORD_DOMAIN);
        c.str(site_id)
            .i64(nanos)
            .f64(self.severity)
            .f64(self.risk_score)
            .u32(self.symptoms.len() as u32);
        for tag in &self.symptoms {
            c.str(tag);
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn test_risk_score_from_severity_only() {
        let policy = ObservationPolicy::default();
        let obs = Observation::new(["cough"], 8.0, ts(), &policy).expect("valid");
        assert!((obs.risk_score() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_high_risk_symptoms_raise_score_and_cap() {
        let policy = ObservationPolicy::default();
        let obs = Observation::new(["High Fever", "headache"], 3.0, ts(), &policy).expect("valid");
        assert!((obs.risk_score() - 0.5).abs() < 1e-12);

        let obs = Observation::new(
            ["fever", "chest pain", "confusion"],
            9.0,
            ts(),
            &policy,
        )
        .expect("valid");
        assert_eq!(obs.risk_score(), 1.0);
    }

    #[test]
    fn test_rejects_out_of_range_severity() {
        let policy = ObservationPolicy::default();
        assert!(matches!(
            Observation::new(["cough"], 11.0, ts(), &policy),
            Err(ValidationError::SeverityOutOfRange { .. })
        ));
        assert!(matches!(
            Observation::new(["cough"], -0.5, ts(), &policy),
            Err(ValidationError::SeverityOutOfRange { .. })
        ));
        assert_eq!(
            Observation::new(["cough"], f64::NAN, ts(), &policy),
            Err(ValidationError::NonFiniteSeverity)
        );
    }

    #[test]
    fn test_rejects_blank_symptom() {
        let policy = ObservationPolicy::default();
        assert_eq!(
            Observation::new(["cough", "  "], 2.0, ts(), &policy),
            Err(ValidationError::EmptySymptom)
        );
    }

    #[test]
    fn test_tags_are_normalised() {
        let policy = ObservationPolicy::default();
        let obs =
            Observation::new(["Rash", "cough", "COUGH "], 2.0, ts(), &policy).expect("valid");
        assert_eq!(obs.symptoms(), ["cough".to_string(), "rash".to_string()]);
    }

    #[test]
    fn test_canonical_bytes_ignore_tag_order() {
        let policy = ObservationPolicy::default();
        let a = Observation::new(["rash", "cough"], 2.0, ts(), &policy).expect("valid");
        let b = Observation::new(["cough", "rash"], 2.0, ts(), &policy).expect("valid");
        assert_eq!(
            a.canonical_bytes("s").digest(),
            b.canonical_bytes("s").digest()
        );
        assert_ne!(
            a.canonical_bytes("s").digest(),
            a.canonical_bytes("t").digest()
        );
    }
}
