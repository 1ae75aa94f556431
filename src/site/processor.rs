use std::sync::Arc;

use crate::config::{PrivacyConfig, PrivacyParams};
use crate::privacy::{LaplaceNoise, PrivacyError};
use crate::record::AnonymizedRecord;

use super::observation::Observation;

/// Turns observations into noisy, digest-stamped records.
pub struct RecordProcessor {
    site_id: String,
    risk: PrivacyParams,
    severity: PrivacyParams,
    noise: Arc<LaplaceNoise>,
}

impl RecordProcessor {
    pub fn new(site_id: impl Into<String>, privacy: &PrivacyConfig, noise: Arc<LaplaceNoise>) -> Self {
        Self {
            site_id: site_id.into(),
            risk: privacy.risk_score,
            severity: privacy.severity,
            noise,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Digest first, over pre-noise values, then perturb each metric
    /// independently and clamp.
    pub fn process(&self, obs: &Observation) -> Result<AnonymizedRecord, PrivacyError> {
        let digest = obs.canonical_bytes(&self.site_id).digest();

        let risk_score = self.release(obs.risk_score(), &self.risk)?;
        let severity = self.release(obs.severity(), &self.severity)?;

        Ok(AnonymizedRecord {
            site_id: self.site_id.clone(),
            risk_score,
            severity,
            digest,
            timestamp: obs.timestamp(),
        })
    }

    fn release(&self, value: f64, params: &PrivacyParams) -> Result<f64, PrivacyError> {
        let noisy = self
            .noise
            .perturb(value, params.sensitivity, params.epsilon)?;
        Ok(params.clamp(noisy))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::site::observation::ObservationPolicy;

    fn processor(seed: u64) -> RecordProcessor {
        RecordProcessor::new(
            "clinic-1",
            &PrivacyConfig::default(),
            Arc::new(LaplaceNoise::from_seed(seed)),
        )
    }

    #[test]
    fn test_same_observation_shares_digest_but_not_noise() {
        let p = processor(11);
        let obs = Observation::new(["fever"], 6.0, Utc::now(), &ObservationPolicy::default())
            .expect("valid");

        let a = p.process(&obs).expect("process");
        let b = p.process(&obs).expect("process");

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.severity, b.severity);
        assert_ne!(a.risk_score, b.risk_score);
        assert_eq!(a.site_id, "clinic-1");
        assert_eq!(a.timestamp, obs.timestamp());
    }

    #[test]
    fn test_digest_matches_pre_noise_encoding() {
        let p = processor(3);
        let obs = Observation::new(["cough"], 2.0, Utc::now(), &ObservationPolicy::default())
            .expect("valid");
        let record = p.process(&obs).expect("process");
        assert_eq!(record.digest, obs.canonical_bytes("clinic-1").digest());
    }

    #[test]
    fn test_zero_sensitivity_releases_exact_values() {
        let mut privacy = PrivacyConfig::default();
        privacy.severity.sensitivity = 0.0;
        let p = RecordProcessor::new("s", &privacy, Arc::new(LaplaceNoise::from_seed(5)));
        let obs = Observation::new(["cough"], 4.0, Utc::now(), &ObservationPolicy::default())
            .expect("valid");
        assert_eq!(p.process(&obs).expect("process").severity, 4.0);
    }

    #[test]
    fn test_clamp_bounds_released_values() {
        let mut privacy = PrivacyConfig::default();
        privacy.risk_score.clamp_min = Some(0.0);
        privacy.risk_score.clamp_max = Some(1.0);
        privacy.risk_score.epsilon = 0.01;
        let p = RecordProcessor::new("s", &privacy, Arc::new(LaplaceNoise::from_seed(9)));
        let obs = Observation::new(["cough"], 5.0, Utc::now(), &ObservationPolicy::default())
            .expect("valid");
        for _ in 0..200 {
            let r = p.process(&obs).expect("process");
            assert!((0.0..=1.0).contains(&r.risk_score));
        }
    }
}
