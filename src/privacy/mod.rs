//! Differential-privacy noise and integrity stamping.
//!
//! [`LaplaceNoise`] releases a scalar under ε-differential privacy by adding
//! one Laplace(0, sensitivity/ε) draw. The random source is a constructor
//! argument so tests can pin it to a seed.

pub mod digest;

use parking_lot::Mutex;
use rand::distributions::Open01;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

/// Errors from noise parameter validation.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum PrivacyError {
    #[error("invalid epsilon {0}: must be finite and > 0")]
    InvalidEpsilon(f64),

    #[error("invalid sensitivity {0}: must be finite and >= 0")]
    InvalidSensitivity(f64),
}

/// Laplace mechanism over an injected random source.
///
/// The RNG sits behind a mutex so one instance can serve concurrent
/// submissions on a site.
pub struct LaplaceNoise<R = ChaCha20Rng> {
    rng: Mutex<R>,
}

impl LaplaceNoise<ChaCha20Rng> {
    /// ChaCha20 seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self::with_rng(ChaCha20Rng::from_entropy())
    }

    /// Deterministic ChaCha20 stream for reproducible tests.
    pub fn from_seed(seed: u64) -> Self {
        Self::with_rng(ChaCha20Rng::seed_from_u64(seed))
    }
}

impl<R: Rng> LaplaceNoise<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Returns `value` plus one Laplace(0, sensitivity/epsilon) sample.
    ///
    /// A sensitivity of zero releases the value unchanged and consumes no
    /// entropy.
    pub fn perturb(&self, value: f64, sensitivity: f64, epsilon: f64) -> Result<f64, PrivacyError> {
        validate_params(sensitivity, epsilon)?;
        if sensitivity == 0.0 {
            return Ok(value);
        }
        Ok(value + self.sample(sensitivity / epsilon))
    }

    /// Inverse-CDF sample. `Open01` excludes both endpoints so the log
    /// argument stays strictly positive.
    fn sample(&self, scale: f64) -> f64 {
        let u01: f64 = self.rng.lock().sample(Open01);
        let u = u01 - 0.5;
        -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
    }
}

/// Validates an (epsilon, sensitivity) pair.
pub fn validate_params(sensitivity: f64, epsilon: f64) -> Result<(), PrivacyError> {
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(PrivacyError::InvalidEpsilon(epsilon));
    }
    if !sensitivity.is_finite() || sensitivity < 0.0 {
        return Err(PrivacyError::InvalidSensitivity(sensitivity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_epsilon() {
        let noise = LaplaceNoise::from_seed(1);
        assert_eq!(
            noise.perturb(1.0, 1.0, 0.0),
            Err(PrivacyError::InvalidEpsilon(0.0))
        );
        assert_eq!(
            noise.perturb(1.0, 1.0, -0.5),
            Err(PrivacyError::InvalidEpsilon(-0.5))
        );
        assert!(matches!(
            noise.perturb(1.0, 1.0, f64::NAN),
            Err(PrivacyError::InvalidEpsilon(_))
        ));
    }

    #[test]
    fn test_rejects_negative_sensitivity() {
        let noise = LaplaceNoise::from_seed(1);
        assert_eq!(
            noise.perturb(1.0, -1.0, 0.5),
            Err(PrivacyError::InvalidSensitivity(-1.0))
        );
    }

    #[test]
    fn test_zero_sensitivity_is_identity() {
        let noise = LaplaceNoise::from_seed(1);
        assert_eq!(noise.perturb(4.25, 0.0, 0.5), Ok(4.25));
    }

    #[test]
    fn test_repeated_calls_differ_from_input() {
        let noise = LaplaceNoise::from_seed(7);
        let changed = (0..1_000)
            .map(|_| noise.perturb(3.0, 1.0, 0.5).expect("valid params"))
            .filter(|v| *v != 3.0)
            .count();
        assert_eq!(changed, 1_000);
    }

    #[test]
    fn test_same_seed_reproduces_noise() {
        let a = LaplaceNoise::from_seed(42);
        let b = LaplaceNoise::from_seed(42);
        for _ in 0..16 {
            let x = a.perturb(0.0, 1.0, 0.5).expect("valid");
            let y = b.perturb(0.0, 1.0, 0.5).expect("valid");
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_empirical_variance_matches_laplace() {
        let noise = LaplaceNoise::from_seed(2024);
        let (sensitivity, epsilon) = (1.0, 0.5);
        let n = 200_000;

        let samples: Vec<f64> = (0..n)
            .map(|_| noise.perturb(0.0, sensitivity, epsilon).expect("valid"))
            .collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;

        let expected = 2.0 * (sensitivity / epsilon).powi(2);
        assert!(mean.abs() < 0.05, "mean {mean} should be near zero");
        assert!(
            (var - expected).abs() / expected < 0.05,
            "variance {var} should be near {expected}"
        );
    }

    #[test]
    fn test_samples_are_finite() {
        let noise = LaplaceNoise::from_seed(99);
        for _ in 0..100_000 {
            assert!(noise.perturb(0.0, 1.0, 0.01).expect("valid").is_finite());
        }
    }
}
