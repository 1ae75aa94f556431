//! ARIMA(p,d,q) forecasting over aggregated series.
//!
//! The fit is an intercept-free conditional sum of squares over the demeaned
//! `d`-th differences, minimised with a fixed-start Nelder–Mead simplex.
//! Coefficients are optimised through `0.99 * tanh(u)` so every candidate
//! stays inside (-0.99, 0.99). Nothing is random, so equal inputs give
//! bit-identical forecasts.
//!
//! Bounds come from the psi-weights of the integrated model:
//! `var_k = sigma^2 * sum_{j<k} psi_j^2`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ArimaOrder, ForecastConfig};
use crate::record::MetricKey;

use super::series::Point;

/// Largest coefficient magnitude a fit may produce.
const COEF_BOUND: f64 = 0.99;
/// Initial simplex edge in the unconstrained space.
const SIMPLEX_STEP: f64 = 0.5;
/// Relative function-spread tolerance for simplex convergence.
const FTOL: f64 = 1e-10;
/// Simplex diameter tolerance.
const XTOL: f64 = 1e-9;

/// Typed forecast failures. None of them affect the collector's state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("horizon must be between 1 and {max}, got {horizon}")]
    InvalidHorizon { horizon: usize, max: usize },

    #[error("insufficient data: have {have} points, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("model fit failed: {0}")]
    FitFailure(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),
}

impl ForecastError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidHorizon { .. } => "invalid_horizon",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::FitFailure(_) => "fit_failure",
            Self::UnknownMetric(_) => "unknown_metric",
        }
    }
}

/// One projected step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastStep {
    /// 1-based distance from the last observation.
    pub step: usize,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Fitted model and projections for one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub key: MetricKey,
    pub order: ArimaOrder,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    /// Mean of the differenced series.
    pub mean: f64,
    /// Residual standard deviation.
    pub sigma: f64,
    pub confidence: f64,
    /// Observations used for the fit, after bucketing.
    pub points_used: usize,
    pub steps: Vec<ForecastStep>,
}

/// Stateless ARIMA forecaster.
#[derive(Debug, Clone)]
pub struct ForecastEngine {
    cfg: ForecastConfig,
    z: f64,
}

impl ForecastEngine {
    pub fn new(cfg: ForecastConfig) -> Self {
        let z = normal_quantile(0.5 + cfg.confidence / 2.0);
        Self { cfg, z }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.cfg
    }

    /// Forecasts from timestamped points, bucketing first when configured.
    pub fn forecast(
        &self,
        key: &MetricKey,
        points: &[Point],
        horizon: usize,
    ) -> Result<ForecastResult, ForecastError> {
        match self.cfg.bucket {
            Some(bucket) => {
                let values = bucket_means(points, bucket);
                self.forecast_values(key, &values, horizon)
            }
            None => {
                let values: Vec<f64> = points.iter().map(|p| p.value).collect();
                self.forecast_values(key, &values, horizon)
            }
        }
    }

    /// Forecasts an evenly spaced series.
    pub fn forecast_values(
        &self,
        key: &MetricKey,
        series: &[f64],
        horizon: usize,
    ) -> Result<ForecastResult, ForecastError> {
        if horizon == 0 || horizon > self.cfg.max_horizon {
            return Err(ForecastError::InvalidHorizon {
                horizon,
                max: self.cfg.max_horizon,
            });
        }

        let ArimaOrder { p, d, q } = self.cfg.order;
        let need = self.cfg.min_points.max(p + d + q + 2);
        if series.len() < need {
            return Err(ForecastError::InsufficientData {
                have: series.len(),
                need,
            });
        }
        if series.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::FitFailure(
                "series contains non-finite values".to_string(),
            ));
        }

        // levels[k] is the k-th difference; levels[d] is the modelled series.
        let mut levels = vec![series.to_vec()];
        for k in 0..d {
            levels.push(difference(&levels[k]));
        }
        let w = &levels[d];

        let m = w.len() as f64;
        let mean = w.iter().sum::<f64>() / m;
        let variance = w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / m;

        let degenerate = variance <= f64::EPSILON * f64::EPSILON * (1.0 + mean * mean);
        let (ar, ma, sigma, projected) = if degenerate {
            // Constant differences: continue them with certainty.
            (vec![0.0; p], vec![0.0; q], 0.0, vec![mean; horizon])
        } else {
            let z: Vec<f64> = w.iter().map(|x| x - mean).collect();
            let (ar, ma, sigma) = self.fit(&z, p, q)?;
            let projected: Vec<f64> = project(&z, &ar, &ma, horizon)
                .into_iter()
                .map(|x| x + mean)
                .collect();
            (ar, ma, sigma, projected)
        };

        let points = integrate(&levels, projected);
        let psi = psi_weights(&ar, &ma, d, horizon);

        let mut steps = Vec::with_capacity(horizon);
        let mut cumulative = 0.0;
        for (k, point) in points.into_iter().enumerate() {
            cumulative += psi[k] * psi[k];
            let half = self.z * sigma * cumulative.sqrt();
            steps.push(ForecastStep {
                step: k + 1,
                point,
                lower: point - half,
                upper: point + half,
            });
        }

        if steps
            .iter()
            .any(|s| !s.point.is_finite() || !s.lower.is_finite() || !s.upper.is_finite())
        {
            return Err(ForecastError::FitFailure(
                "projection produced non-finite values".to_string(),
            ));
        }

        Ok(ForecastResult {
            key: key.clone(),
            order: self.cfg.order,
            ar,
            ma,
            mean,
            sigma,
            confidence: self.cfg.confidence,
            points_used: series.len(),
            steps,
        })
    }

    /// Fits ARMA(p,q) to a demeaned series. Returns (ar, ma, sigma).
    fn fit(&self, z: &[f64], p: usize, q: usize) -> Result<(Vec<f64>, Vec<f64>, f64), ForecastError> {
        let dims = p + q;
        let coefs = |u: &[f64]| -> (Vec<f64>, Vec<f64>) {
            let c: Vec<f64> = u.iter().map(|x| COEF_BOUND * x.tanh()).collect();
            (c[..p].to_vec(), c[p..].to_vec())
        };

        let (ar, ma) = if dims == 0 {
            (Vec::new(), Vec::new())
        } else {
            let objective = |u: &[f64]| {
                let (ar, ma) = coefs(u);
                css(z, &ar, &ma).0
            };
            let start = vec![0.0; dims];
            let best = nelder_mead(objective, &start, self.cfg.max_iterations).ok_or_else(|| {
                ForecastError::FitFailure(format!(
                    "simplex did not converge in {} iterations",
                    self.cfg.max_iterations
                ))
            })?;
            coefs(&best)
        };

        let (sse, terms) = css(z, &ar, &ma);
        let sigma = (sse / terms as f64).sqrt();
        if !sigma.is_finite() || ar.iter().chain(&ma).any(|c| !c.is_finite()) {
            return Err(ForecastError::FitFailure(
                "fit produced non-finite parameters".to_string(),
            ));
        }

        Ok((ar, ma, sigma))
    }
}

fn difference(xs: &[f64]) -> Vec<f64> {
    xs.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Conditional residuals with pre-sample shocks set to zero.
fn residuals(z: &[f64], ar: &[f64], ma: &[f64]) -> Vec<f64> {
    let p = ar.len();
    let mut e = vec![0.0; z.len()];
    for t in p..z.len() {
        let mut pred = 0.0;
        for (i, phi) in ar.iter().enumerate() {
            pred += phi * z[t - 1 - i];
        }
        for (j, theta) in ma.iter().enumerate() {
            if t > j {
                pred += theta * e[t - 1 - j];
            }
        }
        e[t] = z[t] - pred;
    }
    e
}

/// Conditional sum of squares and the number of terms in it.
fn css(z: &[f64], ar: &[f64], ma: &[f64]) -> (f64, usize) {
    let p = ar.len();
    let e = residuals(z, ar, ma);
    let sse = e[p..].iter().map(|x| x * x).sum();
    (sse, z.len() - p)
}

/// Recursive projection with future shocks at zero.
fn project(z: &[f64], ar: &[f64], ma: &[f64], horizon: usize) -> Vec<f64> {
    let n = z.len();
    let mut path = z.to_vec();
    let mut shocks = residuals(z, ar, ma);
    for _ in 0..horizon {
        let t = path.len();
        let mut next = 0.0;
        for (i, phi) in ar.iter().enumerate() {
            next += phi * path[t - 1 - i];
        }
        for (j, theta) in ma.iter().enumerate() {
            next += theta * shocks[t - 1 - j];
        }
        path.push(next);
        shocks.push(0.0);
    }
    path.split_off(n)
}

/// Undoes `d` rounds of differencing, anchoring each level on its last
/// observed value.
fn integrate(levels: &[Vec<f64>], mut projected: Vec<f64>) -> Vec<f64> {
    for level in levels[..levels.len() - 1].iter().rev() {
        let mut last = level.last().copied().unwrap_or(0.0);
        for x in projected.iter_mut() {
            last += *x;
            *x = last;
        }
    }
    projected
}

/// Psi-weights of `theta(B) / (phi(B) (1 - B)^d)`, `horizon` terms.
fn psi_weights(ar: &[f64], ma: &[f64], d: usize, horizon: usize) -> Vec<f64> {
    // a(B) = (1 - sum phi_i B^i) * (1 - B)^d
    let mut poly = vec![1.0];
    poly.extend(ar.iter().map(|phi| -phi));
    for _ in 0..d {
        let mut next = vec![0.0; poly.len() + 1];
        for (i, c) in poly.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c;
        }
        poly = next;
    }
    let phi_star: Vec<f64> = poly[1..].iter().map(|c| -c).collect();

    let mut psi = vec![0.0; horizon];
    if horizon == 0 {
        return psi;
    }
    psi[0] = 1.0;
    for j in 1..horizon {
        let mut v = if j <= ma.len() { ma[j - 1] } else { 0.0 };
        for (i, phi) in phi_star.iter().enumerate() {
            if i + 1 > j {
                break;
            }
            v += phi * psi[j - 1 - i];
        }
        psi[j] = v;
    }
    psi
}

/// Deterministic Nelder–Mead minimiser. Returns `None` when the simplex
/// fails to converge within `max_iter` iterations.
fn nelder_mead<F>(f: F, start: &[f64], max_iter: usize) -> Option<Vec<f64>>
where
    F: Fn(&[f64]) -> f64,
{
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let n = start.len();
    let mut simplex: Vec<Vec<f64>> = vec![start.to_vec()];
    for i in 0..n {
        let mut v = start.to_vec();
        v[i] += SIMPLEX_STEP;
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| f(v)).collect();

    let along = |from: &[f64], to: &[f64], t: f64| -> Vec<f64> {
        from.iter().zip(to).map(|(a, b)| a + t * (b - a)).collect()
    };

    for _ in 0..max_iter {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let best = values[0];
        let worst = values[n];
        let spread = (worst - best).abs();
        let diameter = simplex[1..]
            .iter()
            .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        if best.is_finite() && (spread <= FTOL * (1.0 + best.abs()) || diameter <= XTOL) {
            return Some(simplex.swap_remove(0));
        }

        let mut centroid = vec![0.0; n];
        for v in &simplex[..n] {
            for (c, x) in centroid.iter_mut().zip(v) {
                *c += x / n as f64;
            }
        }

        let reflected = along(&centroid, &simplex[n], -ALPHA);
        let fr = f(&reflected);

        if fr < best {
            let expanded = along(&centroid, &reflected, GAMMA);
            let fe = f(&expanded);
            if fe < fr {
                simplex[n] = expanded;
                values[n] = fe;
            } else {
                simplex[n] = reflected;
                values[n] = fr;
            }
            continue;
        }

        if fr < values[n - 1] {
            simplex[n] = reflected;
            values[n] = fr;
            continue;
        }

        let (contracted, accept_below) = if fr < worst {
            (along(&centroid, &reflected, RHO), fr)
        } else {
            (along(&centroid, &simplex[n], RHO), worst)
        };
        let fc = f(&contracted);
        if fc < accept_below {
            simplex[n] = contracted;
            values[n] = fc;
            continue;
        }

        let anchor = simplex[0].clone();
        for i in 1..=n {
            simplex[i] = along(&anchor, &simplex[i], SIGMA);
            values[i] = f(&simplex[i]);
        }
    }

    None
}

/// Averages points per `bucket`, aligned to the Unix epoch. Empty buckets
/// are skipped.
pub fn bucket_means(points: &[Point], bucket: Duration) -> Vec<f64> {
    let width = i64::try_from(bucket.as_nanos()).unwrap_or(i64::MAX).max(1);
    let mut sums: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    for p in points {
        let nanos = p
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| p.timestamp.timestamp_micros().saturating_mul(1_000));
        let entry = sums.entry(nanos.div_euclid(width)).or_insert((0.0, 0));
        entry.0 += p.value;
        entry.1 += 1;
    }
    sums.values().map(|(sum, n)| sum / f64::from(*n)).collect()
}

/// Inverse of the standard normal CDF (Acklam's rational approximation,
/// relative error below 1.2e-9).
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p > 1.0 - P_LOW {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    } else {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}
