use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration shared by the site and collector roles.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Site role configuration.
    #[serde(default)]
    pub site: SiteConfig,

    /// Collector role configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Site role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Opaque identifier stamped on every outbound record.
    #[serde(default)]
    pub site_id: String,

    /// Collector base URL (e.g., "http://localhost:8000").
    #[serde(default)]
    pub collector_url: String,

    /// Site HTTP listen address. Default: ":8001".
    #[serde(default = "default_site_listen_addr")]
    pub listen_addr: String,

    /// Lowest accepted severity. Default: 0.
    #[serde(default = "default_severity_min")]
    pub severity_min: f64,

    /// Highest accepted severity. Default: 10.
    #[serde(default = "default_severity_max")]
    pub severity_max: f64,

    /// Keywords that raise the risk score when a symptom contains one.
    #[serde(default = "default_high_risk_symptoms")]
    pub high_risk_symptoms: Vec<String>,

    /// Per-metric noise parameters.
    #[serde(default)]
    pub privacy: PrivacyConfig,

    /// Delivery to the collector.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Per-metric privacy parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub risk_score: PrivacyParams,

    #[serde(default)]
    pub severity: PrivacyParams,
}

/// Laplace parameters and optional post-processing clamp for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PrivacyParams {
    /// Privacy budget. Default: 0.5.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Query sensitivity. Default: 1.0.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,

    /// Lower clamp applied after noise.
    #[serde(default)]
    pub clamp_min: Option<f64>,

    /// Upper clamp applied after noise.
    #[serde(default)]
    pub clamp_max: Option<f64>,
}

impl PrivacyParams {
    /// Applies the configured clamp. Clamping is post-processing and does
    /// not weaken the privacy guarantee.
    pub fn clamp(&self, value: f64) -> f64 {
        let value = match self.clamp_min {
            Some(min) => value.max(min),
            None => value,
        };
        match self.clamp_max {
            Some(max) => value.min(max),
            None => value,
        }
    }
}

/// Site-to-collector delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum records per request. Default: 64.
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,

    /// First retry delay after a transport failure. Default: 500ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Retry delay ceiling. Default: 30s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long the delivery loop idles when the queue is empty. Default: 5s.
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,

    /// Maximum queued records (0 = unbounded). Default: 0.
    #[serde(default)]
    pub max_queue_size: usize,

    /// What to do when the queue is full. Default: reject_new.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

/// Behaviour of a full delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new record and surface the error to the caller.
    #[default]
    RejectNew,
    /// Evict the oldest queued record.
    DropOldest,
}

/// Collector role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Collector HTTP listen address. Default: ":8000".
    #[serde(default = "default_collector_listen_addr")]
    pub listen_addr: String,

    /// Digest retention horizon, measured back from a series' newest point.
    /// Default: 24h.
    #[serde(default = "default_dedup_window", with = "humantime_serde")]
    pub dedup_window: Duration,

    /// Maximum digests retained per series. Default: 100000.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Tolerated clock skew for record timestamps. Default: 5m.
    #[serde(default = "default_max_future_skew", with = "humantime_serde")]
    pub max_future_skew: Duration,

    /// Maximum points retained per series. Default: 10000.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Maps site ids onto aggregation groups. Unlisted sites form their own
    /// group named after the site id.
    #[serde(default)]
    pub site_groups: HashMap<String, String>,

    /// Forecast model configuration.
    #[serde(default)]
    pub forecast: ForecastConfig,
}

/// Forecast model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Minimum points required to fit. Default: 10.
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// ARIMA order. Default: (1,1,1).
    #[serde(default)]
    pub order: ArimaOrder,

    /// Two-sided confidence level for bounds. Default: 0.95.
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    /// Optional bucket width; points are averaged per bucket before fitting.
    #[serde(default, with = "humantime_serde")]
    pub bucket: Option<Duration>,

    /// Simplex iteration cap. Default: 1000.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Horizon used when a request names none. Default: 7.
    #[serde(default = "default_horizon")]
    pub default_horizon: usize,

    /// Largest horizon a request may ask for. Default: 365.
    #[serde(default = "default_max_horizon")]
    pub max_horizon: usize,
}

/// ARIMA (p, d, q) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl ArimaOrder {
    pub const MAX_P: usize = 3;
    pub const MAX_D: usize = 2;
    pub const MAX_Q: usize = 3;

    pub const fn new(p: usize, d: usize, q: usize) -> Self {
        Self { p, d, q }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_site_listen_addr() -> String {
    ":8001".to_string()
}

fn default_severity_min() -> f64 {
    0.0
}

fn default_severity_max() -> f64 {
    10.0
}

fn default_high_risk_symptoms() -> Vec<String> {
    ["fever", "difficulty breathing", "chest pain", "confusion"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_epsilon() -> f64 {
    0.5
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_sync_batch_size() -> usize {
    64
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_collector_listen_addr() -> String {
    ":8000".to_string()
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_dedup_capacity() -> usize {
    100_000
}

fn default_max_future_skew() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_history_limit() -> usize {
    10_000
}

fn default_min_points() -> usize {
    10
}

fn default_confidence() -> f64 {
    0.95
}

fn default_max_iterations() -> usize {
    1000
}

fn default_horizon() -> usize {
    7
}

fn default_max_horizon() -> usize {
    365
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            site: SiteConfig::default(),
            collector: CollectorConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_id: String::new(),
            collector_url: String::new(),
            listen_addr: default_site_listen_addr(),
            severity_min: default_severity_min(),
            severity_max: default_severity_max(),
            high_risk_symptoms: default_high_risk_symptoms(),
            privacy: PrivacyConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for PrivacyParams {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            sensitivity: default_sensitivity(),
            clamp_min: None,
            clamp_max: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_sync_batch_size(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            request_timeout: default_request_timeout(),
            idle_interval: default_idle_interval(),
            max_queue_size: 0,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_collector_listen_addr(),
            dedup_window: default_dedup_window(),
            dedup_capacity: default_dedup_capacity(),
            max_future_skew: default_max_future_skew(),
            history_limit: default_history_limit(),
            site_groups: HashMap::new(),
            forecast: ForecastConfig::default(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_points: default_min_points(),
            order: ArimaOrder::default(),
            confidence: default_confidence(),
            bucket: None,
            max_iterations: default_max_iterations(),
            default_horizon: default_horizon(),
            max_horizon: default_max_horizon(),
        }
    }
}

impl Default for ArimaOrder {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate settings shared by both roles. Role-specific required
    /// fields are checked by [`SiteConfig::validate_required`].
    pub fn validate(&self) -> Result<()> {
        self.site.validate().context("invalid site config")?;
        self.collector
            .validate()
            .context("invalid collector config")?;
        Ok(())
    }
}

impl SiteConfig {
    fn validate(&self) -> Result<()> {
        if !self.severity_min.is_finite() || !self.severity_max.is_finite() {
            bail!("severity bounds must be finite");
        }
        if self.severity_max <= self.severity_min {
            bail!(
                "severity_max ({}) must be greater than severity_min ({})",
                self.severity_max,
                self.severity_min
            );
        }
        if self.severity_max <= 0.0 {
            bail!("severity_max must be positive");
        }

        for (name, params) in [
            ("risk_score", &self.privacy.risk_score),
            ("severity", &self.privacy.severity),
        ] {
            crate::privacy::validate_params(params.sensitivity, params.epsilon)
                .with_context(|| format!("privacy.{name}"))?;
            if let (Some(min), Some(max)) = (params.clamp_min, params.clamp_max) {
                if min > max {
                    bail!("privacy.{name}.clamp_min must not exceed clamp_max");
                }
            }
        }

        let sync = &self.sync;
        if sync.batch_size == 0 {
            bail!("sync.batch_size must be positive");
        }
        if sync.initial_backoff.is_zero() {
            bail!("sync.initial_backoff must be positive");
        }
        if sync.max_backoff < sync.initial_backoff {
            bail!("sync.max_backoff must be at least sync.initial_backoff");
        }
        if sync.request_timeout.is_zero() {
            bail!("sync.request_timeout must be positive");
        }
        if sync.idle_interval.is_zero() {
            bail!("sync.idle_interval must be positive");
        }

        Ok(())
    }

    /// Fields only the site role needs.
    pub fn validate_required(&self) -> Result<()> {
        if self.site_id.trim().is_empty() {
            bail!("site.site_id is required");
        }
        if self.collector_url.is_empty() {
            bail!("site.collector_url is required");
        }
        Ok(())
    }
}

impl CollectorConfig {
    fn validate(&self) -> Result<()> {
        if self.dedup_window.is_zero() {
            bail!("dedup_window must be positive");
        }
        if self.dedup_capacity == 0 {
            bail!("dedup_capacity must be positive");
        }
        if self.history_limit == 0 {
            bail!("history_limit must be positive");
        }
        for (site, group) in &self.site_groups {
            if group.trim().is_empty() {
                bail!("site_groups entry for {site} has an empty group");
            }
        }

        let f = &self.forecast;
        if f.order.p > ArimaOrder::MAX_P || f.order.d > ArimaOrder::MAX_D || f.order.q > ArimaOrder::MAX_Q
        {
            bail!(
                "forecast.order ({},{},{}) exceeds maximum ({},{},{})",
                f.order.p,
                f.order.d,
                f.order.q,
                ArimaOrder::MAX_P,
                ArimaOrder::MAX_D,
                ArimaOrder::MAX_Q
            );
        }
        if !(f.confidence > 0.0 && f.confidence < 1.0) {
            bail!("forecast.confidence must be in (0, 1)");
        }
        if f.min_points == 0 {
            bail!("forecast.min_points must be positive");
        }
        if f.max_iterations == 0 {
            bail!("forecast.max_iterations must be positive");
        }
        if f.default_horizon == 0 || f.default_horizon > f.max_horizon {
            bail!("forecast.default_horizon must be in 1..=max_horizon");
        }
        if matches!(f.bucket, Some(b) if b.is_zero()) {
            bail!("forecast.bucket must be positive when set");
        }

        Ok(())
    }

    /// Aggregation group for a site.
    pub fn group_for<'a>(&'a self, site_id: &'a str) -> &'a str {
        self.site_groups
            .get(site_id)
            .map(String::as_str)
            .unwrap_or(site_id)
    }
}
