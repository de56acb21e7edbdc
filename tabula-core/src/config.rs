//! Configuration types
//!
//! Every section has working defaults. Values can be overridden from
//! `TABULA_*` environment variables or a TOML document; durations are written
//! in milliseconds in both.

use crate::{ConfigError, IsolationLevel};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Bounds applied to each transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Maximum time to wait for a transaction slot.
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,
    /// Maximum time the transaction body may run.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub isolation_level: IsolationLevel,
    /// Timeout used by bulk row import instead of `timeout`.
    #[serde(rename = "bulk_import_timeout_ms", with = "duration_ms")]
    pub bulk_import_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
            isolation_level: IsolationLevel::ReadCommitted,
            bulk_import_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry configuration for conflicting transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep after the given failed attempt (1-indexed):
    /// `initial_backoff × multiplier^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = (self.backoff_multiplier as f64).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Capacity and maintenance settings for the in-process cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in.
    pub max_entries: usize,
    /// Share of entries evicted (oldest inserted first) when full.
    pub eviction_fraction: f64,
    /// How often the background sweep removes expired entries.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            eviction_fraction: 0.1,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_eviction_fraction(mut self, fraction: f64) -> Self {
        self.eviction_fraction = fraction;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Number of entries removed by one eviction round (at least one).
    pub fn eviction_batch(&self) -> usize {
        ((self.max_entries as f64 * self.eviction_fraction).ceil() as usize).max(1)
    }
}

/// Order in which cells are sampled for a type-change forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// First N cells in row-creation order. Reproducible, but biased towards
    /// the oldest rows.
    #[default]
    Positional,
    /// N cells drawn uniformly at random.
    Random,
}

impl FromStr for SamplingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positional" => Ok(SamplingStrategy::Positional),
            "random" => Ok(SamplingStrategy::Random),
            other => Err(ConfigError::InvalidValue {
                field: "analyzer.sampling".to_string(),
                value: other.to_string(),
                reason: "expected positional or random".to_string(),
            }),
        }
    }
}

/// Settings for type-change risk analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub sample_size: usize,
    pub max_examples: usize,
    /// Above this total/sample ratio the forecast carries a warning.
    pub extrapolation_warning_ratio: f64,
    pub sampling: SamplingStrategy,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_size: 500,
            max_examples: 5,
            extrapolation_warning_ratio: 1.5,
            sampling: SamplingStrategy::Positional,
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulaConfig {
    pub transaction: TransactionConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub analyzer: AnalyzerConfig,
}

impl TabulaConfig {
    /// Build a configuration from `TABULA_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "TABULA_TX_MAX_WAIT_MS")? {
            config.transaction.max_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TABULA_TX_TIMEOUT_MS")? {
            config.transaction.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TABULA_TX_BULK_IMPORT_TIMEOUT_MS")? {
            config.transaction.bulk_import_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = lookup("TABULA_TX_ISOLATION") {
            config.transaction.isolation_level = parse_isolation(&level)?;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "TABULA_RETRY_MAX")? {
            config.retry.max_retries = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TABULA_RETRY_INITIAL_BACKOFF_MS")? {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "TABULA_CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TABULA_CACHE_SWEEP_INTERVAL_MS")? {
            config.cache.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "TABULA_ANALYZER_SAMPLE_SIZE")? {
            config.analyzer.sample_size = n;
        }
        if let Some(strategy) = lookup("TABULA_ANALYZER_SAMPLING") {
            config.analyzer.sampling = strategy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transaction.timeout.is_zero() {
            return Err(invalid("transaction.timeout", "0", "must be greater than zero"));
        }
        if self.transaction.max_wait.is_zero() {
            return Err(invalid("transaction.max_wait", "0", "must be greater than zero"));
        }
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "0", "at least one attempt is required"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                &self.retry.backoff_multiplier.to_string(),
                "must be at least 1.0",
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "0", "must be greater than zero"));
        }
        if !(self.cache.eviction_fraction > 0.0 && self.cache.eviction_fraction <= 1.0) {
            return Err(invalid(
                "cache.eviction_fraction",
                &self.cache.eviction_fraction.to_string(),
                "must be in (0, 1]",
            ));
        }
        if self.analyzer.sample_size == 0 {
            return Err(invalid("analyzer.sample_size", "0", "must be greater than zero"));
        }
        if self.analyzer.extrapolation_warning_ratio < 1.0 {
            return Err(invalid(
                "analyzer.extrapolation_warning_ratio",
                &self.analyzer.extrapolation_warning_ratio.to_string(),
                "must be at least 1.0",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(key, &raw, "not a valid number")),
    }
}

fn parse_isolation(raw: &str) -> Result<IsolationLevel, ConfigError> {
    match raw.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
        "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
        "read_committed" => Ok(IsolationLevel::ReadCommitted),
        "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
        "serializable" => Ok(IsolationLevel::Serializable),
        _ => Err(invalid("TABULA_TX_ISOLATION", raw, "unknown isolation level")),
    }
}
