//! Configuration for breakers, retries, fallbacks and the coordinator
//!
//! Every struct serializes durations as integer milliseconds so policies can be
//! shipped as JSON by the caller-side endpoint that configures operations.

use crate::errors::{ConfigError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

/// Circuit breaker configuration
///
/// Immutable once a breaker is built from it; reconfiguring replaces the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes in HalfOpen required to close the circuit
    pub success_threshold: u32,

    /// Time since the last failure before an open circuit admits a probe
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Jitter factor for the open timeout (0.0 = exact, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("failure_threshold", 1, self.failure_threshold as u64)?;
        at_least("success_threshold", 1, self.success_threshold as u64)?;
        non_zero("timeout", self.timeout)?;
        unit_interval("jitter_factor", self.jitter_factor)
    }
}

/// Delay schedule between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base_delay * (n + 1)`
    Linear,
    /// `base_delay * multiplier^n`
    Exponential,
    /// `base_delay * fib(n + 1)`
    Fibonacci,
    /// `custom_delays[min(n, len - 1)]`
    Custom,
}

/// Retry policy for one operation key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    pub strategy: RetryStrategy,

    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound applied before jitter
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    /// Add a uniform ±10% offset to every delay
    pub jitter: bool,

    /// When set, only these kinds are retried; anything else stops the loop
    pub retryable_errors: Option<HashSet<ErrorKind>>,

    /// Delay table for [`RetryStrategy::Custom`]; the last entry repeats
    #[serde(with = "duration_millis_vec")]
    pub custom_delays: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_errors: None,
            custom_delays: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no delay; used when a key has no retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            jitter: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restrict retries to the given error kind (may be called repeatedly)
    pub fn with_retryable_error(mut self, kind: ErrorKind) -> Self {
        self.retryable_errors
            .get_or_insert_with(HashSet::new)
            .insert(kind);
        self
    }

    /// Switch to [`RetryStrategy::Custom`] with the given delay table
    pub fn with_custom_delays(mut self, delays: Vec<Duration>) -> Self {
        self.strategy = RetryStrategy::Custom;
        self.custom_delays = delays;
        self
    }

    /// Whether a failure of this kind may be attempted again
    pub fn is_retryable(&self, kind: &ErrorKind) -> bool {
        self.retryable_errors
            .as_ref()
            .is_none_or(|kinds| kinds.contains(kind))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("max_attempts", 1, self.max_attempts as u64)?;
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "backoff_multiplier",
                range: "(0, inf)",
                value: self.backoff_multiplier,
            });
        }
        if self.strategy == RetryStrategy::Custom && self.custom_delays.is_empty() {
            return Err(ConfigError::MissingCustomDelays);
        }
        Ok(())
    }
}

/// Discriminant of a [`FallbackConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackType {
    AlternativeAction,
    CachedResult,
    DefaultValue,
    SkipStep,
}

impl FallbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackType::AlternativeAction => "alternative_action",
            FallbackType::CachedResult => "cached_result",
            FallbackType::DefaultValue => "default_value",
            FallbackType::SkipStep => "skip_step",
        }
    }
}

/// Action handed to the [`crate::ActionExecutor`] when the primary call fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeAction {
    /// Collaborator action name, e.g. `"input.keyboard_shortcut"`
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AlternativeAction {
    pub fn new(action: impl Into<String>, parameters: Value) -> Self {
        Self {
            action: action.into(),
            parameters,
        }
    }
}

/// What to substitute when the protected call ultimately fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackConfig {
    AlternativeAction {
        action: AlternativeAction,
    },
    CachedResult {
        #[serde(with = "duration_millis", default = "default_cache_ttl")]
        cache_ttl: Duration,
    },
    DefaultValue {
        value: Value,
    },
    SkipStep,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

impl FallbackConfig {
    pub fn alternative_action(action: AlternativeAction) -> Self {
        FallbackConfig::AlternativeAction { action }
    }

    pub fn cached_result(cache_ttl: Duration) -> Self {
        FallbackConfig::CachedResult { cache_ttl }
    }

    pub fn default_value(value: Value) -> Self {
        FallbackConfig::DefaultValue { value }
    }

    pub fn skip_step() -> Self {
        FallbackConfig::SkipStep
    }

    pub fn fallback_type(&self) -> FallbackType {
        match self {
            FallbackConfig::AlternativeAction { .. } => FallbackType::AlternativeAction,
            FallbackConfig::CachedResult { .. } => FallbackType::CachedResult,
            FallbackConfig::DefaultValue { .. } => FallbackType::DefaultValue,
            FallbackConfig::SkipStep => FallbackType::SkipStep,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            FallbackConfig::AlternativeAction { action } if action.action.trim().is_empty() => {
                Err(ConfigError::MissingFallbackField {
                    fallback: FallbackType::AlternativeAction.as_str(),
                    field: "action",
                })
            }
            FallbackConfig::CachedResult { cache_ttl } => non_zero("cache_ttl", *cache_ttl),
            _ => Ok(()),
        }
    }
}

/// Full reliability policy for one operation key
///
/// Absent parts leave whatever is already configured for the key untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationPolicy {
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub fallback: Option<FallbackConfig>,
}

impl OperationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(fallback) = &self.fallback {
            fallback.validate()?;
        }
        Ok(())
    }
}

/// Success-rate, error-rate and latency bounds for health classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub healthy_min_success_rate: f64,
    pub healthy_max_error_rate: f64,
    #[serde(with = "duration_millis")]
    pub healthy_max_latency: Duration,
    pub degraded_min_success_rate: f64,
    pub degraded_max_error_rate: f64,
    #[serde(with = "duration_millis")]
    pub degraded_max_latency: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            healthy_min_success_rate: 0.95,
            healthy_max_error_rate: 0.05,
            healthy_max_latency: Duration::from_millis(1000),
            degraded_min_success_rate: 0.80,
            degraded_max_error_rate: 0.20,
            degraded_max_latency: Duration::from_millis(5000),
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("healthy_min_success_rate", self.healthy_min_success_rate)?;
        unit_interval("healthy_max_error_rate", self.healthy_max_error_rate)?;
        unit_interval("degraded_min_success_rate", self.degraded_min_success_rate)?;
        unit_interval("degraded_max_error_rate", self.degraded_max_error_rate)
    }
}

/// Coordinator-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry attempt records retained per key
    pub history_capacity: usize,

    /// Records returned by `monitor`
    pub monitor_history_len: usize,

    /// Maximum entries in the fallback result cache
    pub cache_capacity: usize,

    pub health: HealthThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            monitor_history_len: 10,
            cache_capacity: 1024,
            health: HealthThresholds::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("history_capacity", 1, self.history_capacity as u64)?;
        at_least("cache_capacity", 1, self.cache_capacity as u64)?;
        self.health.validate()
    }
}

fn at_least(field: &'static str, min: u64, value: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum { field, min, value });
    }
    Ok(())
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(())
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            range: "[0, 1]",
            value,
        });
    }
    Ok(())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod duration_millis_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

pub(crate) mod option_duration_millis {
    use serde::{Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }
}
