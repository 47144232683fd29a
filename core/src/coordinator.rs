//! Registry of protected operations and the composed reliability call
//!
//! Every operation key owns one [`OperationState`] behind its own mutex. The
//! registry itself is a sharded map, so independent keys never contend, and
//! the per-key mutex is never held while the operation or a retry sleep is
//! pending.

use crate::{
    cache::fingerprint,
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext, CircuitState, CircuitStatus, FailureTally},
    classifier::FailureClassifier,
    clock::Clock,
    config::{
        CircuitBreakerConfig, EngineConfig, FallbackConfig, OperationPolicy, RetryConfig,
        duration_millis, option_duration_millis,
    },
    errors::{OperationError, ReliabilityError},
    fallback::{FallbackManager, Outcome},
    health::{HealthEvaluator, HealthStatus, OperationHealth, SystemHealth},
    history::{AttemptHistory, RetryAttemptRecord},
    metrics::OperationMetrics,
    retry::{RetryError, RetryMechanism},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything the engine tracks for one operation key
#[derive(Debug)]
struct OperationState {
    retry: Option<RetryConfig>,
    fallback: Option<FallbackConfig>,
    breaker: Option<CircuitBreaker>,
    history: AttemptHistory,
    metrics: OperationMetrics,
}

impl OperationState {
    fn new(history_capacity: usize) -> Self {
        Self {
            retry: None,
            fallback: None,
            breaker: None,
            history: AttemptHistory::with_capacity(history_capacity),
            metrics: OperationMetrics::new(),
        }
    }

    fn policy(&self) -> OperationPolicy {
        OperationPolicy {
            retry: self.retry.clone(),
            circuit_breaker: self.breaker.as_ref().map(|b| b.config().clone()),
            fallback: self.fallback.clone(),
        }
    }
}

/// Monitoring snapshot for one operation key
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub key: String,
    pub policy: OperationPolicy,
    pub circuit_breaker: Option<CircuitStatus>,
    pub metrics: OperationMetrics,
    pub health: OperationHealth,
    /// Most recent attempts, oldest first
    pub recent_attempts: Vec<RetryAttemptRecord>,
    #[serde(serialize_with = "option_duration_millis::serialize")]
    pub last_success_ago: Option<Duration>,
    #[serde(serialize_with = "option_duration_millis::serialize")]
    pub last_failure_ago: Option<Duration>,
}

/// Engine-wide overview across every operation key
#[derive(Debug, Clone, Serialize)]
pub struct ReliabilitySummary {
    pub operations_monitored: usize,
    pub circuit_breakers: BTreeMap<String, CircuitStatus>,
    pub open_breakers: usize,
    pub half_open_breakers: usize,
    pub total_operations: u64,
    pub overall_success_rate: f64,
    /// Mean of the per-key average latencies
    #[serde(with = "duration_millis")]
    pub average_latency: Duration,
    pub fallback_cache_entries: usize,
    /// No breaker is currently open
    pub system_stable: bool,
}

/// Composes circuit breaker, retry and fallback around caller operations
///
/// Construct one per process and share it (it is `Send + Sync`); all state
/// lives in the instance.
#[derive(Debug)]
pub struct ReliabilityCoordinator {
    operations: DashMap<String, Arc<Mutex<OperationState>>>,
    fallback: FallbackManager,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    health: HealthEvaluator,
    callbacks: Callbacks,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl ReliabilityCoordinator {
    /// Coordinator with default settings and the system clock
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> crate::builder::CoordinatorBuilder {
        crate::builder::CoordinatorBuilder::new()
    }

    pub(crate) fn from_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        fallback: FallbackManager,
        callbacks: Callbacks,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
    ) -> Self {
        Self {
            operations: DashMap::new(),
            health: HealthEvaluator::new(config.health.clone()),
            fallback,
            clock,
            config,
            callbacks,
            failure_classifier,
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store or replace the parts of `policy` that are present
    ///
    /// Supplying a circuit breaker config replaces the breaker, which starts
    /// Closed. Nothing is changed when any part fails validation.
    pub fn configure(&self, key: &str, policy: OperationPolicy) -> Result<(), ReliabilityError> {
        policy
            .validate()
            .map_err(|source| ReliabilityError::Configuration {
                key: key.to_string(),
                source,
            })?;

        let entry = self.entry(key);
        let mut state = entry.lock();

        if let Some(retry) = policy.retry {
            state.retry = Some(retry);
        }
        if let Some(breaker) = policy.circuit_breaker {
            state.breaker = Some(self.build_breaker(key, breaker));
        }
        if let Some(fallback) = policy.fallback {
            state.fallback = Some(fallback);
        }

        debug!(
            key,
            retry = state.retry.is_some(),
            circuit_breaker = state.breaker.is_some(),
            fallback = state.fallback.is_some(),
            "operation configured"
        );
        Ok(())
    }

    /// Run `operation` as `fallback(circuit_breaker(retry(operation)))`
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<Outcome, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, OperationError>>,
    {
        self.run(key, &Value::Null, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`Self::execute`], keying the cached-result fallback by `args`
    pub async fn execute_with_args<F, Fut>(
        &self,
        key: &str,
        args: &Value,
        operation: F,
    ) -> Result<Outcome, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, OperationError>>,
    {
        self.run(key, args, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`Self::execute`], stopping before the next attempt once `cancel` fires
    pub async fn execute_with_cancel<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<Outcome, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, OperationError>>,
    {
        self.run(key, &Value::Null, cancel, operation).await
    }

    async fn run<F, Fut>(
        &self,
        key: &str,
        args: &Value,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<Outcome, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, OperationError>>,
    {
        let entry = self.entry(key);
        let (retry_config, fallback_config) = {
            let state = entry.lock();
            (
                state.retry.clone().unwrap_or_else(RetryConfig::no_retry),
                state.fallback.clone(),
            )
        };

        let args = fingerprint(args);
        let start = self.clock.now();
        let retry = RetryMechanism::new(retry_config, self.clock.clone());
        let primary = self.guarded(key, &entry, &retry, cancel, operation);
        let outcome = self
            .fallback
            .execute_with_fallback(key, &args, fallback_config.as_ref(), primary)
            .await;

        let now = self.clock.now();
        let latency = now.saturating_sub(start);
        let mut state = entry.lock();
        let rejected = match &outcome {
            Ok(Outcome::Primary(_)) => {
                state.metrics.record_success(latency, now);
                false
            }
            Ok(rescued) => {
                state.metrics.record_failure(latency, now);
                state.metrics.record_fallback();
                rescued.cause().is_some_and(was_rejected)
            }
            Err(error) => {
                state.metrics.record_failure(latency, now);
                was_rejected(error)
            }
        };
        if rejected {
            state.metrics.record_rejected();
        }

        outcome
    }

    /// Circuit breaker around the retry loop
    async fn guarded<F, Fut>(
        &self,
        key: &str,
        entry: &Mutex<OperationState>,
        retry: &RetryMechanism,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<Value, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, OperationError>>,
    {
        let admission = entry.lock().breaker.as_mut().map(CircuitBreaker::try_acquire);
        let guarded = match admission {
            Some(Err(retry_after)) => {
                warn!(key, ?retry_after, "circuit open, call rejected");
                return Err(ReliabilityError::CircuitOpen {
                    key: key.to_string(),
                    retry_after,
                });
            }
            Some(Ok(())) => true,
            None => false,
        };

        let start = self.clock.now();
        let result = retry
            .execute_with_retry(operation, |record| entry.lock().history.record(record), cancel)
            .await;

        match result {
            Ok(value) => {
                if guarded && let Some(breaker) = entry.lock().breaker.as_mut() {
                    breaker.record_success();
                }
                Ok(value)
            }
            Err(RetryError::Cancelled { attempts, .. }) => Err(ReliabilityError::Cancelled {
                key: key.to_string(),
                attempts,
            }),
            Err(RetryError::Exhausted { attempts, error })
            | Err(RetryError::NonRetryable { attempts, error }) => {
                if guarded && let Some(breaker) = entry.lock().breaker.as_mut() {
                    let duration = self.clock.now().saturating_sub(start);
                    breaker.record_failure(&error, duration);
                }
                Err(ReliabilityError::Operation {
                    key: key.to_string(),
                    attempts,
                    source: error,
                })
            }
        }
    }

    /// Monitoring snapshot, or `None` for a key never configured or executed
    pub fn monitor(&self, key: &str) -> Option<OperationReport> {
        let entry = self.operations.get(key)?.value().clone();
        let state = entry.lock();
        let now = self.clock.now();

        Some(OperationReport {
            key: key.to_string(),
            policy: state.policy(),
            circuit_breaker: state.breaker.as_ref().map(CircuitBreaker::status),
            metrics: state.metrics.clone(),
            health: self.health.describe(&state.metrics),
            recent_attempts: state.history.recent(self.config.monitor_history_len),
            last_success_ago: state.metrics.last_success_time.map(|t| now.saturating_sub(t)),
            last_failure_ago: state.metrics.last_failure_time.map(|t| now.saturating_sub(t)),
        })
    }

    /// Breaker back to Closed, attempt history cleared, metrics zeroed
    ///
    /// The key and its configuration stay registered. Returns `false` for an
    /// unknown key.
    pub fn reset(&self, key: &str) -> bool {
        let Some(entry) = self.operations.get(key).map(|e| e.value().clone()) else {
            return false;
        };
        let mut state = entry.lock();
        if let Some(breaker) = state.breaker.as_mut() {
            breaker.reset();
        }
        state.history.clear();
        state.metrics.reset();
        debug!(key, "operation state reset");
        true
    }

    /// Every registered operation key, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn circuit_state(&self, key: &str) -> Option<CircuitState> {
        let entry = self.operations.get(key)?.value().clone();
        let state = entry.lock();
        state.breaker.as_ref().map(CircuitBreaker::state)
    }

    pub fn summary(&self) -> ReliabilitySummary {
        let snapshots = self.snapshot();

        let circuit_breakers: BTreeMap<String, CircuitStatus> = snapshots
            .iter()
            .filter_map(|(key, _, status)| status.clone().map(|s| (key.clone(), s)))
            .collect();
        let count_in = |wanted: CircuitState| {
            circuit_breakers
                .values()
                .filter(|status| status.state == wanted)
                .count()
        };
        let open_breakers = count_in(CircuitState::Open);
        let half_open_breakers = count_in(CircuitState::HalfOpen);

        let total_operations: u64 = snapshots.iter().map(|(_, m, _)| m.total_requests).sum();
        let successful: u64 = snapshots.iter().map(|(_, m, _)| m.successful_requests).sum();
        let overall_success_rate = if total_operations == 0 {
            1.0
        } else {
            successful as f64 / total_operations as f64
        };
        let average_latency = if snapshots.is_empty() {
            Duration::ZERO
        } else {
            snapshots
                .iter()
                .map(|(_, m, _)| m.average_latency)
                .sum::<Duration>()
                / snapshots.len() as u32
        };

        ReliabilitySummary {
            operations_monitored: snapshots.len(),
            circuit_breakers,
            open_breakers,
            half_open_breakers,
            total_operations,
            overall_success_rate,
            average_latency,
            fallback_cache_entries: self.fallback.cache().len(),
            system_stable: open_breakers == 0,
        }
    }

    /// Health of the given keys, or of every key when `keys` is `None`
    ///
    /// Unknown keys report as healthy with no traffic.
    pub fn health_check(&self, keys: Option<&[&str]>) -> SystemHealth {
        let metrics: Vec<(String, OperationMetrics)> = match keys {
            Some(keys) => keys
                .iter()
                .map(|key| {
                    let metrics = self
                        .operations
                        .get(*key)
                        .map(|e| e.value().lock().metrics.clone())
                        .unwrap_or_default();
                    (key.to_string(), metrics)
                })
                .collect(),
            None => self
                .snapshot()
                .into_iter()
                .map(|(key, metrics, _)| (key, metrics))
                .collect(),
        };

        self.health
            .report(metrics.iter().map(|(key, m)| (key.as_str(), m)))
    }

    /// Aggregate status across every key
    pub fn system_status(&self) -> HealthStatus {
        let snapshots = self.snapshot();
        self.health
            .evaluate_system(snapshots.iter().map(|(_, metrics, _)| metrics))
    }

    /// Consistent per-key copies, taken one key lock at a time
    fn snapshot(&self) -> Vec<(String, OperationMetrics, Option<CircuitStatus>)> {
        let entries: Vec<(String, Arc<Mutex<OperationState>>)> = self
            .operations
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        entries
            .into_iter()
            .map(|(key, entry)| {
                let state = entry.lock();
                let status = state.breaker.as_ref().map(CircuitBreaker::status);
                (key, state.metrics.clone(), status)
            })
            .collect()
    }

    /// Lazily create the state for `key`; concurrent callers get the same entry
    fn entry(&self, key: &str) -> Arc<Mutex<OperationState>> {
        if let Some(existing) = self.operations.get(key) {
            return existing.value().clone();
        }
        self.operations
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(OperationState::new(self.config.history_capacity)))
            })
            .value()
            .clone()
    }

    fn build_breaker(&self, key: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let context = CircuitContext {
            name: key.to_string(),
            config,
            clock: self.clock.clone(),
            tally: Arc::new(FailureTally::default()),
            failure_classifier: self.failure_classifier.clone(),
        };
        CircuitBreaker::with_context_and_callbacks(context, self.callbacks.clone())
    }
}

impl Default for ReliabilityCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn was_rejected(error: &ReliabilityError) -> bool {
    match error {
        ReliabilityError::CircuitOpen { .. } => true,
        ReliabilityError::FallbackExhausted { primary, .. } => primary.is_circuit_open(),
        _ => false,
    }
}
