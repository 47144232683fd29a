//! Builder API for ergonomic breaker and coordinator configuration

use crate::{
    cache::FallbackCache,
    callbacks::{Callbacks, StateTransition},
    circuit::{CircuitBreaker, CircuitContext},
    classifier::FailureClassifier,
    clock::{Clock, SystemClock},
    config::{CircuitBreakerConfig, EngineConfig, HealthThresholds},
    coordinator::ReliabilityCoordinator,
    errors::ConfigError,
    fallback::{ActionExecutor, FallbackManager},
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: CircuitBreakerConfig,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            clock: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of consecutive failures that opens the circuit
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set the success threshold (successes needed to close from half-open)
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open after the last failure
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Set the time source (defaults to [`SystemClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// Use this to ignore "expected" failures like invalid input, while still
    /// tripping on timeouts and unavailable collaborators.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reliability_engine::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("screen.capture")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Build the circuit breaker, rejecting an invalid configuration
    pub fn try_build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;
        Ok(self.build())
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));

        let context = CircuitContext {
            name: self.name,
            config: self.config,
            clock,
            failure_classifier: self.failure_classifier,
            ..CircuitContext::default()
        };

        CircuitBreaker::with_context_and_callbacks(context, self.callbacks)
    }
}

/// Builder for a [`ReliabilityCoordinator`]
///
/// Transition callbacks and the failure classifier apply to every breaker the
/// coordinator creates.
pub struct CoordinatorBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: None,
            executor: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attempt records retained per key
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Attempt records included in a monitor report
    pub fn monitor_history_len(mut self, len: usize) -> Self {
        self.config.monitor_history_len = len;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.config.health = thresholds;
        self
    }

    /// Set the time source (defaults to [`SystemClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Collaborator that runs alternative-action fallbacks
    pub fn action_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when any circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when any circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when any circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Build the coordinator, rejecting an invalid engine configuration
    pub fn try_build(self) -> Result<ReliabilityCoordinator, ConfigError> {
        self.config.validate()?;
        Ok(self.build())
    }

    /// Build the coordinator
    pub fn build(self) -> ReliabilityCoordinator {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));

        let mut fallback = FallbackManager::new(
            FallbackCache::with_capacity(self.config.cache_capacity),
            clock.clone(),
        );
        if let Some(executor) = self.executor {
            fallback = fallback.with_executor(executor);
        }

        ReliabilityCoordinator::from_parts(
            self.config,
            clock,
            fallback,
            self.callbacks,
            self.failure_classifier,
        )
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::OperationError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("test").build();

        assert_eq!(circuit.state_name(), "Closed");
        assert!(circuit.is_closed());
        assert_eq!(circuit.config(), &CircuitBreakerConfig::default());
    }

    #[test]
    fn test_builder_custom_config() {
        let circuit = CircuitBuilder::new("test")
            .failure_threshold(10)
            .timeout(Duration::from_secs(120))
            .success_threshold(4)
            .jitter_factor(0.5)
            .build();

        let config = circuit.config();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 4);
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.jitter_factor, 0.5);
    }

    #[test]
    fn test_try_build_validates() {
        let result = CircuitBuilder::new("test").failure_threshold(0).try_build();
        assert!(result.is_err());

        let result = CircuitBuilder::new("test").jitter_factor(1.5).try_build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_with_callbacks() {
        let opened = Arc::new(AtomicBool::new(false));
        let opened_clone = opened.clone();

        let mut circuit = CircuitBuilder::new("test")
            .failure_threshold(2)
            .clock(Arc::new(ManualClock::new()))
            .on_open(move |transition| {
                assert_eq!(transition.key, "test");
                opened_clone.store(true, Ordering::SeqCst);
            })
            .build();

        let error = OperationError::unavailable("boom");
        circuit.record_failure(&error, Duration::ZERO);
        circuit.record_failure(&error, Duration::ZERO);

        assert!(opened.load(Ordering::SeqCst));
    }

    #[test]
    fn test_coordinator_builder_validates_engine_config() {
        let result = CoordinatorBuilder::new().history_capacity(0).try_build();
        assert!(result.is_err());

        let coordinator = CoordinatorBuilder::new()
            .history_capacity(20)
            .monitor_history_len(5)
            .cache_capacity(8)
            .try_build()
            .expect("valid engine config");
        assert_eq!(coordinator.engine_config().history_capacity, 20);
        assert_eq!(coordinator.engine_config().monitor_history_len, 5);
    }
}
