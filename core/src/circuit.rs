//! Circuit breaker implementation using state machines
//!
//! The breaker counts consecutive failures in Closed, fails fast while Open and
//! lets calls probe the operation in HalfOpen. Admission and outcome recording
//! are split so a caller can run the operation between them without holding
//! any lock (see [`CircuitBreaker::try_acquire`]).

use crate::{
    callbacks::{Callbacks, StateTransition},
    classifier::{FailureClassifier, FailureContext},
    clock::{Clock, SystemClock},
    config::{CircuitBreakerConfig, duration_millis, option_duration_millis},
    errors::{CircuitError, OperationError},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Public view of the breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Failure bookkeeping shared by the breaker and the machine guards
#[derive(Debug, Default)]
pub struct FailureTally {
    consecutive_failures: AtomicU32,
    last_failure_at: Mutex<Option<Duration>>,
}

impl FailureTally {
    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn last_failure_at(&self) -> Option<Duration> {
        *self.last_failure_at.lock()
    }

    fn increment(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    fn mark_failure(&self, at: Duration) {
        *self.last_failure_at.lock() = Some(at);
    }

    fn clear(&self) {
        self.reset_failures();
        *self.last_failure_at.lock() = None;
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone, Debug)]
pub struct CircuitContext {
    pub name: String,
    pub config: CircuitBreakerConfig,
    pub clock: Arc<dyn Clock>,
    pub tally: Arc<FailureTally>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: CircuitBreakerConfig::default(),
            clock: Arc::new(SystemClock::new()),
            tally: Arc::new(FailureTally::default()),
            failure_classifier: None,
        }
    }
}

impl CircuitContext {
    /// Open timeout for this check, shortened by jitter when configured
    fn open_timeout(&self) -> Duration {
        if self.config.jitter_factor > 0.0 {
            let timeout_ms = self.config.timeout.as_millis() as u64;
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: timeout_ms,
                multiplier: 1.0,
                max_delay_ms: timeout_ms,
            };
            Duration::from_millis(policy.calculate_delay(1, self.config.jitter_factor) as u64)
        } else {
            self.config.timeout
        }
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: u32,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Consecutive failures reached the threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.tally.failures() >= ctx.config.failure_threshold
    }
}

impl Circuit<HalfOpen> {
    /// Any failure during probation reopens
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.consecutive_successes >= ctx.config.success_threshold)
    }
}

impl Circuit<Open> {
    /// Timeout counts from the most recent failure
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let since = ctx
            .tally
            .last_failure_at()
            .or_else(|| self.state_data_open().map(|data| data.opened_at))
            .unwrap_or_default();
        ctx.clock.now().saturating_sub(since) >= ctx.open_timeout()
    }
}

/// Read-only snapshot of a breaker for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(serialize_with = "option_duration_millis::serialize")]
    pub last_failure_time: Option<Duration>,
    #[serde(with = "duration_millis")]
    pub state_changed_time: Duration,
    /// Number of Closed/HalfOpen -> Open transitions since creation or reset
    pub times_opened: u64,
    pub config: CircuitBreakerConfig,
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    machine: DynamicCircuit,
    context: CircuitContext,
    callbacks: Callbacks,
    state_changed_at: Duration,
    times_opened: u64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let context = CircuitContext {
            name: name.into(),
            config,
            clock,
            ..CircuitContext::default()
        };
        Self::with_context_and_callbacks(context, Callbacks::new())
    }

    /// Create a circuit breaker with custom context and callbacks (used by builder)
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());
        let state_changed_at = context.clock.now();

        Self {
            machine,
            context,
            callbacks,
            state_changed_at,
            times_opened: 0,
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.context.config
    }

    /// Decide whether a call may run now
    ///
    /// An open circuit whose timeout has elapsed moves to HalfOpen here and
    /// admits the call. Otherwise an open circuit rejects with the time left
    /// until the next probe is allowed.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        if self.machine.current_state() != "Open" {
            return Ok(());
        }

        if self.machine.handle(CircuitEvent::AttemptReset).is_ok() {
            self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
            return Ok(());
        }

        Err(self.retry_after())
    }

    /// Record a successful call admitted by [`Self::try_acquire`]
    pub fn record_success(&mut self) {
        match self.state() {
            CircuitState::Closed => self.context.tally.reset_failures(),
            CircuitState::HalfOpen => {
                if let Some(data) = self.machine.half_open_data_mut() {
                    data.consecutive_successes += 1;
                }
                if self.machine.handle(CircuitEvent::Close).is_ok() {
                    self.context.tally.reset_failures();
                    self.transitioned(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            // late result of a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record a failed call admitted by [`Self::try_acquire`]
    ///
    /// Returns `false` when the failure classifier decided the error does not
    /// count. A failure arriving while already Open only moves the timeout
    /// origin forward, so concurrent failures never open the circuit twice.
    pub fn record_failure(&mut self, error: &OperationError, duration: Duration) -> bool {
        if let Some(classifier) = &self.context.failure_classifier {
            let ctx = FailureContext {
                circuit_name: &self.context.name,
                error,
                duration,
            };
            if !classifier.should_trip(&ctx) {
                return false;
            }
        }

        self.context.tally.mark_failure(self.context.clock.now());

        match self.state() {
            CircuitState::Closed => {
                self.context.tally.increment();
                if self.machine.handle(CircuitEvent::Trip).is_ok() {
                    self.mark_open(CircuitState::Closed);
                }
            }
            CircuitState::HalfOpen => {
                if self.machine.handle(CircuitEvent::Trip).is_ok() {
                    self.mark_open(CircuitState::HalfOpen);
                }
            }
            CircuitState::Open => {}
        }
        true
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, Fut, T>(&mut self, operation: F) -> Result<T, CircuitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        if let Err(retry_after) = self.try_acquire() {
            warn!(key = %self.context.name, ?retry_after, "circuit open, call rejected");
            return Err(CircuitError::Open {
                circuit: self.context.name.clone(),
                retry_after,
            });
        }

        let start = self.context.clock.now();
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                let duration = self.context.clock.now().saturating_sub(start);
                self.record_failure(&error, duration);
                Err(CircuitError::Execution(error))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.machine.current_state() == "Open"
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.machine.current_state() == "Closed"
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.machine.current_state()
    }

    /// Snapshot of state and counters; never transitions the machine
    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state(),
            failure_count: self.context.tally.failures(),
            success_count: self
                .machine
                .half_open_data()
                .map_or(0, |data| data.consecutive_successes),
            last_failure_time: self.context.tally.last_failure_at(),
            state_changed_time: self.state_changed_at,
            times_opened: self.times_opened,
            config: self.context.config.clone(),
        }
    }

    /// Clear all counters and reset circuit to Closed state
    pub fn reset(&mut self) {
        self.context.tally.clear();
        self.machine = DynamicCircuit::new(self.context.clone());
        self.state_changed_at = self.context.clock.now();
        self.times_opened = 0;
    }

    fn retry_after(&self) -> Duration {
        let since = self
            .context
            .tally
            .last_failure_at()
            .unwrap_or(self.state_changed_at);
        let elapsed = self.context.clock.now().saturating_sub(since);
        self.context.config.timeout.saturating_sub(elapsed)
    }

    /// Apply Open-state bookkeeping (timestamp + callback)
    fn mark_open(&mut self, from: CircuitState) {
        let now = self.context.clock.now();
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = now;
        }
        self.times_opened += 1;
        self.transitioned(from, CircuitState::Open);
    }

    fn transitioned(&mut self, from: CircuitState, to: CircuitState) {
        let at = self.context.clock.now();
        self.state_changed_at = at;
        info!(key = %self.context.name, %from, %to, "circuit state changed");
        self.callbacks.trigger(&StateTransition {
            key: self.context.name.clone(),
            from,
            to,
            at,
        });
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("failures", &self.context.tally.failures())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    fn breaker(
        failure_threshold: u32,
        success_threshold: u32,
        timeout_secs: u64,
    ) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(failure_threshold)
            .with_success_threshold(success_threshold)
            .with_timeout(Duration::from_secs(timeout_secs));
        (CircuitBreaker::new("test", config, clock.clone()), clock)
    }

    fn boom() -> OperationError {
        OperationError::unavailable("boom")
    }

    fn fail(circuit: &mut CircuitBreaker) {
        circuit.record_failure(&boom(), Duration::ZERO);
    }

    fn ctx(failure_threshold: u32, clock: Arc<ManualClock>) -> CircuitContext {
        CircuitContext {
            name: "test_circuit".to_string(),
            config: CircuitBreakerConfig::new()
                .with_failure_threshold(failure_threshold)
                .with_timeout(Duration::from_secs(1)),
            clock,
            ..CircuitContext::default()
        }
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let (circuit, _) = breaker(5, 3, 60);

        assert!(circuit.is_closed());
        assert!(!circuit.is_open());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let (mut circuit, _) = breaker(3, 2, 60);

        fail(&mut circuit);
        fail(&mut circuit);
        assert!(circuit.is_closed());

        fail(&mut circuit);
        assert!(circuit.is_open());
        assert_eq!(circuit.status().times_opened, 1);
    }

    #[test]
    fn test_success_clears_accumulated_failures() {
        let (mut circuit, _) = breaker(3, 2, 60);

        fail(&mut circuit);
        fail(&mut circuit);
        circuit.record_success();
        assert_eq!(circuit.status().failure_count, 0);

        fail(&mut circuit);
        fail(&mut circuit);
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_open_rejects_until_timeout_since_last_failure() {
        let (mut circuit, clock) = breaker(1, 1, 5);

        fail(&mut circuit);
        assert!(circuit.is_open());

        clock.advance(Duration::from_secs(2));
        assert_eq!(circuit.try_acquire(), Err(Duration::from_secs(3)));

        clock.advance(Duration::from_secs(3));
        assert_eq!(circuit.try_acquire(), Ok(()));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_failure_while_open_restarts_timeout_without_reopening() {
        let (mut circuit, clock) = breaker(1, 1, 5);

        fail(&mut circuit);
        clock.advance(Duration::from_secs(4));
        fail(&mut circuit);

        assert_eq!(circuit.status().times_opened, 1);
        clock.advance(Duration::from_secs(2));
        assert_eq!(circuit.try_acquire(), Err(Duration::from_secs(3)));
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let (mut circuit, clock) = breaker(2, 2, 1);

        fail(&mut circuit);
        fail(&mut circuit);
        clock.advance(Duration::from_secs(1));
        circuit.try_acquire().expect("should probe");

        circuit.record_success();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert_eq!(circuit.status().success_count, 1);

        circuit.record_success();
        assert!(circuit.is_closed());
        assert_eq!(circuit.status().failure_count, 0);
        assert_eq!(circuit.status().success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let (mut circuit, clock) = breaker(3, 2, 1);

        for _ in 0..3 {
            fail(&mut circuit);
        }
        clock.advance(Duration::from_secs(1));
        circuit.try_acquire().expect("should probe");
        circuit.record_success();

        fail(&mut circuit);
        assert!(circuit.is_open());
        assert_eq!(circuit.status().times_opened, 2);
        assert_eq!(circuit.status().success_count, 0);

        // next probe starts counting from zero again
        clock.advance(Duration::from_secs(1));
        circuit.try_acquire().expect("should probe again");
        assert_eq!(circuit.status().success_count, 0);
    }

    #[test]
    fn test_status_does_not_transition() {
        let (mut circuit, clock) = breaker(1, 1, 1);

        fail(&mut circuit);
        clock.advance(Duration::from_secs(10));

        let status = circuit.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.last_failure_time, Some(Duration::ZERO));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_reset_clears_state() {
        let (mut circuit, clock) = breaker(2, 1, 60);

        fail(&mut circuit);
        fail(&mut circuit);
        assert!(circuit.is_open());

        clock.advance(Duration::from_secs(7));
        circuit.reset();

        let status = circuit.status();
        assert!(circuit.is_closed());
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.last_failure_time, None);
        assert_eq!(status.state_changed_time, Duration::from_secs(7));
        assert_eq!(status.times_opened, 0);
    }

    #[tokio::test]
    async fn test_call_never_invokes_operation_when_open() {
        let (mut circuit, _) = breaker(1, 1, 60);
        let invocations = AtomicUsize::new(0);

        let result = circuit
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(boom())
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Execution(_))));

        let result = circuit
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>("unreachable")
            })
            .await;

        match result {
            Err(CircuitError::Open { circuit: name, retry_after }) => {
                assert_eq!(name, "test");
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("Expected CircuitError::Open, got {:?}", other),
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_propagates_original_error() {
        let (mut circuit, _) = breaker(5, 1, 60);

        let result = circuit
            .call(|| async { Err::<(), _>(OperationError::timeout("window did not appear")) })
            .await;

        match result {
            Err(CircuitError::Execution(error)) => {
                assert_eq!(error.kind, ErrorKind::Timeout);
                assert_eq!(error.message, "window did not appear");
            }
            other => panic!("Expected CircuitError::Execution, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_classifier_filters_errors() {
        use crate::classifier::IgnoreKindsClassifier;

        let mut circuit = CircuitBreaker::builder("test")
            .failure_threshold(2)
            .clock(Arc::new(ManualClock::new()))
            .failure_classifier(Arc::new(IgnoreKindsClassifier::new([ErrorKind::InvalidInput])))
            .build();

        let invalid = OperationError::new(ErrorKind::InvalidInput, "bad coordinates");
        for _ in 0..5 {
            assert!(!circuit.record_failure(&invalid, Duration::ZERO));
        }
        assert!(circuit.is_closed());
        assert_eq!(circuit.status().last_failure_time, None);

        assert!(circuit.record_failure(&boom(), Duration::ZERO));
        assert!(circuit.record_failure(&boom(), Duration::ZERO));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_state_machine_closed_to_open_transition() {
        let clock = Arc::new(ManualClock::new());
        let ctx = ctx(3, clock);
        let mut circuit = DynamicCircuit::new(ctx.clone());

        let result = circuit.handle(CircuitEvent::Trip);
        assert!(result.is_err(), "Should fail guard when below threshold");

        for _ in 0..3 {
            ctx.tally.increment();
        }

        circuit
            .handle(CircuitEvent::Trip)
            .expect("Should open after reaching threshold");
        assert_eq!(circuit.current_state(), "Open");
    }

    #[test]
    fn test_state_machine_open_to_half_open_transition() {
        let clock = Arc::new(ManualClock::new());
        let ctx = ctx(1, clock.clone());
        ctx.tally.increment();
        ctx.tally.mark_failure(clock.now());

        let mut circuit = DynamicCircuit::new(ctx.clone());
        circuit.handle(CircuitEvent::Trip).expect("Should open");

        let result = circuit.handle(CircuitEvent::AttemptReset);
        assert!(result.is_err(), "Should fail guard when timeout not elapsed");

        clock.advance(Duration::from_secs(1));
        circuit
            .handle(CircuitEvent::AttemptReset)
            .expect("Should reset after timeout");

        assert_eq!(circuit.current_state(), "HalfOpen");
        let data = circuit.half_open_data().expect("Should have HalfOpen data");
        assert_eq!(data.consecutive_successes, 0);

        let result = circuit.handle(CircuitEvent::Close);
        assert!(result.is_err(), "Should fail guard without successes");
    }

    #[test]
    fn test_jitter_shortens_timeout_within_bounds() {
        let clock = Arc::new(ManualClock::new());
        let mut context = ctx(1, clock);
        context.config.jitter_factor = 0.25;

        for _ in 0..50 {
            let timeout = context.open_timeout();
            assert!(timeout >= Duration::from_millis(740), "{:?} below range", timeout);
            assert!(timeout <= Duration::from_secs(1), "{:?} above range", timeout);
        }
    }

    #[test]
    fn test_zero_jitter_produces_constant_timeout() {
        let clock = Arc::new(ManualClock::new());
        let context = ctx(1, clock);

        for _ in 0..10 {
            assert_eq!(context.open_timeout(), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_transition_callbacks_fire_in_order() {
        let clock = Arc::new(ManualClock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (open_seen, half_seen, close_seen) = (seen.clone(), seen.clone(), seen.clone());

        let mut circuit = CircuitBreaker::builder("test")
            .failure_threshold(1)
            .success_threshold(1)
            .timeout(Duration::from_secs(1))
            .clock(clock.clone())
            .on_open(move |t| open_seen.lock().push((t.from, t.to)))
            .on_half_open(move |t| half_seen.lock().push((t.from, t.to)))
            .on_close(move |t| close_seen.lock().push((t.from, t.to)))
            .build();

        fail(&mut circuit);
        clock.advance(Duration::from_secs(1));
        circuit.try_acquire().expect("should probe");
        circuit.record_success();

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_status_serializes_with_upper_snake_state() {
        let (circuit, _) = breaker(5, 3, 60);
        let json = serde_json::to_value(circuit.status()).expect("serializable");

        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["config"]["timeout"], 60_000);
        assert_eq!(json["last_failure_time"], serde_json::Value::Null);
    }
}
