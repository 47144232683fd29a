//! Reliability Engine - circuit breakers, retries and fallbacks for fallible operations
//!
//! This crate protects calls to operations that may fail transiently or persistently:
//! - State machine for circuit breaker lifecycle (Closed → Open → HalfOpen)
//! - Linear, exponential, fibonacci and custom retry backoff with jitter
//! - Alternative-action, cached-result, default-value and skip-step fallbacks
//! - Per-operation metrics and healthy/degraded/unhealthy classification
//! - Monotonic time tracking to prevent NTP clock skew issues
//!
//! # Example
//!
//! ```rust
//! use reliability_engine::{
//!     CircuitBreakerConfig, FallbackConfig, OperationPolicy, ReliabilityCoordinator, RetryConfig,
//! };
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test_block_on(async {
//! let coordinator = ReliabilityCoordinator::builder()
//!     .on_open(|t| println!("circuit {} opened", t.key))
//!     .build();
//!
//! coordinator
//!     .configure(
//!         "screen.capture",
//!         OperationPolicy::new()
//!             .with_retry(
//!                 RetryConfig::new()
//!                     .with_max_attempts(3)
//!                     .with_base_delay(Duration::from_millis(10)),
//!             )
//!             .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(5))
//!             .with_fallback(FallbackConfig::default_value(json!(null))),
//!     )
//!     .expect("valid policy");
//!
//! let outcome = coordinator
//!     .execute("screen.capture", || async { Ok(json!({"png": "..."})) })
//!     .await
//!     .expect("capture succeeds");
//! assert!(outcome.is_primary());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod fallback;
pub mod health;
pub mod history;
pub mod metrics;
pub mod retry;

pub use builder::{CircuitBuilder, CoordinatorBuilder};
pub use cache::{FallbackCache, fingerprint};
pub use callbacks::{Callbacks, StateTransition};
pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus};
pub use classifier::{
    DefaultClassifier, FailureClassifier, FailureContext, IgnoreKindsClassifier,
    PredicateClassifier,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AlternativeAction, CircuitBreakerConfig, EngineConfig, FallbackConfig, FallbackType,
    HealthThresholds, OperationPolicy, RetryConfig, RetryStrategy,
};
pub use coordinator::{OperationReport, ReliabilityCoordinator, ReliabilitySummary};
pub use errors::{CircuitError, ConfigError, ErrorKind, Layer, OperationError, ReliabilityError};
pub use fallback::{ActionExecutor, FallbackManager, Outcome};
pub use health::{HealthEvaluator, HealthStatus, OperationHealth, SystemHealth};
pub use history::{AttemptHistory, RetryAttemptRecord};
pub use metrics::OperationMetrics;
pub use retry::{RetryError, RetryMechanism, backoff_delay, retry_delay};

pub use tokio_util::sync::CancellationToken;
