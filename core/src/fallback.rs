//! Fallback strategies applied when a protected call ultimately fails
//!
//! The manager wraps the primary call. On success it may feed the result cache;
//! on failure it substitutes an alternative action, a cached result, a default
//! value or a "skipped" marker, depending on the configured [`FallbackConfig`].

use crate::cache::FallbackCache;
use crate::clock::Clock;
use crate::config::{AlternativeAction, FallbackConfig, FallbackType};
use crate::errors::{OperationError, ReliabilityError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs alternative actions on behalf of the fallback manager
///
/// Implemented by the collaborator that knows how to perform actions
/// (input synthesis, window control and so on).
#[async_trait]
pub trait ActionExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, action: &AlternativeAction) -> Result<Value, OperationError>;
}

/// Result of a call that went through the fallback layer
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The primary call succeeded
    Primary(Value),

    /// The primary call failed and a fallback supplied the value
    Fallback {
        strategy: FallbackType,
        value: Value,
        cause: ReliabilityError,
    },

    /// The primary call failed and the step was skipped
    Skipped { cause: ReliabilityError },
}

impl Outcome {
    pub fn is_primary(&self) -> bool {
        matches!(self, Outcome::Primary(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    /// The failure a fallback recovered from, if any
    pub fn cause(&self) -> Option<&ReliabilityError> {
        match self {
            Outcome::Primary(_) => None,
            Outcome::Fallback { cause, .. } | Outcome::Skipped { cause } => Some(cause),
        }
    }

    pub fn strategy(&self) -> Option<FallbackType> {
        match self {
            Outcome::Primary(_) => None,
            Outcome::Fallback { strategy, .. } => Some(*strategy),
            Outcome::Skipped { .. } => Some(FallbackType::SkipStep),
        }
    }

    /// The value handed back to the caller
    ///
    /// A skipped step becomes `{"skipped": true, "reason": "primary_action_failed", "error": ...}`.
    pub fn into_value(self) -> Value {
        match self {
            Outcome::Primary(value) | Outcome::Fallback { value, .. } => value,
            Outcome::Skipped { cause } => json!({
                "skipped": true,
                "reason": "primary_action_failed",
                "error": cause.to_string(),
            }),
        }
    }
}

/// Applies [`FallbackConfig`] strategies and owns the result cache
#[derive(Debug)]
pub struct FallbackManager {
    cache: FallbackCache,
    executor: Option<Arc<dyn ActionExecutor>>,
    clock: Arc<dyn Clock>,
}

impl FallbackManager {
    pub fn new(cache: FallbackCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            executor: None,
            clock,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn cache(&self) -> &FallbackCache {
        &self.cache
    }

    /// Run `operation` and fall back per `config` when it fails
    ///
    /// Cancellation and configuration errors are never rescued.
    pub async fn execute_with_fallback<Fut>(
        &self,
        key: &str,
        args: &str,
        config: Option<&FallbackConfig>,
        operation: Fut,
    ) -> Result<Outcome, ReliabilityError>
    where
        Fut: Future<Output = Result<Value, ReliabilityError>>,
    {
        match operation.await {
            Ok(value) => {
                if let Some(FallbackConfig::CachedResult { cache_ttl }) = config {
                    let now = self.clock.now();
                    self.cache.store(key, args, value.clone(), *cache_ttl, now);
                }
                Ok(Outcome::Primary(value))
            }
            Err(error) => match config {
                Some(config) if is_recoverable(&error) => {
                    self.recover(key, args, config, error).await
                }
                _ => Err(error),
            },
        }
    }

    async fn recover(
        &self,
        key: &str,
        args: &str,
        config: &FallbackConfig,
        cause: ReliabilityError,
    ) -> Result<Outcome, ReliabilityError> {
        let strategy = config.fallback_type();

        let value = match config {
            FallbackConfig::AlternativeAction { action } => {
                let Some(executor) = &self.executor else {
                    warn!(key, action = %action.action, "no action executor for fallback");
                    return Err(exhausted(
                        key,
                        cause,
                        OperationError::unavailable("no action executor configured"),
                    ));
                };
                match executor.execute(action).await {
                    Ok(value) => value,
                    Err(fallback) => {
                        warn!(
                            key,
                            action = %action.action,
                            error = %fallback,
                            "alternative action failed"
                        );
                        return Err(exhausted(key, cause, fallback));
                    }
                }
            }
            FallbackConfig::CachedResult { .. } => {
                match self.cache.get(key, args, self.clock.now()) {
                    Some(value) => value,
                    None => return Err(cause),
                }
            }
            FallbackConfig::DefaultValue { value } => value.clone(),
            FallbackConfig::SkipStep => {
                info!(key, error = %cause, "primary failed, step skipped");
                return Ok(Outcome::Skipped { cause });
            }
        };

        info!(key, strategy = strategy.as_str(), error = %cause, "served fallback result");
        Ok(Outcome::Fallback {
            strategy,
            value,
            cause,
        })
    }
}

fn is_recoverable(error: &ReliabilityError) -> bool {
    !matches!(
        error,
        ReliabilityError::Cancelled { .. } | ReliabilityError::Configuration { .. }
    )
}

fn exhausted(key: &str, primary: ReliabilityError, fallback: OperationError) -> ReliabilityError {
    ReliabilityError::FallbackExhausted {
        key: key.to_string(),
        primary: Box::new(primary),
        fallback,
    }
}
