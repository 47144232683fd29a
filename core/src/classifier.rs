//! Failure classification for the circuit breaker
//!
//! Decides which final failures count toward opening a circuit. Failures a
//! classifier rejects are still returned to the caller; they just leave the
//! breaker untouched.

use crate::errors::{ErrorKind, OperationError};
use std::collections::HashSet;
use std::time::Duration;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Operation key of the breaker
    pub circuit_name: &'a str,
    pub error: &'a OperationError,
    /// End-to-end duration of the failed call, retries included
    pub duration: Duration,
}

/// Determines whether an error should trip the circuit
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should count toward opening the circuit
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Trips on every failure
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Ignores failures of the listed kinds, e.g. caller mistakes like `InvalidInput`
#[derive(Debug, Clone, Default)]
pub struct IgnoreKindsClassifier {
    ignored: HashSet<ErrorKind>,
}

impl IgnoreKindsClassifier {
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            ignored: kinds.into_iter().collect(),
        }
    }
}

impl FailureClassifier for IgnoreKindsClassifier {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        !self.ignored.contains(&ctx.error.kind)
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
