//! Hooks fired on circuit breaker state transitions

use crate::circuit::CircuitState;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A single breaker state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    /// Operation key of the breaker
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Clock offset of the change
    #[serde(with = "crate::config::duration_millis")]
    pub at: Duration,
}

pub type TransitionHook = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<TransitionHook>,
    pub on_close: Option<TransitionHook>,
    pub on_half_open: Option<TransitionHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch to the hook registered for the target state
    pub fn trigger(&self, transition: &StateTransition) {
        let hook = match transition.to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = hook {
            callback(transition);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
