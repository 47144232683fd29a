//! Per-operation request counters and rolling latency

use crate::config::{duration_millis, option_duration_millis};
use serde::Serialize;
use std::time::Duration;

/// Counters for one operation key
///
/// `average_latency` is maintained incrementally; no latency history is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Failed requests that were rejected by an open circuit
    pub rejected_requests: u64,
    /// Failed requests that a fallback turned into a result
    pub fallback_results: u64,
    #[serde(with = "duration_millis")]
    pub average_latency: Duration,
    #[serde(serialize_with = "option_duration_millis::serialize")]
    pub last_success_time: Option<Duration>,
    #[serde(serialize_with = "option_duration_millis::serialize")]
    pub last_failure_time: Option<Duration>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, latency: Duration, at: Duration) {
        self.successful_requests += 1;
        self.last_success_time = Some(at);
        self.observe_latency(latency);
    }

    pub fn record_failure(&mut self, latency: Duration, at: Duration) {
        self.failed_requests += 1;
        self.last_failure_time = Some(at);
        self.observe_latency(latency);
    }

    pub fn record_rejected(&mut self) {
        self.rejected_requests += 1;
    }

    pub fn record_fallback(&mut self) {
        self.fallback_results += 1;
    }

    /// `successful / total`, defined as 1.0 before any request
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    /// `failed / total`, defined as 0.0 before any request
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn observe_latency(&mut self, latency: Duration) {
        self.total_requests += 1;
        let avg = self.average_latency.as_secs_f64();
        let next = avg + (latency.as_secs_f64() - avg) / self.total_requests as f64;
        self.average_latency = Duration::from_secs_f64(next.max(0.0));
    }
}
