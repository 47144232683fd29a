//! Health classification derived from operation metrics
//!
//! Health is never stored; it is recomputed from [`OperationMetrics`] on demand.

use crate::config::HealthThresholds;
use crate::metrics::OperationMetrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of a single operation key with the indicators it was derived from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationHealth {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub total_requests: u64,
}

/// Aggregate health report across operation keys
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub operations: BTreeMap<String, OperationHealth>,
    /// One line per operation that is not healthy
    pub alerts: Vec<String>,
}

/// Classifies metrics as healthy, degraded or unhealthy
#[derive(Debug, Clone, Default)]
pub struct HealthEvaluator {
    thresholds: HealthThresholds,
}

impl HealthEvaluator {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, metrics: &OperationMetrics) -> HealthStatus {
        let t = &self.thresholds;
        let success_rate = metrics.success_rate();
        let error_rate = metrics.error_rate();
        let latency = metrics.average_latency;

        if success_rate >= t.healthy_min_success_rate
            && latency < t.healthy_max_latency
            && error_rate < t.healthy_max_error_rate
        {
            HealthStatus::Healthy
        } else if success_rate >= t.degraded_min_success_rate
            && latency < t.degraded_max_latency
            && error_rate < t.degraded_max_error_rate
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn describe(&self, metrics: &OperationMetrics) -> OperationHealth {
        OperationHealth {
            status: self.evaluate(metrics),
            success_rate: metrics.success_rate(),
            error_rate: metrics.error_rate(),
            average_latency_ms: metrics.average_latency.as_secs_f64() * 1000.0,
            total_requests: metrics.total_requests,
        }
    }

    /// Worst status wins: any unhealthy makes the system unhealthy, else any
    /// degraded makes it degraded. No operations at all is healthy.
    pub fn evaluate_system<'a, I>(&self, all_metrics: I) -> HealthStatus
    where
        I: IntoIterator<Item = &'a OperationMetrics>,
    {
        all_metrics
            .into_iter()
            .map(|m| self.evaluate(m))
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Per-key report with alerts, keyed by operation
    pub fn report<'a, I>(&self, all_metrics: I) -> SystemHealth
    where
        I: IntoIterator<Item = (&'a str, &'a OperationMetrics)>,
    {
        let operations: BTreeMap<String, OperationHealth> = all_metrics
            .into_iter()
            .map(|(key, metrics)| (key.to_string(), self.describe(metrics)))
            .collect();

        let overall_status = operations
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        let alerts = operations
            .iter()
            .filter(|(_, h)| h.status != HealthStatus::Healthy)
            .map(|(key, h)| {
                format!(
                    "{}: {} - success rate: {:.3}",
                    key, h.status, h.success_rate
                )
            })
            .collect();

        SystemHealth {
            overall_status,
            operations,
            alerts,
        }
    }
}
