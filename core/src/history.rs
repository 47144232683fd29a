//! Bounded per-key record of retry attempts
//!
//! Only the most recent `capacity` attempts are kept; older records are
//! discarded as new ones arrive.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// A single attempt made by the retry mechanism
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttemptRecord {
    /// Clock offset at which the attempt finished
    #[serde(with = "crate::config::duration_millis")]
    pub timestamp: Duration,
    /// 1-based attempt number within its execution
    pub attempt_number: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RetryAttemptRecord {
    pub fn success(timestamp: Duration, attempt_number: u32) -> Self {
        Self {
            timestamp,
            attempt_number,
            success: true,
            error: None,
        }
    }

    pub fn failure(timestamp: Duration, attempt_number: u32, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            attempt_number,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Most-recent-N attempt log for one operation key
#[derive(Debug, Clone)]
pub struct AttemptHistory {
    records: VecDeque<RetryAttemptRecord>,
    capacity: usize,
}

impl AttemptHistory {
    /// Create a history keeping at most `capacity` records (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn record(&mut self, record: RetryAttemptRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// The last `limit` records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<RetryAttemptRecord> {
        let start = self.records.len().saturating_sub(limit);
        self.records.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
