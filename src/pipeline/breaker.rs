//! Batch-level circuit breaker.

use serde::Serialize;

/// A failure the breaker has counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedFailure {
    pub work_item_id: String,
    pub error: String,
}

/// Opens after `max_failures` consecutive item failures; any success closes it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    max_failures: u32,
    /// Failures in the current streak
    streak: Vec<RecordedFailure>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_failures,
            streak: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.max_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn streak(&self) -> &[RecordedFailure] {
        &self.streak
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.streak.clear();
    }

    pub fn record_failure(&mut self, work_item_id: &str, error: &str) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.streak.push(RecordedFailure {
            work_item_id: work_item_id.to_string(),
            error: error.to_string(),
        });
    }
}
