//! Phase state and per-phase records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::metadata::Metadata;

/// Lifecycle state of a workflow phase.
///
/// `Pending -> InProgress -> {Complete | Failed}`, `Complete -> NeedsRerun`,
/// `NeedsRerun -> InProgress`. Any state may be reset back to `Pending`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
    NeedsRerun,
}

impl PhaseState {
    pub const ALL: [PhaseState; 5] = [
        PhaseState::Pending,
        PhaseState::InProgress,
        PhaseState::Complete,
        PhaseState::Failed,
        PhaseState::NeedsRerun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Pending => "PENDING",
            PhaseState::InProgress => "IN_PROGRESS",
            PhaseState::Complete => "COMPLETE",
            PhaseState::Failed => "FAILED",
            PhaseState::NeedsRerun => "NEEDS_RERUN",
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(PhaseState::Pending),
            "IN_PROGRESS" => Ok(PhaseState::InProgress),
            "COMPLETE" => Ok(PhaseState::Complete),
            "FAILED" => Ok(PhaseState::Failed),
            "NEEDS_RERUN" => Ok(PhaseState::NeedsRerun),
            _ => anyhow::bail!(
                "Invalid phase state '{}'. Valid values: pending, in_progress, complete, failed, needs_rerun",
                s
            ),
        }
    }
}

/// Persistent record of a single phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: String,
    pub state: PhaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between `started_at` and `completed_at`.
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    pub rerun_reason: Option<String>,
    pub skip_reason: Option<String>,
    pub dependencies_met: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PhaseRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: PhaseState::Pending,
            started_at: None,
            completed_at: None,
            duration_secs: None,
            error_message: None,
            rerun_reason: None,
            skip_reason: None,
            dependencies_met: false,
            metadata: Metadata::new(),
        }
    }

    /// Return to a fresh `Pending` record, keeping only the id.
    pub fn reset(&mut self) {
        *self = PhaseRecord::new(&self.id);
    }

    /// Stamp a terminal outcome (complete or failed).
    ///
    /// A phase that was never started gets `started_at = completed_at` so a
    /// finished phase always carries both timestamps.
    pub(crate) fn finish(&mut self, state: PhaseState, now: DateTime<Utc>) {
        let started = *self.started_at.get_or_insert(now);
        let completed = if now < started { started } else { now };
        self.completed_at = Some(completed);
        self.duration_secs = Some(seconds_between(started, completed));
        self.state = state;
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    delta
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| delta.num_milliseconds() as f64 / 1000.0)
}

/// Phase counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub by_state: BTreeMap<PhaseState, usize>,
}

impl LedgerSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PhaseRecord>) -> Self {
        let mut by_state: BTreeMap<PhaseState, usize> =
            PhaseState::ALL.iter().map(|s| (*s, 0)).collect();
        let mut total = 0;
        for record in records {
            *by_state.entry(record.state).or_insert(0) += 1;
            total += 1;
        }
        Self { total, by_state }
    }

    pub fn count(&self, state: PhaseState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_state_serializes_screaming() {
        let json = serde_json::to_string(&PhaseState::NeedsRerun).unwrap();
        assert_eq!(json, "\"NEEDS_RERUN\"");
        let back: PhaseState = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(back, PhaseState::InProgress);
    }

    #[test]
    fn test_state_from_str_accepts_cli_spellings() {
        assert_eq!("complete".parse::<PhaseState>().unwrap(), PhaseState::Complete);
        assert_eq!(
            "needs-rerun".parse::<PhaseState>().unwrap(),
            PhaseState::NeedsRerun
        );
        assert!("done".parse::<PhaseState>().is_err());
    }

    #[test]
    fn test_finish_computes_duration() {
        let mut record = PhaseRecord::new("synthesis");
        let start = Utc::now();
        record.started_at = Some(start);
        record.finish(PhaseState::Complete, start + Duration::milliseconds(1500));

        assert_eq!(record.state, PhaseState::Complete);
        assert_eq!(record.duration_secs, Some(1.5));
        assert!(record.completed_at.unwrap() >= record.started_at.unwrap());
    }

    #[test]
    fn test_finish_without_start_stamps_both() {
        let mut record = PhaseRecord::new("synthesis");
        let now = Utc::now();
        record.finish(PhaseState::Failed, now);

        assert_eq!(record.started_at, Some(now));
        assert_eq!(record.completed_at, Some(now));
        assert_eq!(record.duration_secs, Some(0.0));
    }

    #[test]
    fn test_finish_never_goes_backwards() {
        let mut record = PhaseRecord::new("x");
        let start = Utc::now();
        record.started_at = Some(start);
        record.finish(PhaseState::Complete, start - Duration::seconds(5));
        assert_eq!(record.completed_at, Some(start));
        assert_eq!(record.duration_secs, Some(0.0));
    }

    #[test]
    fn test_summary_includes_zero_buckets() {
        let mut a = PhaseRecord::new("a");
        a.state = PhaseState::Complete;
        let b = PhaseRecord::new("b");
        let summary = LedgerSummary::from_records([&a, &b]);

        assert_eq!(summary.total, 2);
        assert_eq!(summary.count(PhaseState::Complete), 1);
        assert_eq!(summary.count(PhaseState::Pending), 1);
        assert_eq!(summary.count(PhaseState::Failed), 0);
        assert_eq!(summary.by_state.len(), 5);
    }
}
