//! Work items and deployment results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::ledger::Metadata;
use crate::testgen::TestResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// One recommendation to implement, test and publish. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(alias = "recommendation_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Passed through to generated artifacts
    #[serde(default)]
    pub metadata: Metadata,
}

impl WorkItem {
    pub fn new(id: &str, title: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            priority: Priority::default(),
            metadata: Metadata::new(),
        }
    }
}

/// Batch input: either a bare list or `{ "recommendations": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WorkItemBatch {
    List(Vec<WorkItem>),
    Wrapped { recommendations: Vec<WorkItem> },
}

impl WorkItemBatch {
    pub fn into_items(self) -> Vec<WorkItem> {
        match self {
            WorkItemBatch::List(items) => items,
            WorkItemBatch::Wrapped { recommendations } => recommendations,
        }
    }
}

/// Outcome of pushing one work item through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub work_item_id: String,
    pub title: String,
    pub success: bool,
    pub implementation_generated: bool,
    pub tests_generated: bool,
    pub tests_passed: bool,
    pub branch_created: bool,
    pub pr_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Seconds
    pub execution_time: f64,
}

impl DeploymentResult {
    pub fn new(item: &WorkItem) -> Self {
        Self {
            work_item_id: item.id.clone(),
            title: item.title.clone(),
            success: false,
            implementation_generated: false,
            tests_generated: false,
            tests_passed: false,
            branch_created: false,
            pr_created: false,
            pr_url: None,
            branch_name: None,
            target_path: None,
            test_file: None,
            test_result: None,
            backup_id: None,
            restored: false,
            error_message: None,
            execution_time: 0.0,
        }
    }

    /// Whether the test stage ran and reported failures.
    pub fn tests_failed(&self) -> bool {
        self.test_result.as_ref().is_some_and(|r| !r.passed)
    }
}

/// Aggregate over one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    /// Items attempted (items skipped by an open circuit breaker are not counted)
    pub total_recommendations: usize,
    pub successful: usize,
    pub failed: usize,
    pub prs_created: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    /// Size of the submitted batch
    pub batch_size: usize,
    pub halted_by_circuit_breaker: bool,
    pub results: Vec<DeploymentResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl DeploymentReport {
    pub fn from_results(
        results: Vec<DeploymentResult>,
        batch_size: usize,
        halted_by_circuit_breaker: bool,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            total_recommendations: results.len(),
            successful: results.iter().filter(|r| r.success).count(),
            failed: results.iter().filter(|r| !r.success).count(),
            prs_created: results.iter().filter(|r| r.pr_created).count(),
            tests_passed: results.iter().filter(|r| r.tests_passed).count(),
            tests_failed: results.iter().filter(|r| r.tests_failed()).count(),
            batch_size,
            halted_by_circuit_breaker,
            results,
            started_at,
            completed_at,
        }
    }

    /// Items never attempted because the circuit breaker stopped the batch.
    pub fn not_attempted(&self) -> usize {
        self.batch_size.saturating_sub(self.total_recommendations)
    }

    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.not_attempted() == 0
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MetaValue;

    fn result(id: &str, success: bool) -> DeploymentResult {
        let mut r = DeploymentResult::new(&WorkItem::new(id, "t", ""));
        r.success = success;
        r
    }

    #[test]
    fn test_batch_accepts_both_shapes() {
        let list: WorkItemBatch =
            serde_json::from_str(r#"[{"id": "r1", "title": "Add cache"}]"#).unwrap();
        assert_eq!(list.into_items().len(), 1);

        let wrapped: WorkItemBatch = serde_json::from_str(
            r#"{"recommendations": [
                {"recommendation_id": "r1", "title": "A", "priority": "high",
                 "metadata": {"target_path": "src/a.py", "effort": 3}},
                {"id": "r2", "title": "B"}
            ]}"#,
        )
        .unwrap();
        let items = wrapped.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "r1");
        assert_eq!(items[0].priority, Priority::High);
        assert_eq!(
            items[0].metadata.get("target_path"),
            Some(&MetaValue::Text("src/a.py".into()))
        );
        assert_eq!(items[1].priority, Priority::Medium);
    }

    #[test]
    fn test_batch_accepts_yaml() {
        let yaml = "- id: r1\n  title: Add cache\n  priority: low\n";
        let batch: WorkItemBatch = serde_yaml::from_str(yaml).unwrap();
        let items = batch.into_items();
        assert_eq!(items[0].priority, Priority::Low);
    }

    #[test]
    fn test_report_counts() {
        let mut with_pr = result("a", true);
        with_pr.pr_created = true;
        with_pr.tests_passed = true;
        let failed = result("b", false);

        let now = Utc::now();
        let report = DeploymentReport::from_results(vec![with_pr, failed], 5, true, now, now);
        assert_eq!(report.total_recommendations, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.prs_created, 1);
        assert_eq!(report.tests_passed, 1);
        assert_eq!(report.not_attempted(), 3);
        assert!(!report.all_success());
    }
}
