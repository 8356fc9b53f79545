//! Batch deployment of work items.
//!
//! Each item runs through mapping, integration analysis, context gathering,
//! generation, backup, write, safety checks, the test stage and publication.
//! A failing step ends that item only; the circuit breaker ends the batch.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::backup::{Backup, BackupStore};
use super::breaker::CircuitBreaker;
use super::collaborators::{Collaborators, GenerationContext};
use super::context::{extract_symbols, read_existing};
use super::types::{DeploymentReport, DeploymentResult, ExecutionTimer, WorkItem};
use crate::config::PublishMode;
use crate::errors::PipelineError;
use crate::ledger::{Metadata, PhaseLedger};
use crate::testgen::TestStage;
use crate::util::slugify;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub dry_run: bool,
    pub publish: PublishMode,
    pub max_consecutive_failures: u32,
    pub branch_prefix: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            publish: PublishMode::default(),
            max_consecutive_failures: 3,
            branch_prefix: "rollout/".to_string(),
        }
    }
}

pub struct DeploymentPipeline {
    options: PipelineOptions,
    collaborators: Collaborators,
    test_stage: TestStage,
    backups: BackupStore,
    /// Ledger handle and the phase this pipeline reports under
    ledger: Option<(Arc<PhaseLedger>, String)>,
}

impl DeploymentPipeline {
    pub fn new(
        options: PipelineOptions,
        collaborators: Collaborators,
        test_stage: TestStage,
        backups: BackupStore,
    ) -> Self {
        Self {
            options,
            collaborators,
            test_stage,
            backups,
            ledger: None,
        }
    }

    /// Record batch progress under `phase` in `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<PhaseLedger>, phase: impl Into<String>) -> Self {
        self.ledger = Some((ledger, phase.into()));
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// `<prefix><item-id>-<title slug>`
    pub fn branch_name(&self, item: &WorkItem) -> String {
        format!(
            "{}{}-{}",
            self.options.branch_prefix,
            slugify(&item.id, '-', 40),
            slugify(&item.title, '-', 40)
        )
    }

    /// Deploy `items` in order until done or the circuit breaker opens.
    pub async fn run_batch(&self, items: &[WorkItem]) -> DeploymentReport {
        let started_at = Utc::now();
        let mut breaker = CircuitBreaker::new(self.options.max_consecutive_failures);
        let mut results = Vec::with_capacity(items.len());
        let mut halted = false;

        info!(
            items = items.len(),
            dry_run = self.options.dry_run,
            publish = %self.options.publish,
            "Starting deployment batch"
        );
        self.ledger_started(items.len());

        for (index, item) in items.iter().enumerate() {
            if breaker.is_open() {
                error!(
                    consecutive_failures = breaker.consecutive_failures(),
                    remaining = items.len() - index,
                    "Circuit breaker open; halting batch"
                );
                halted = true;
                break;
            }

            info!(item = %item.id, index = index + 1, total = items.len(), title = %item.title, "Deploying item");
            let result = self.deploy_item(item).await;
            if result.success {
                breaker.record_success();
            } else {
                breaker.record_failure(
                    &item.id,
                    result.error_message.as_deref().unwrap_or("unknown error"),
                );
            }
            results.push(result);
        }

        let report =
            DeploymentReport::from_results(results, items.len(), halted, started_at, Utc::now());
        self.ledger_finished(&report, &breaker);

        info!(
            attempted = report.total_recommendations,
            successful = report.successful,
            failed = report.failed,
            prs = report.prs_created,
            halted = report.halted_by_circuit_breaker,
            "Deployment batch finished"
        );
        report
    }

    /// Run one item through every step. Never fails; the error lands in the result.
    pub async fn deploy_item(&self, item: &WorkItem) -> DeploymentResult {
        let timer = ExecutionTimer::start();
        let mut result = DeploymentResult::new(item);

        match self.run_steps(item, &mut result).await {
            Ok(()) => {
                result.success = true;
                info!(item = %item.id, "Item deployed");
            }
            Err(e) => {
                warn!(item = %item.id, error = %e, "Item failed");
                result.error_message = Some(e.to_string());
            }
        }

        result.execution_time = timer.elapsed().as_secs_f64();
        result
    }

    async fn run_steps(
        &self,
        item: &WorkItem,
        result: &mut DeploymentResult,
    ) -> Result<(), PipelineError> {
        let c = &self.collaborators;

        let target = c
            .mapper
            .map(item)
            .await
            .map_err(|e| PipelineError::Mapping(format!("{:#}", e)))?;
        result.target_path = Some(target.clone());
        debug!(item = %item.id, target = %target.display(), "Mapped target");

        let plan = c
            .analyzer
            .analyze(item, &target)
            .await
            .map_err(|e| PipelineError::Integration(format!("{:#}", e)))?;
        debug!(item = %item.id, strategy = %plan.strategy, "Integration planned");

        let existing_code = read_existing(&target)?;
        let existing_symbols = match (&existing_code, plan.existing_symbols.is_empty()) {
            (Some(code), true) => extract_symbols(code).all(),
            _ => plan.existing_symbols.clone(),
        };
        let context = GenerationContext {
            target_path: target.clone(),
            existing_code,
            existing_symbols,
        };

        let code = c
            .generator
            .generate(item, &context, plan.strategy)
            .await
            .map_err(|e| PipelineError::Generation(format!("{:#}", e)))?;
        if code.trim().is_empty() {
            return Err(PipelineError::Generation(
                "generator returned no code".to_string(),
            ));
        }
        result.implementation_generated = true;

        if self.options.dry_run {
            return self.dry_run_checks(item, &target, &code).await;
        }

        // The suite is written in place too, so it shares the item's backup.
        let test_path = self.test_stage.generator().test_file_path(&target);
        let backup = self
            .backups
            .create(&item.id, &[target.clone(), test_path])
            .map_err(|e| PipelineError::Backup(format!("{:#}", e)))?;
        result.backup_id = Some(backup.id.clone());

        if let Err(source) = write_file(&target, &code) {
            self.restore(&backup, result);
            return Err(PipelineError::WriteFailed {
                path: target,
                source,
            });
        }

        let safety = match c.safety.check(std::slice::from_ref(&target), item).await {
            Ok(report) => report,
            Err(e) => {
                self.restore(&backup, result);
                return Err(PipelineError::SafetyChecker(format!("{:#}", e)));
            }
        };
        for warning in &safety.warnings {
            warn!(item = %item.id, warning = %warning, "Safety warning");
        }
        if !safety.passed {
            self.restore(&backup, result);
            return Err(PipelineError::SafetyFailed(failures_or_default(
                safety.critical_failures,
            )));
        }

        let outcome = match self.test_stage.generate_and_run_tests(&code, item, &target).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.restore(&backup, result);
                return Err(e.into());
            }
        };
        result.tests_generated = true;
        result.tests_passed = outcome.result.passed;
        result.test_file = Some(outcome.test_file.clone());
        let summary = test_failure_summary(&outcome.result);
        result.test_result = Some(outcome.result);
        if !outcome.should_proceed {
            self.restore(&backup, result);
            return Err(PipelineError::TestsFailed(summary));
        }

        if self.options.publish.publishes() {
            let files = vec![target.clone(), outcome.test_file];
            if let Err(e) = self.publish(item, &files, result).await {
                self.restore(&backup, result);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write to a hidden sibling, check it, and always remove it.
    async fn dry_run_checks(
        &self,
        item: &WorkItem,
        target: &Path,
        code: &str,
    ) -> Result<(), PipelineError> {
        let temp = dry_run_path(target);
        write_file(&temp, code).map_err(|source| PipelineError::WriteFailed {
            path: temp.clone(),
            source,
        })?;

        let checked = self
            .collaborators
            .safety
            .check(std::slice::from_ref(&temp), item)
            .await;
        if let Err(e) = std::fs::remove_file(&temp) {
            warn!(path = %temp.display(), error = %e, "Failed to remove dry-run file");
        }

        let safety = checked.map_err(|e| PipelineError::SafetyChecker(format!("{:#}", e)))?;
        if !safety.passed {
            return Err(PipelineError::SafetyFailed(failures_or_default(
                safety.critical_failures,
            )));
        }
        info!(item = %item.id, target = %target.display(), "Dry run: generated code passed safety checks");
        Ok(())
    }

    async fn publish(
        &self,
        item: &WorkItem,
        files: &[PathBuf],
        result: &mut DeploymentResult,
    ) -> Result<(), PipelineError> {
        let vcs = &self.collaborators.vcs;
        let branch = self.branch_name(item);
        result.branch_name = Some(branch.clone());

        vcs.create_branch(&branch)
            .await
            .map_err(|e| PipelineError::Branch(format!("{:#}", e)))?;
        result.branch_created = true;

        let chain = async {
            vcs.commit(files, &commit_message(item))
                .await
                .map_err(|e| PipelineError::Commit(format!("{:#}", e)))?;
            vcs.push(&branch)
                .await
                .map_err(|e| PipelineError::Push(format!("{:#}", e)))?;
            if self.options.publish.opens_pull_request() {
                let url = vcs
                    .create_pull_request(&branch, &item.title, &pull_request_body(item))
                    .await
                    .map_err(|e| PipelineError::PullRequest(format!("{:#}", e)))?;
                info!(item = %item.id, url = %url, "Pull request created");
                result.pr_created = true;
                result.pr_url = Some(url);
            }
            Ok::<(), PipelineError>(())
        }
        .await;

        if let Err(e) = chain {
            warn!(item = %item.id, branch = %branch, error = %e, "Publication failed; rolling back branch");
            if let Err(rollback) = vcs.rollback_branch(&branch).await {
                error!(item = %item.id, branch = %branch, error = %rollback, "Branch rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    fn restore(&self, backup: &Backup, result: &mut DeploymentResult) {
        match self.backups.restore(backup) {
            Ok(_) => result.restored = true,
            Err(e) => {
                error!(item = %backup.work_item_id, backup = %backup.id, error = %e, "Restore failed")
            }
        }
    }

    fn ledger_started(&self, batch_size: usize) {
        if self.options.dry_run {
            return;
        }
        if let Some((ledger, phase)) = &self.ledger {
            let meta = Metadata::new().with("batch_size", batch_size as i64);
            if let Err(e) = ledger.start(phase, Some(&meta)) {
                warn!(phase = %phase, error = %e, "Failed to record batch start in ledger");
            }
        }
    }

    fn ledger_finished(&self, report: &DeploymentReport, breaker: &CircuitBreaker) {
        if self.options.dry_run {
            return;
        }
        let Some((ledger, phase)) = &self.ledger else {
            return;
        };
        let meta = Metadata::new()
            .with("attempted", report.total_recommendations as i64)
            .with("successful", report.successful as i64)
            .with("failed", report.failed as i64)
            .with("prs_created", report.prs_created as i64);

        let recorded = if breaker.is_open() {
            let streak = breaker
                .streak()
                .iter()
                .map(|f| format!("{}: {}", f.work_item_id, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            let message = format!(
                "Circuit breaker opened after {} consecutive failures ({})",
                breaker.consecutive_failures(),
                streak
            );
            ledger.fail(phase, &message, Some(&meta)).map(|_| ())
        } else {
            ledger.complete(phase, Some(&meta)).map(|_| ())
        };
        if let Err(e) = recorded {
            warn!(phase = %phase, error = %e, "Failed to record batch result in ledger");
        }
    }
}

fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}

/// `dir/.name.rollout-dry-run`
fn dry_run_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "generated".to_string());
    target.with_file_name(format!(".{}.rollout-dry-run", name))
}

fn failures_or_default(failures: Vec<String>) -> Vec<String> {
    if failures.is_empty() {
        vec!["checks did not pass".to_string()]
    } else {
        failures
    }
}

fn test_failure_summary(result: &crate::testgen::TestResult) -> String {
    let mut summary = format!("{} of {} failed", result.failed_count, result.total);
    if !result.failure_summaries.is_empty() {
        summary.push_str(": ");
        summary.push_str(&result.failure_summaries.join(", "));
    }
    summary
}

fn commit_message(item: &WorkItem) -> String {
    format!("{}\n\nImplements recommendation {}.", item.title, item.id)
}

fn pull_request_body(item: &WorkItem) -> String {
    format!(
        "## Summary\n\nAutomated implementation for: **{}** (`{}`)\n\n{}\n\n---\n*Created by rollout*",
        item.title,
        item.id,
        if item.description.is_empty() {
            "No description provided."
        } else {
            &item.description
        }
    )
}
