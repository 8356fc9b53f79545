//! Batch deployment command: `rollout deploy <batch>`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use rollout::adapters::{ClaudeCli, CommandSafetyChecker, ConventionMapper, GitVcs, SymbolAnalyzer};
use rollout::config::Config;
use rollout::ledger::PhaseLedger;
use rollout::pipeline::{
    BackupStore, Collaborators, DeploymentPipeline, DeploymentReport, PipelineOptions, WorkItem,
    WorkItemBatch,
};
use rollout::report::{default_report_path, write_json, write_markdown};
use rollout::testgen::{TestGenerator, TestRunner, TestStage};

/// Read a batch file. The extension picks the first parser; the other is tried
/// when it fails.
pub fn load_batch(path: &Path) -> Result<Vec<WorkItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file {}", path.display()))?;
    let yaml_first = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );

    let json = || serde_json::from_str::<WorkItemBatch>(&content).map_err(anyhow::Error::from);
    let yaml = || serde_yaml::from_str::<WorkItemBatch>(&content).map_err(anyhow::Error::from);
    let parsed = if yaml_first {
        yaml().or_else(|e| json().map_err(|_| e))
    } else {
        json().or_else(|e| yaml().map_err(|_| e))
    };

    let batch = parsed.with_context(|| format!("Invalid batch file {}", path.display()))?;
    Ok(batch.into_items())
}

fn build_pipeline(config: &Config) -> DeploymentPipeline {
    let project_dir = config.project_dir.clone();
    let toml = &config.toml;

    let claude = Arc::new(ClaudeCli::new(
        config.generator_cmd(),
        toml.generator.args.clone(),
        config.generator_timeout(),
        &project_dir,
    ));

    let collaborators = Collaborators {
        mapper: Arc::new(ConventionMapper::new(&project_dir, config.source_dir())),
        analyzer: Arc::new(SymbolAnalyzer),
        generator: claude.clone(),
        safety: Arc::new(CommandSafetyChecker::new(
            toml.safety.checks.clone(),
            &project_dir,
        )),
        vcs: Arc::new(GitVcs::new(&project_dir, &toml.pipeline.base_branch)),
    };

    let test_stage = TestStage::new(
        TestGenerator::new(&project_dir, config.tests_dir()).with_text_generator(claude),
        TestRunner::new(toml.tests.command.clone(), &project_dir)
            .with_args(toml.tests.args.clone())
            .with_timeout(config.test_timeout())
            .with_max_failure_summaries(toml.tests.max_failure_summaries),
        config.block_on_test_failure(),
    );

    let options = PipelineOptions {
        dry_run: config.dry_run(),
        publish: config.publish_mode(),
        max_consecutive_failures: config.max_consecutive_failures(),
        branch_prefix: toml.pipeline.branch_prefix.clone(),
    };

    DeploymentPipeline::new(
        options,
        collaborators,
        test_stage,
        BackupStore::new(config.backups_dir()),
    )
}

fn print_summary(report: &DeploymentReport, report_path: &Path) {
    println!();
    println!("{}", style("Deployment Summary").bold());
    println!();
    for result in &report.results {
        let mark = if result.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!("  {} {} {}", mark, style(&result.work_item_id).bold(), result.title);
        if let Some(url) = &result.pr_url {
            println!("      {}", style(url).cyan());
        }
        if let Some(err) = &result.error_message {
            println!("      {}", style(err).red());
        }
        if result.restored {
            println!("      {}", style("changes restored from backup").yellow());
        }
    }
    println!();
    println!(
        "  {} attempted, {} succeeded, {} failed, {} PRs",
        report.total_recommendations, report.successful, report.failed, report.prs_created
    );
    println!(
        "  tests: {} passed, {} failed",
        report.tests_passed, report.tests_failed
    );
    if report.halted_by_circuit_breaker {
        println!(
            "  {}",
            style(format!(
                "circuit breaker opened; {} item(s) not attempted",
                report.not_attempted()
            ))
            .red()
            .bold()
        );
    }
    println!("  report: {}", style(report_path.display()).dim());
    println!();
}

pub async fn cmd_deploy(config: &Config, batch: &Path, report_path: Option<&Path>) -> Result<()> {
    let items = load_batch(batch)?;
    config.ensure_directories()?;

    let ledger = Arc::new(PhaseLedger::open(
        config.ledger_file(),
        config.dependency_graph()?,
    )?);
    let pipeline = build_pipeline(config)
        .with_ledger(ledger.clone(), config.toml.ledger.pipeline_phase.clone());

    if pipeline.options().dry_run {
        println!("{}", style("Dry run: changes are written to temporary files only").yellow());
    }

    let report = pipeline.run_batch(&items).await;

    let path = match report_path {
        Some(p) => p.to_path_buf(),
        None => default_report_path(&config.reports_dir(), report.started_at),
    };
    write_json(&report, &path)?;
    if !pipeline.options().dry_run {
        write_markdown(&ledger, &config.ledger_report_file())?;
    }
    print_summary(&report, &path);

    if !report.all_success() {
        bail!(
            "{} of {} item(s) did not deploy",
            report.batch_size - report.successful,
            report.batch_size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_batch_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("batch.json");
        fs::write(&json, r#"{"recommendations": [{"id": "r1", "title": "A"}]}"#).unwrap();
        assert_eq!(load_batch(&json).unwrap()[0].id, "r1");

        let yaml = dir.path().join("batch.yml");
        fs::write(&yaml, "- id: r2\n  title: B\n").unwrap();
        assert_eq!(load_batch(&yaml).unwrap()[0].id, "r2");

        // Extension is only a hint.
        let odd = dir.path().join("batch.txt");
        fs::write(&odd, "- id: r3\n  title: C\n").unwrap();
        assert_eq!(load_batch(&odd).unwrap()[0].id, "r3");
    }

    #[test]
    fn test_load_batch_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        fs::write(&path, r#"{"items": 3}"#).unwrap();
        let err = load_batch(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid batch file"));
    }
}
