//! Configuration view and validation commands: `rollout config`.

use anyhow::{Context, Result};
use console::style;

use rollout::config::{Config, RolloutToml};

use super::super::ConfigCommands;

fn show(config: &Config) -> Result<()> {
    let config_path = config.config_file();

    println!();
    println!("Rollout Configuration");
    println!("=====================");
    println!();
    if config_path.exists() {
        println!("Config file: {}", config_path.display());
    } else {
        println!("No rollout.toml found at {}", config_path.display());
        println!("Using default configuration.");
    }
    println!();

    let toml = &config.toml;
    println!("[project]");
    if let Some(name) = &toml.project.name {
        println!("  name = \"{}\"", name);
    }
    println!("  source_dir = \"{}\"", toml.project.source_dir);
    println!("  tests_dir = \"{}\"", toml.project.tests_dir);
    println!();

    println!("[ledger]");
    println!("  file = \"{}\"", config.ledger_file().display());
    println!("  report = \"{}\"", config.ledger_report_file().display());
    println!("  pipeline_phase = \"{}\"", toml.ledger.pipeline_phase);
    match config.dependency_graph() {
        Ok(graph) => {
            let source = if toml.ledger.phases.is_some() {
                "configured"
            } else {
                "built-in"
            };
            println!("  phases ({}):", source);
            for id in graph.phase_ids() {
                let deps = graph.dependencies(id);
                if deps.is_empty() {
                    println!("    {}", id);
                } else {
                    println!("    {} <- {}", id, deps.join(", "));
                }
            }
        }
        Err(e) => println!("  phases: {}", style(e).red()),
    }
    println!();

    // Effective values: CLI and environment already applied.
    println!("[pipeline]");
    println!("  dry_run = {}", config.dry_run());
    println!("  block_on_test_failure = {}", config.block_on_test_failure());
    println!("  max_consecutive_failures = {}", config.max_consecutive_failures());
    println!("  publish = \"{}\"", config.publish_mode());
    println!("  base_branch = \"{}\"", toml.pipeline.base_branch);
    println!("  branch_prefix = \"{}\"", toml.pipeline.branch_prefix);
    println!();

    println!("[tests]");
    println!("  command = {:?}", toml.tests.command);
    println!("  args = {:?}", toml.tests.args);
    println!("  timeout_secs = {}", toml.tests.timeout_secs);
    println!();

    println!("[generator]");
    println!("  command = \"{}\"", config.generator_cmd());
    println!("  args = {:?}", toml.generator.args);
    println!("  timeout_secs = {}", toml.generator.timeout_secs);
    println!();

    if !toml.safety.checks.is_empty() {
        println!("[safety]");
        for check in &toml.safety.checks {
            let kind = if check.critical { "critical" } else { "warning" };
            println!("  {} ({}): {}", check.name, kind, check.command);
        }
        println!();
    }

    let logging = config.logging();
    println!("[logging]");
    println!("  level = \"{}\"", logging.level);
    println!("  format = \"{}\"", logging.format);
    if let Some(dir) = &logging.file_dir {
        println!("  file_dir = \"{}\"", dir.display());
    }
    println!();
    Ok(())
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => show(config),
        Some(ConfigCommands::Validate) => {
            let config_path = config.config_file();
            if !config_path.exists() {
                println!("No rollout.toml found. Using defaults (valid).");
            }
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid.", style("✓").green());
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  {} {}", style("⚠").yellow(), warning);
                }
            }
            Ok(())
        }
        Some(ConfigCommands::Init) => {
            let config_path = config.config_file();
            if config_path.exists() {
                println!("rollout.toml already exists at {}", config_path.display());
                return Ok(());
            }
            std::fs::create_dir_all(&config.rollout_dir).with_context(|| {
                format!("Failed to create {}", config.rollout_dir.display())
            })?;
            RolloutToml::default().save(&config_path)?;
            println!("Created rollout.toml at {}", config_path.display());
            Ok(())
        }
    }
}
