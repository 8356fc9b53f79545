//! Phase ledger commands: `rollout phase ...`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use rollout::config::Config;
use rollout::ledger::{Metadata, PhaseLedger, PhaseRecord, PhaseState};
use rollout::report::write_markdown;

use super::super::PhaseCommands;

fn open_ledger(config: &Config) -> Result<PhaseLedger> {
    std::fs::create_dir_all(&config.rollout_dir)
        .with_context(|| format!("Failed to create {}", config.rollout_dir.display()))?;
    let graph = config.dependency_graph()?;
    Ok(PhaseLedger::open(config.ledger_file(), graph)?)
}

fn metadata(pairs: &[String]) -> Result<Option<Metadata>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    Ok(Some(Metadata::from_pairs(pairs)?))
}

/// State padded to the status column width, then colored.
fn state_label(state: PhaseState) -> String {
    let label = format!("{:<13}", state.to_string());
    match state {
        PhaseState::Complete => style(label).green().to_string(),
        PhaseState::Failed => style(label).red().to_string(),
        PhaseState::InProgress => style(label).cyan().to_string(),
        PhaseState::NeedsRerun => style(label).yellow().to_string(),
        PhaseState::Pending => style(label).dim().to_string(),
    }
}

fn not_applied(id: &str, why: &str) {
    println!(
        "{} {} not applied: {}",
        style("!").yellow(),
        style(id).bold(),
        why
    );
}

/// Keep the rendered status document in step with the ledger.
fn refresh_report(config: &Config, ledger: &PhaseLedger) -> Result<()> {
    write_markdown(ledger, &config.ledger_report_file())
}

pub fn cmd_phase(config: &Config, command: PhaseCommands) -> Result<()> {
    let ledger = open_ledger(config)?;

    match command {
        PhaseCommands::Start { id, meta } => {
            let record = ledger.start(&id, metadata(&meta)?.as_ref())?;
            println!("{} Started {}", style("▶").cyan(), style(&id).bold());
            if !record.dependencies_met {
                let deps = ledger.graph().dependencies(&id).join(", ");
                println!(
                    "  {}",
                    style(format!("dependencies not complete: {}", deps)).yellow()
                );
            }
        }
        PhaseCommands::Complete { id, meta } => {
            match ledger.complete(&id, metadata(&meta)?.as_ref())? {
                Some(record) => {
                    let took = record
                        .duration_secs
                        .map(|d| format!(" in {:.1}s", d))
                        .unwrap_or_default();
                    println!("{} Completed {}{}", style("✓").green(), style(&id).bold(), took);
                    let stale = ledger.stale_dependents(&id);
                    if !stale.is_empty() {
                        println!(
                            "  {}",
                            style(format!("completed before this run: {}", stale.join(", "))).dim()
                        );
                    }
                }
                None => not_applied(&id, "unknown phase"),
            }
        }
        PhaseCommands::Fail { id, error, meta } => {
            match ledger.fail(&id, &error, metadata(&meta)?.as_ref())? {
                Some(_) => println!("{} Failed {}: {}", style("✗").red(), style(&id).bold(), error),
                None => not_applied(&id, "unknown phase"),
            }
        }
        PhaseCommands::Skip { id, reason, meta } => {
            ledger.skip(&id, &reason, metadata(&meta)?.as_ref())?;
            println!("{} Skipped {}: {}", style("-").dim(), style(&id).bold(), reason);
        }
        PhaseCommands::Rerun { id, reason } => {
            let marked = ledger.mark_needs_rerun(&id, &reason)?;
            if marked.is_empty() {
                not_applied(&id, "only COMPLETE phases can be marked for rerun");
            } else {
                println!(
                    "{} Marked {} phase(s) for rerun: {}",
                    style("↻").yellow(),
                    marked.len(),
                    marked.join(", ")
                );
            }
        }
        PhaseCommands::Reset { id, all } => match (id, all) {
            (_, true) => {
                ledger.reset_all()?;
                println!("Reset all phases to PENDING");
            }
            (Some(id), false) => {
                if ledger.reset(&id)? {
                    println!("Reset {} to PENDING", style(&id).bold());
                } else {
                    not_applied(&id, "unknown phase");
                }
            }
            (None, false) => bail!("Specify a phase id or --all"),
        },
        PhaseCommands::Status { id, state, json } => {
            return show_status(&ledger, id.as_deref(), state, json);
        }
        PhaseCommands::Report { output } => {
            let path = output.unwrap_or_else(|| config.ledger_report_file());
            write_markdown(&ledger, &path)?;
            println!("Wrote {}", path.display());
            return Ok(());
        }
    }

    refresh_report(config, &ledger)
}

fn show_status(
    ledger: &PhaseLedger,
    id: Option<&str>,
    state: Option<PhaseState>,
    json: bool,
) -> Result<()> {
    let records: Vec<PhaseRecord> = match (id, state) {
        (Some(id), _) => match ledger.status(id) {
            Some(record) => vec![record],
            None => bail!("Unknown phase '{}'", id),
        },
        (None, Some(state)) => ledger.by_state(state),
        (None, None) => ledger.all(),
    };

    if json {
        let out = if id.is_some() {
            serde_json::to_string_pretty(&records[0])?
        } else {
            serde_json::to_string_pretty(&records)?
        };
        println!("{}", out);
        return Ok(());
    }

    println!();
    println!("{}", style("Phase Status").bold());
    println!("{}", style(ledger_location(ledger.path())).dim());
    println!();
    println!("  {:<24} {:<13} {:<20} Details", "Phase", "State", "Completed");
    println!("  {}", "-".repeat(78));
    for record in &records {
        let completed = record
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let details = record
            .error_message
            .as_deref()
            .or(record.rerun_reason.as_deref())
            .or(record.skip_reason.as_deref().map(|_| "skipped"))
            .unwrap_or("");
        println!(
            "  {:<24} {} {:<20} {}",
            record.id,
            state_label(record.state),
            completed,
            style(details).dim()
        );
    }

    let summary = ledger.summary();
    println!();
    let counts: Vec<String> = PhaseState::ALL
        .iter()
        .filter(|s| summary.count(**s) > 0)
        .map(|s| format!("{} {}", summary.count(*s), s))
        .collect();
    println!("  {} phases: {}", summary.total, counts.join(", "));
    println!();
    Ok(())
}

fn ledger_location(path: &Path) -> String {
    format!("Ledger: {}", path.display())
}
