//! Markdown status document for the phase ledger. Write-only output.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;

use super::write_atomic;
use crate::ledger::{PhaseLedger, PhaseRecord, PhaseState};

fn timestamp(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn render_phase(out: &mut String, record: &PhaseRecord) {
    out.push_str(&format!("### {}\n\n", record.id));
    out.push_str(&format!("- Started: {}\n", timestamp(&record.started_at)));
    out.push_str(&format!("- Completed: {}\n", timestamp(&record.completed_at)));
    if let Some(d) = record.duration_secs {
        out.push_str(&format!("- Duration: {:.1}s\n", d));
    }
    out.push_str(&format!(
        "- Dependencies met: {}\n",
        if record.dependencies_met { "yes" } else { "no" }
    ));
    if let Some(e) = &record.error_message {
        out.push_str(&format!("- Error: {}\n", e));
    }
    if let Some(r) = &record.rerun_reason {
        out.push_str(&format!("- Rerun reason: {}\n", r));
    }
    if let Some(r) = &record.skip_reason {
        out.push_str(&format!("- Skipped: {}\n", r));
    }
    if !record.metadata.is_empty() {
        out.push_str("- Metadata:\n");
        for (k, v) in record.metadata.iter() {
            out.push_str(&format!("  - {}: {}\n", k, v));
        }
    }
    out.push('\n');
}

/// Render every phase grouped by state, then the dependency list.
pub fn render_markdown(ledger: &PhaseLedger, generated_at: DateTime<Utc>) -> String {
    let phases = ledger.all();
    let summary = ledger.summary();
    let mut out = String::new();

    out.push_str("# Phase Status\n\n");
    out.push_str(&format!(
        "_Generated {}_\n\n",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    out.push_str("## Summary\n\n");
    out.push_str("| State | Count |\n");
    out.push_str("|-------|-------|\n");
    for state in PhaseState::ALL {
        out.push_str(&format!("| {} | {} |\n", state, summary.count(state)));
    }
    out.push_str(&format!("| **Total** | **{}** |\n\n", summary.total));

    for state in PhaseState::ALL {
        let bucket: Vec<&PhaseRecord> = phases.iter().filter(|p| p.state == state).collect();
        if bucket.is_empty() {
            continue;
        }
        out.push_str(&format!("## {} ({})\n\n", state, bucket.len()));
        for record in bucket {
            render_phase(&mut out, record);
        }
    }

    let graph = ledger.graph();
    if !graph.is_empty() {
        out.push_str("## Dependencies\n\n");
        for id in graph.phase_ids() {
            let deps = graph.dependencies(id);
            if deps.is_empty() {
                out.push_str(&format!("- `{}`: none\n", id));
            } else {
                let list = deps
                    .iter()
                    .map(|d| format!("`{}`", d))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("- `{}`: {}\n", id, list));
            }
        }
    }
    out
}

/// Render and write the status document to `path`.
pub fn write_markdown(ledger: &PhaseLedger, path: &Path) -> Result<()> {
    let content = render_markdown(ledger, Utc::now());
    write_atomic(path, content.as_bytes())
        .with_context(|| format!("Failed to write status report to {}", path.display()))
}
