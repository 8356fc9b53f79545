use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

use super::write_atomic;
use crate::pipeline::DeploymentReport;

/// `<reports_dir>/deploy-<YYYYmmdd-HHMMSS>.json`
pub fn default_report_path(reports_dir: &Path, started_at: DateTime<Utc>) -> PathBuf {
    reports_dir.join(format!("deploy-{}.json", started_at.format("%Y%m%d-%H%M%S")))
}

/// Serialize `report` as pretty JSON to `path`.
pub fn write_json(report: &DeploymentReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize deployment report")?;
    write_atomic(path, json.as_bytes())
        .with_context(|| format!("Failed to write deployment report to {}", path.display()))?;
    info!(path = %path.display(), "Deployment report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DeploymentResult, WorkItem};
    use chrono::TimeZone;

    #[test]
    fn test_default_path_is_timestamped() {
        let t = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(
            default_report_path(Path::new("/r"), t),
            PathBuf::from("/r/deploy-20260304-050607.json")
        );
    }

    #[test]
    fn test_write_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut ok = DeploymentResult::new(&WorkItem::new("r1", "A", ""));
        ok.success = true;
        let now = Utc::now();
        let report = DeploymentReport::from_results(vec![ok], 2, true, now, now);

        let path = dir.path().join("reports/out.json");
        write_json(&report, &path).unwrap();

        let back: DeploymentReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.total_recommendations, 1);
        assert_eq!(back.batch_size, 2);
        assert!(back.halted_by_circuit_breaker);
        assert_eq!(back.results[0].work_item_id, "r1");
    }
}
