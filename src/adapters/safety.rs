use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::{describe_failure, run_with_timeout, shell};
use crate::config::SafetyCheck;
use crate::pipeline::collaborators::{SafetyChecker, SafetyReport};
use crate::pipeline::types::WorkItem;

/// Runs each configured check once per file, with `{file}` replaced by the
/// quoted path. Failures of critical checks fail the report; the rest are
/// warnings. No checks configured means the report passes.
pub struct CommandSafetyChecker {
    checks: Vec<SafetyCheck>,
    working_dir: PathBuf,
}

impl CommandSafetyChecker {
    pub fn new(checks: Vec<SafetyCheck>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            checks,
            working_dir: working_dir.into(),
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[async_trait]
impl SafetyChecker for CommandSafetyChecker {
    async fn check(&self, paths: &[PathBuf], item: &WorkItem) -> Result<SafetyReport> {
        let mut report = SafetyReport::ok();

        for check in &self.checks {
            for path in paths {
                let script = check
                    .command
                    .replace("{file}", &shell_quote(&path.to_string_lossy()));
                let outcome = run_with_timeout(
                    shell(&script, &self.working_dir),
                    None,
                    Duration::from_secs(check.timeout_secs),
                    &check.name,
                )
                .await;

                let failure = match outcome {
                    Ok(output) if output.status.success() => None,
                    Ok(output) => Some(describe_failure(&output)),
                    Err(e) => Some(format!("{:#}", e)),
                };
                debug!(item = %item.id, check = %check.name, file = %path.display(), ok = failure.is_none(), "Safety check ran");

                if let Some(reason) = failure {
                    let message = format!("{} ({}): {}", check.name, path.display(), reason);
                    if check.critical {
                        report.passed = false;
                        report.critical_failures.push(message);
                    } else {
                        report.warnings.push(message);
                    }
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, command: &str, critical: bool) -> SafetyCheck {
        SafetyCheck {
            name: name.into(),
            command: command.into(),
            critical,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_critical_and_warning_checks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("it's.py");
        std::fs::write(&file, "x = 1\n").unwrap();

        let checker = CommandSafetyChecker::new(
            vec![
                check("exists", "test -f {file}", true),
                check("lint", "grep -q TODO {file}", false),
                check("syntax", "echo 'bad syntax' >&2; exit 1", true),
            ],
            dir.path(),
        );
        let report = checker
            .check(&[file], &WorkItem::new("r1", "x", ""))
            .await
            .unwrap();

        assert!(!report.passed);
        assert_eq!(report.critical_failures.len(), 1);
        assert!(report.critical_failures[0].starts_with("syntax"));
        assert!(report.critical_failures[0].contains("bad syntax"));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("lint"));
    }

    #[tokio::test]
    async fn test_no_checks_passes() {
        let checker = CommandSafetyChecker::new(vec![], "/");
        let report = checker
            .check(&[PathBuf::from("/x.py")], &WorkItem::new("r1", "x", ""))
            .await
            .unwrap();
        assert!(report.passed);
    }
}
