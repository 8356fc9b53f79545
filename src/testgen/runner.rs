//! External test runner invocation and summary parsing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::TestStageError;

static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bin\s+(\d+(?:\.\d+)?)s\b").expect("valid duration regex"));
static PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s+passed\b").expect("valid passed regex"));
static FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s+failed\b").expect("valid failed regex"));
static SKIPPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s+skipped\b").expect("valid skipped regex"));
static ERRORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s+errors?\b").expect("valid errors regex"));

pub const UNPARSABLE_MESSAGE: &str = "could not parse results";

/// Verdict from one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// True iff `failed_count == 0` and a summary was found
    pub passed: bool,
    pub total: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Seconds, as reported by the runner
    pub execution_time: f64,
    pub failure_summaries: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TestResult {
    /// A failed result with zero counts and a single message.
    pub fn failed_with(message: impl Into<String>, raw_output: String) -> Self {
        Self {
            passed: false,
            total: 0,
            passed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            execution_time: 0.0,
            failure_summaries: vec![message.into()],
            raw_output,
            exit_code: None,
        }
    }
}

fn count(re: &Regex, line: &str) -> Option<usize> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse runner output. Scans from the bottom for the summary line
/// (`5 passed, 2 failed, 1 skipped in 1.23s`); errors count as failures.
pub fn parse_output(output: &str, max_failures: usize) -> TestResult {
    let summary = output.lines().rev().find_map(|line| {
        let secs: f64 = DURATION.captures(line)?.get(1)?.as_str().parse().ok()?;
        let passed = count(&PASSED, line);
        let failed = count(&FAILED, line);
        let skipped = count(&SKIPPED, line);
        let errors = count(&ERRORS, line);
        if passed.is_none() && failed.is_none() && skipped.is_none() && errors.is_none() {
            return None;
        }
        Some((
            passed.unwrap_or(0),
            failed.unwrap_or(0) + errors.unwrap_or(0),
            skipped.unwrap_or(0),
            secs,
        ))
    });

    let Some((passed_count, failed_count, skipped_count, execution_time)) = summary else {
        return TestResult::failed_with(UNPARSABLE_MESSAGE, output.to_string());
    };

    let failure_summaries = output
        .lines()
        .filter_map(|l| {
            let l = l.trim();
            l.strip_prefix("FAILED ")
                .or_else(|| l.strip_prefix("ERROR "))
                .map(|rest| rest.trim().to_string())
        })
        .take(max_failures)
        .collect();

    TestResult {
        passed: failed_count == 0,
        total: passed_count + failed_count + skipped_count,
        passed_count,
        failed_count,
        skipped_count,
        execution_time,
        failure_summaries,
        raw_output: output.to_string(),
        exit_code: None,
    }
}

/// Runs `<command...> <test file> <args...> <extra args...>` in the project directory.
#[derive(Debug, Clone)]
pub struct TestRunner {
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub max_failure_summaries: usize,
    pub working_dir: PathBuf,
}

impl TestRunner {
    pub fn new(command: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            args: Vec::new(),
            timeout: Duration::from_secs(300),
            max_failure_summaries: 10,
            working_dir: working_dir.into(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failure_summaries(mut self, max: usize) -> Self {
        self.max_failure_summaries = max;
        self
    }

    /// Run the suite at `test_file`. A timeout or unparsable output yields a
    /// failed result; only a spawn failure is an error.
    pub async fn run(
        &self,
        test_file: &Path,
        extra_args: &[String],
    ) -> Result<TestResult, TestStageError> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or(TestStageError::EmptyCommand)?;

        debug!(
            runner = %program,
            file = %test_file.display(),
            timeout_secs = self.timeout.as_secs(),
            "Running tests"
        );

        let child = Command::new(program)
            .args(base_args)
            .arg(test_file)
            .args(&self.args)
            .args(extra_args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TestStageError::SpawnFailed {
                command: self.command.join(" "),
                source,
            })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(TestStageError::SpawnFailed {
                    command: self.command.join(" "),
                    source,
                });
            }
            Err(_) => {
                warn!(file = %test_file.display(), "Test run timed out");
                let mut result = TestResult::failed_with(
                    format!("Test run timed out after {} seconds", self.timeout.as_secs()),
                    String::new(),
                );
                result.execution_time = self.timeout.as_secs_f64();
                return Ok(result);
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let mut result = parse_output(&combined, self.max_failure_summaries);
        result.exit_code = output.status.code();
        info!(
            file = %test_file.display(),
            passed = result.passed,
            total = result.total,
            failed = result.failed_count,
            "Tests finished"
        );
        Ok(result)
    }
}
