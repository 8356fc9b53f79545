//! Configuration for rollout.
//!
//! Settings are read from `.rollout/rollout.toml` and layered:
//! file → environment (`.env` is loaded first) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! source_dir = "src"
//! tests_dir = "tests"
//!
//! [ledger]
//! file = "phase_status.json"
//! report = "PHASE_STATUS.md"
//!
//! [ledger.phases]
//! data-inventory = []
//! synthesis = ["data-inventory"]
//!
//! [pipeline]
//! block_on_test_failure = true
//! max_consecutive_failures = 3
//! publish = "pull-request"
//!
//! [tests]
//! command = ["python", "-m", "pytest"]
//! timeout_secs = 300
//!
//! [generator]
//! command = "claude"
//!
//! [[safety.checks]]
//! name = "syntax"
//! command = "python -m py_compile {file}"
//! critical = true
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::LedgerError;
use crate::ledger::DependencyGraph;
use crate::logging::{LogFormat, LoggingConfig};

/// Name of the per-project state directory.
pub const ROLLOUT_DIR: &str = ".rollout";
pub const CONFIG_FILE: &str = "rollout.toml";

/// How far a successful item is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
    /// Leave changes in the working tree
    None,
    /// Branch, commit and push
    Push,
    /// Branch, commit, push and open a pull request
    #[default]
    PullRequest,
}

impl PublishMode {
    pub fn publishes(&self) -> bool {
        !matches!(self, PublishMode::None)
    }

    pub fn opens_pull_request(&self) -> bool {
        matches!(self, PublishMode::PullRequest)
    }
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishMode::None => write!(f, "none"),
            PublishMode::Push => write!(f, "push"),
            PublishMode::PullRequest => write!(f, "pull-request"),
        }
    }
}

impl std::str::FromStr for PublishMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "none" => Ok(PublishMode::None),
            "push" => Ok(PublishMode::Push),
            "pull-request" | "pr" => Ok(PublishMode::PullRequest),
            _ => anyhow::bail!(
                "Invalid publish mode '{}'. Valid values: none, push, pull-request",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
    #[serde(default = "default_tests_dir")]
    pub tests_dir: String,
}

fn default_source_dir() -> String {
    "src".to_string()
}

fn default_tests_dir() -> String {
    "tests".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            source_dir: default_source_dir(),
            tests_dir: default_tests_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    /// Ledger document, relative to `.rollout/`
    #[serde(default = "default_ledger_file")]
    pub file: String,
    /// Rendered status report, relative to `.rollout/`
    #[serde(default = "default_report_file")]
    pub report: String,
    /// Phase the deploy command records its progress under
    #[serde(default = "default_pipeline_phase")]
    pub pipeline_phase: String,
    /// Replaces the built-in workflow graph when present
    #[serde(default)]
    pub phases: Option<BTreeMap<String, Vec<String>>>,
}

fn default_ledger_file() -> String {
    "phase_status.json".to_string()
}

fn default_report_file() -> String {
    "PHASE_STATUS.md".to_string()
}

fn default_pipeline_phase() -> String {
    "integration".to_string()
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            file: default_ledger_file(),
            report: default_report_file(),
            pipeline_phase: default_pipeline_phase(),
            phases: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub block_on_test_failure: bool,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub publish: PublishMode,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_max_failures() -> u32 {
    3
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "rollout/".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            dry_run: false,
            block_on_test_failure: true,
            max_consecutive_failures: default_max_failures(),
            publish: PublishMode::default(),
            base_branch: default_base_branch(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default = "default_test_command")]
    pub command: Vec<String>,
    #[serde(default = "default_test_args")]
    pub args: Vec<String>,
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_failure_summaries")]
    pub max_failure_summaries: usize,
}

fn default_test_command() -> Vec<String> {
    vec!["python".into(), "-m".into(), "pytest".into()]
}

fn default_test_args() -> Vec<String> {
    vec!["-q".into(), "-rf".into()]
}

fn default_test_timeout() -> u64 {
    300
}

fn default_max_failure_summaries() -> usize {
    10
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            command: default_test_command(),
            args: default_test_args(),
            timeout_secs: default_test_timeout(),
            max_failure_summaries: default_max_failure_summaries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_generator_args")]
    pub args: Vec<String>,
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
}

fn default_generator_args() -> Vec<String> {
    vec!["--print".into()]
}

fn default_generator_timeout() -> u64 {
    600
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_generator_args(),
            timeout_secs: default_generator_timeout(),
        }
    }
}

/// One safety check command; `{file}` is replaced by each checked path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub name: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

fn default_check_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetySection {
    #[serde(default)]
    pub checks: Vec<SafetyCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: false,
        }
    }
}

/// Parsed `rollout.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl RolloutToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse rollout.toml")
    }

    /// Load `.rollout/rollout.toml`, or defaults if it does not exist.
    pub fn load_or_default(rollout_dir: &Path) -> Result<Self> {
        let path = rollout_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize rollout.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Human-readable warnings about suspicious settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.pipeline.max_consecutive_failures == 0 {
            warnings.push(
                "pipeline.max_consecutive_failures is 0: the circuit breaker opens before the first item"
                    .to_string(),
            );
        }
        if self.tests.command.is_empty() {
            warnings.push("tests.command is empty: tests cannot run".to_string());
        }
        if self.tests.timeout_secs == 0 {
            warnings.push("tests.timeout_secs is 0: every test run will time out".to_string());
        }
        if self.generator.timeout_secs == 0 {
            warnings.push("generator.timeout_secs is 0: every generation will time out".to_string());
        }
        for check in &self.safety.checks {
            if !check.command.contains("{file}") {
                warnings.push(format!(
                    "safety check '{}' does not reference {{file}}",
                    check.name
                ));
            }
        }
        if let Some(phases) = &self.ledger.phases {
            if let Err(e) = DependencyGraph::from_table(phases) {
                warnings.push(format!("ledger.phases is invalid: {}", e));
            } else if !phases.contains_key(&self.ledger.pipeline_phase) {
                warnings.push(format!(
                    "ledger.pipeline_phase '{}' is not part of ledger.phases",
                    self.ledger.pipeline_phase
                ));
            }
        }
        warnings
    }
}

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub dry_run: Option<bool>,
    pub max_failures: Option<u32>,
    pub block_on_test_failure: Option<bool>,
    pub publish: Option<PublishMode>,
    pub log_format: Option<LogFormat>,
    pub verbose: bool,
}

/// Resolved runtime configuration for one project.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub rollout_dir: PathBuf,
    pub toml: RolloutToml,
    pub overrides: CliOverrides,
}

impl Config {
    /// Load configuration for `project_dir`, reading `.env` first.
    pub fn load(project_dir: &Path, overrides: CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let env_file = project_dir.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }
        let rollout_dir = project_dir.join(ROLLOUT_DIR);
        let toml = RolloutToml::load_or_default(&rollout_dir)?;
        Ok(Self {
            project_dir,
            rollout_dir,
            toml,
            overrides,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.rollout_dir.clone(),
            self.backups_dir(),
            self.reports_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.rollout_dir.join(CONFIG_FILE)
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.rollout_dir.join(&self.toml.ledger.file)
    }

    pub fn ledger_report_file(&self) -> PathBuf {
        self.rollout_dir.join(&self.toml.ledger.report)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.rollout_dir.join("backups")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.rollout_dir.join("reports")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.rollout_dir.join("logs")
    }

    pub fn source_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.project.source_dir)
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.project.tests_dir)
    }

    /// The configured phase graph, or the built-in workflow.
    pub fn dependency_graph(&self) -> Result<DependencyGraph, LedgerError> {
        match &self.toml.ledger.phases {
            Some(table) => DependencyGraph::from_table(table),
            None => Ok(DependencyGraph::default_workflow()),
        }
    }

    /// Generator command (env → file → default).
    pub fn generator_cmd(&self) -> String {
        std::env::var("ROLLOUT_GENERATOR_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.toml.generator.command.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.generator.timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.tests.timeout_secs)
    }

    /// Dry-run (CLI → env → file).
    pub fn dry_run(&self) -> bool {
        if let Some(v) = self.overrides.dry_run {
            return v;
        }
        if let Ok(v) = std::env::var("ROLLOUT_DRY_RUN") {
            return matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        self.toml.pipeline.dry_run
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.overrides
            .max_failures
            .unwrap_or(self.toml.pipeline.max_consecutive_failures)
    }

    pub fn block_on_test_failure(&self) -> bool {
        self.overrides
            .block_on_test_failure
            .unwrap_or(self.toml.pipeline.block_on_test_failure)
    }

    pub fn publish_mode(&self) -> PublishMode {
        self.overrides.publish.unwrap_or(self.toml.pipeline.publish)
    }

    pub fn logging(&self) -> LoggingConfig {
        let level = if self.overrides.verbose {
            "debug".to_string()
        } else {
            self.toml.logging.level.clone()
        };
        LoggingConfig {
            level,
            format: self.overrides.log_format.unwrap_or(self.toml.logging.format),
            file_dir: self.toml.logging.file.then(|| self.log_dir()),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = RolloutToml::default();
        assert_eq!(toml.project.source_dir, "src");
        assert_eq!(toml.project.tests_dir, "tests");
        assert_eq!(toml.pipeline.max_consecutive_failures, 3);
        assert!(toml.pipeline.block_on_test_failure);
        assert_eq!(toml.pipeline.publish, PublishMode::PullRequest);
        assert_eq!(toml.tests.command, vec!["python", "-m", "pytest"]);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let toml = RolloutToml::parse(
            r#"
[pipeline]
publish = "push"
max_consecutive_failures = 5

[[safety.checks]]
name = "syntax"
command = "python -m py_compile {file}"

[ledger.phases]
collect = []
report = ["collect"]
"#,
        )
        .unwrap();

        assert_eq!(toml.pipeline.publish, PublishMode::Push);
        assert_eq!(toml.pipeline.max_consecutive_failures, 5);
        assert!(toml.pipeline.block_on_test_failure);
        assert_eq!(toml.safety.checks.len(), 1);
        assert!(toml.safety.checks[0].critical);
        assert_eq!(toml.safety.checks[0].timeout_secs, 60);
        assert_eq!(toml.ledger.phases.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_validate_flags_problems() {
        let mut toml = RolloutToml::default();
        toml.pipeline.max_consecutive_failures = 0;
        toml.tests.command.clear();
        toml.safety.checks.push(SafetyCheck {
            name: "lint".into(),
            command: "ruff check".into(),
            critical: false,
            timeout_secs: 10,
        });
        let mut phases = BTreeMap::new();
        phases.insert("a".to_string(), vec!["missing".to_string()]);
        toml.ledger.phases = Some(phases);

        let warnings = toml.validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("circuit breaker")));
        assert!(warnings.iter().any(|w| w.contains("lint")));
        assert!(warnings.iter().any(|w| w.contains("ledger.phases")));
    }

    #[test]
    fn test_publish_mode_parse() {
        assert_eq!("pr".parse::<PublishMode>().unwrap(), PublishMode::PullRequest);
        assert_eq!("pull_request".parse::<PublishMode>().unwrap(), PublishMode::PullRequest);
        assert_eq!("none".parse::<PublishMode>().unwrap(), PublishMode::None);
        assert!("ship".parse::<PublishMode>().is_err());
        assert!(!PublishMode::None.publishes());
        assert!(PublishMode::Push.publishes());
        assert!(!PublishMode::Push.opens_pull_request());
    }

    #[test]
    fn test_config_paths_and_overrides() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(ROLLOUT_DIR)).unwrap();
        fs::write(
            dir.path().join(ROLLOUT_DIR).join(CONFIG_FILE),
            "[pipeline]\nmax_consecutive_failures = 7\nblock_on_test_failure = true\n",
        )
        .unwrap();

        let overrides = CliOverrides {
            block_on_test_failure: Some(false),
            publish: Some(PublishMode::None),
            ..Default::default()
        };
        let config = Config::load(dir.path(), overrides).unwrap();
        let root = dir.path().canonicalize().unwrap();

        assert_eq!(config.ledger_file(), root.join(".rollout/phase_status.json"));
        assert_eq!(config.backups_dir(), root.join(".rollout/backups"));
        assert_eq!(config.tests_dir(), root.join("tests"));
        assert_eq!(config.max_consecutive_failures(), 7);
        assert!(!config.block_on_test_failure());
        assert_eq!(config.publish_mode(), PublishMode::None);
    }

    #[test]
    fn test_dependency_graph_from_config() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path(), CliOverrides::default()).unwrap();
        let graph = config.dependency_graph().unwrap();
        assert!(graph.contains("integration"));

        let mut custom = config.clone();
        let mut phases = BTreeMap::new();
        phases.insert("only".to_string(), vec![]);
        custom.toml.ledger.phases = Some(phases);
        let graph = custom.dependency_graph().unwrap();
        assert_eq!(graph.phase_ids(), &["only".to_string()]);
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path(), CliOverrides::default()).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.backups_dir().exists());
        assert!(config.reports_dir().exists());
        assert!(config.log_dir().exists());
    }
}
