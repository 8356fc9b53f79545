//! Typed error hierarchy for rollout.
//!
//! Three top-level enums cover the three subsystems:
//! - `LedgerError`: phase ledger persistence and graph construction
//! - `PipelineError`: per-item deployment pipeline step failures
//! - `TestStageError`: test suite persistence and runner spawn failures
//!
//! Ledger usage mistakes (unknown phase, invalid transition) are not errors;
//! the ledger logs them and reports the operation as not applied.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the phase ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to read ledger file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write ledger file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock ledger at {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize ledger: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Ledger lock poisoned")]
    LockPoisoned,

    #[error("Duplicate phase in dependency graph: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Dependency cycle detected involving phase {0}")]
    Cycle(String),
}

/// Errors from a single work item's pass through the deployment pipeline.
///
/// The `Display` text of each variant is what ends up in
/// `DeploymentResult::error_message`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Structure mapping failed: {0}")]
    Mapping(String),

    #[error("Integration analysis failed: {0}")]
    Integration(String),

    #[error("Failed to read existing file {path}: {message}")]
    Context { path: PathBuf, message: String },

    #[error("Code generation failed: {0}")]
    Generation(String),

    #[error("Failed to write generated code to {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Safety checks failed: {}", .0.join("; "))]
    SafetyFailed(Vec<String>),

    #[error("Safety checker error: {0}")]
    SafetyChecker(String),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("Tests failed: {0}")]
    TestsFailed(String),

    #[error(transparent)]
    TestStage(#[from] TestStageError),

    #[error("Failed to create branch: {0}")]
    Branch(String),

    #[error("Failed to commit changes: {0}")]
    Commit(String),

    #[error("Failed to push branch: {0}")]
    Push(String),

    #[error("Failed to create pull request: {0}")]
    PullRequest(String),
}

impl PipelineError {
    /// Whether the failure happened inside the version-control publication chain.
    pub fn is_publication(&self) -> bool {
        matches!(
            self,
            Self::Branch(_) | Self::Commit(_) | Self::Push(_) | Self::PullRequest(_)
        )
    }
}

/// Errors from the test stage that prevent a verdict from being produced.
#[derive(Debug, Error)]
pub enum TestStageError {
    #[error("Failed to write test file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn test runner '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Test runner command is empty")]
    EmptyCommand,
}
