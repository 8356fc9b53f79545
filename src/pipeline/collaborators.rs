//! Seams between the pipeline and the outside world.
//!
//! The orchestrator only talks to these traits. Default implementations live
//! in `crate::adapters`; tests substitute in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::types::WorkItem;

/// How generated code should relate to what already exists at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationStrategy {
    #[default]
    CreateNew,
    Extend,
    Modify,
}

impl IntegrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStrategy::CreateNew => "create-new",
            IntegrationStrategy::Extend => "extend",
            IntegrationStrategy::Modify => "modify",
        }
    }
}

impl std::fmt::Display for IntegrationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntegrationStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "create-new" | "create" | "new" => Ok(Self::CreateNew),
            "extend" => Ok(Self::Extend),
            "modify" => Ok(Self::Modify),
            _ => anyhow::bail!("Unknown integration strategy '{}'", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationPlan {
    pub strategy: IntegrationStrategy,
    pub existing_symbols: Vec<String>,
}

/// What the code generator sees about the target.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub target_path: PathBuf,
    pub existing_code: Option<String>,
    pub existing_symbols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyReport {
    pub passed: bool,
    pub critical_failures: Vec<String>,
    pub warnings: Vec<String>,
}

impl SafetyReport {
    pub fn ok() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait StructureMapper: Send + Sync {
    /// Where the implementation for `item` belongs.
    async fn map(&self, item: &WorkItem) -> Result<PathBuf>;
}

#[async_trait]
pub trait IntegrationAnalyzer: Send + Sync {
    async fn analyze(&self, item: &WorkItem, target: &Path) -> Result<IntegrationPlan>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        item: &WorkItem,
        context: &GenerationContext,
        strategy: IntegrationStrategy,
    ) -> Result<String>;
}

#[async_trait]
pub trait SafetyChecker: Send + Sync {
    async fn check(&self, paths: &[PathBuf], item: &WorkItem) -> Result<SafetyReport>;
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn create_branch(&self, branch: &str) -> Result<()>;
    async fn commit(&self, files: &[PathBuf], message: &str) -> Result<()>;
    async fn push(&self, branch: &str) -> Result<()>;
    /// Returns the pull request URL.
    async fn create_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<String>;
    /// Undo `create_branch`: return to the base branch and delete `branch`.
    async fn rollback_branch(&self, branch: &str) -> Result<()>;
}

/// Free-form completion used by the test stage.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Everything the orchestrator needs from outside, bundled.
#[derive(Clone)]
pub struct Collaborators {
    pub mapper: Arc<dyn StructureMapper>,
    pub analyzer: Arc<dyn IntegrationAnalyzer>,
    pub generator: Arc<dyn CodeGenerator>,
    pub safety: Arc<dyn SafetyChecker>,
    pub vcs: Arc<dyn VersionControl>,
}
