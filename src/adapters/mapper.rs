use anyhow::Result;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::pipeline::collaborators::{
    IntegrationAnalyzer, IntegrationPlan, IntegrationStrategy, StructureMapper,
};
use crate::pipeline::context::{extract_symbols, read_existing};
use crate::pipeline::types::WorkItem;
use crate::util::slugify;

/// Maps an item to `metadata.target_path` (relative to the project) or
/// `<source_dir>/<slug of title>.py`. An explicit path must stay inside the
/// project directory.
pub struct ConventionMapper {
    project_dir: PathBuf,
    source_dir: PathBuf,
}

impl ConventionMapper {
    pub fn new(project_dir: impl Into<PathBuf>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            source_dir: source_dir.into(),
        }
    }
}

#[async_trait]
impl StructureMapper for ConventionMapper {
    async fn map(&self, item: &WorkItem) -> Result<PathBuf> {
        if let Some(explicit) = item.metadata.get("target_path").and_then(|v| v.as_str()) {
            let root = normalize(&self.project_dir);
            let resolved = normalize(&self.project_dir.join(explicit));
            if resolved == root || !resolved.starts_with(&root) {
                anyhow::bail!(
                    "target_path '{}' of work item '{}' resolves outside the project",
                    explicit,
                    item.id
                );
            }
            return Ok(resolved);
        }
        let mut stem = slugify(&item.title, '_', 40);
        if stem.is_empty() {
            stem = slugify(&item.id, '_', 40);
        }
        if stem.is_empty() {
            anyhow::bail!("Work item '{}' has no usable title or id for a file name", item.id);
        }
        if stem.starts_with(|c: char| c.is_ascii_digit()) {
            stem.insert_str(0, "mod_");
        }
        Ok(self.source_dir.join(format!("{}.py", stem)))
    }
}

/// Lexically fold `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Chooses a strategy from the state of the target file. An item may force
/// one with `metadata.strategy`.
pub struct SymbolAnalyzer;

#[async_trait]
impl IntegrationAnalyzer for SymbolAnalyzer {
    async fn analyze(&self, item: &WorkItem, target: &Path) -> Result<IntegrationPlan> {
        let existing = read_existing(target)?;
        let existing_symbols = existing
            .as_deref()
            .map(|code| extract_symbols(code).all())
            .unwrap_or_default();

        let strategy = match item.metadata.get("strategy").and_then(|v| v.as_str()) {
            Some(forced) => forced.parse()?,
            None if existing.is_some() => IntegrationStrategy::Extend,
            None => IntegrationStrategy::CreateNew,
        };
        Ok(IntegrationPlan {
            strategy,
            existing_symbols,
        })
    }
}
