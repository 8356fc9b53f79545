//! File snapshots taken before the pipeline mutates a target.
//!
//! Each backup lives in `<root>/<id>/` with a `manifest.json` and one stored
//! copy per captured file. Files that did not exist are recorded too, so that
//! restoring removes anything the pipeline created.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub existed: bool,
    /// Stored copy, relative to the backup directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub work_item_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
}

impl Backup {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Snapshot `paths` for `work_item_id`.
    pub fn create(&self, work_item_id: &str, paths: &[PathBuf]) -> Result<Backup> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.dir(&id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;

        let mut entries = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            if path.is_file() {
                let bytes = fs::read(path)
                    .with_context(|| format!("Failed to read {} for backup", path.display()))?;
                let stored_as = format!("{}.bak", i);
                fs::write(dir.join(&stored_as), &bytes)
                    .with_context(|| format!("Failed to store backup of {}", path.display()))?;
                entries.push(BackupEntry {
                    path: path.clone(),
                    existed: true,
                    stored_as: Some(stored_as),
                    sha256: Some(digest(&bytes)),
                });
            } else {
                entries.push(BackupEntry {
                    path: path.clone(),
                    existed: false,
                    stored_as: None,
                    sha256: None,
                });
            }
        }

        let backup = Backup {
            id,
            work_item_id: work_item_id.to_string(),
            created_at: Utc::now(),
            entries,
        };
        let manifest =
            serde_json::to_string_pretty(&backup).context("Failed to serialize backup manifest")?;
        fs::write(dir.join(MANIFEST), manifest).context("Failed to write backup manifest")?;

        debug!(backup = %backup.id, item = %work_item_id, files = paths.len(), "Backup created");
        Ok(backup)
    }

    /// Load a backup manifest by id.
    pub fn load(&self, id: &str) -> Result<Backup> {
        let path = self.dir(id).join(MANIFEST);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read backup manifest {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse backup manifest {}", path.display()))
    }

    /// All backups taken for one work item, oldest first.
    pub fn list_for(&self, work_item_id: &str) -> Result<Vec<Backup>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.root).context("Failed to read backup directory")? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if let Ok(backup) = self.load(&id)
                && backup.work_item_id == work_item_id
            {
                backups.push(backup);
            }
        }
        backups.sort_by_key(|b| b.created_at);
        Ok(backups)
    }

    /// Put every captured file back exactly as it was. Returns the touched paths.
    pub fn restore(&self, backup: &Backup) -> Result<Vec<PathBuf>> {
        let dir = self.dir(&backup.id);
        let mut restored = Vec::new();

        for entry in &backup.entries {
            match (&entry.stored_as, entry.existed) {
                (Some(stored_as), true) => {
                    let bytes = fs::read(dir.join(stored_as)).with_context(|| {
                        format!("Backup copy of {} is missing", entry.path.display())
                    })?;
                    if let Some(expected) = &entry.sha256
                        && &digest(&bytes) != expected
                    {
                        bail!("Backup copy of {} is corrupt", entry.path.display());
                    }
                    if let Some(parent) = entry.path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&entry.path, &bytes)
                        .with_context(|| format!("Failed to restore {}", entry.path.display()))?;
                }
                _ => {
                    if entry.path.exists() {
                        fs::remove_file(&entry.path).with_context(|| {
                            format!("Failed to remove created file {}", entry.path.display())
                        })?;
                    }
                }
            }
            restored.push(entry.path.clone());
        }

        info!(backup = %backup.id, item = %backup.work_item_id, files = restored.len(), "Backup restored");
        Ok(restored)
    }
}
