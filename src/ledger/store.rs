//! On-disk persistence for the phase ledger.
//!
//! The whole ledger is one JSON document. Writes go to a temp file that is
//! fsynced and renamed over the target, so readers only ever observe a complete
//! document. Cross-process writers serialize on an exclusive lock held on a
//! sibling `.lock` file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::state::PhaseRecord;
use crate::errors::LedgerError;

/// Serialized form of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub last_updated: DateTime<Utc>,
    pub phases: BTreeMap<String, PhaseRecord>,
}

/// Held while a read-modify-write sequence runs; the OS lock is released when
/// the file handle drops.
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| LedgerError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Block until the exclusive cross-process lock is held.
    pub fn lock(&self) -> Result<StoreLock, LedgerError> {
        self.ensure_parent()?;
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| LedgerError::LockFailed {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| LedgerError::LockFailed {
                path: lock_path,
                source,
            })?;
        Ok(StoreLock { file })
    }

    /// Load the document, or `None` when nothing has been persisted yet.
    pub fn load(&self) -> Result<Option<LedgerDocument>, LedgerError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|source| LedgerError::ReadFailed {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let doc = serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(doc))
    }

    /// Atomically replace the persisted document.
    pub fn save(&self, doc: &LedgerDocument) -> Result<(), LedgerError> {
        self.ensure_parent()?;
        let content = serde_json::to_string_pretty(doc).map_err(LedgerError::Serialize)?;
        let tmp = self.tmp_path();

        let write = |tmp: &Path| -> std::io::Result<()> {
            let mut file = File::create(tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            Ok(())
        };
        write(&tmp).map_err(|source| LedgerError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;

        fs::rename(&tmp, &self.path).map_err(|source| LedgerError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), phases = doc.phases.len(), "Ledger persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("phase_status.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_creates_parent_and_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/phase_status.json");
        let store = LedgerStore::new(&path);

        let mut phases = BTreeMap::new();
        phases.insert("a".to_string(), PhaseRecord::new("a"));
        let doc = LedgerDocument {
            last_updated: Utc::now(),
            phases,
        };
        store.save(&doc).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested/phase_status.json.tmp").exists());
        assert_eq!(store.load().unwrap(), Some(doc));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phase_status.json");
        fs::write(&path, "{not json").unwrap();
        let store = LedgerStore::new(&path);
        assert!(matches!(store.load(), Err(LedgerError::Corrupt { .. })));
    }

    #[test]
    fn test_lock_is_reacquirable_after_drop() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("phase_status.json"));
        {
            let _guard = store.lock().unwrap();
        }
        let _again = store.lock().unwrap();
        assert!(dir.path().join("phase_status.json.lock").exists());
    }
}
