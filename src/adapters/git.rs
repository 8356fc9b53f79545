//! Version control through `git2` for local operations and the `git`/`gh`
//! CLIs for anything that talks to a remote.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, Repository, Signature, build::CheckoutBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{describe_failure, run_with_timeout};
use crate::pipeline::collaborators::VersionControl;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct GitVcs {
    project_dir: PathBuf,
    base_branch: String,
    remote: String,
}

impl GitVcs {
    pub fn new(project_dir: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            base_branch: base_branch.into(),
            remote: "origin".to_string(),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.project_dir).with_context(|| {
            format!(
                "Failed to open git repository at {}",
                self.project_dir.display()
            )
        })
    }

    async fn run_cli(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.project_dir);
        let what = format!("{} {}", program, args.first().copied().unwrap_or_default());
        let output = run_with_timeout(cmd, None, REMOTE_TIMEOUT, &what).await?;
        if !output.status.success() {
            bail!("{} failed with {}", what, describe_failure(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Path of `file` relative to the repository work tree.
fn relative_to_workdir(workdir: &Path, file: &Path) -> Result<PathBuf> {
    let workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
    let file = match file.canonicalize() {
        Ok(p) => p,
        // Deleted files cannot be canonicalized; resolve through their parent.
        Err(_) => match (file.parent().and_then(|p| p.canonicalize().ok()), file.file_name()) {
            (Some(parent), Some(name)) => parent.join(name),
            _ => file.to_path_buf(),
        },
    };
    file.strip_prefix(&workdir)
        .map(Path::to_path_buf)
        .with_context(|| format!("{} is outside the repository", file.display()))
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn create_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let head = repo
            .head()
            .context("Repository has no commits")?
            .peel_to_commit()?;
        repo.branch(branch, &head, false)
            .with_context(|| format!("Failed to create branch {}", branch))?;
        // Same commit, so the work tree and index carry over untouched.
        repo.set_head(&format!("refs/heads/{}", branch))?;
        info!(branch = %branch, "Created branch");
        Ok(())
    }

    async fn commit(&self, files: &[PathBuf], message: &str) -> Result<()> {
        let repo = self.repo()?;
        let workdir = repo
            .workdir()
            .context("Cannot commit in a bare repository")?
            .to_path_buf();

        let mut index = repo.index()?;
        for file in files {
            let rel = relative_to_workdir(&workdir, file)?;
            if file.exists() {
                index.add_path(&rel)?;
            } else {
                index.remove_path(&rel)?;
            }
        }
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("rollout", "rollout@localhost"))?;
        let parent = repo.head()?.peel_to_commit()?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        debug!(commit = %oid, files = files.len(), "Committed changes");
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<()> {
        self.run_cli("git", &["push", "-u", &self.remote, branch])
            .await
            .with_context(|| format!("Failed to push branch {}", branch))?;
        info!(branch = %branch, remote = %self.remote, "Pushed branch");
        Ok(())
    }

    async fn create_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let url = self
            .run_cli(
                "gh",
                &[
                    "pr",
                    "create",
                    "--base",
                    &self.base_branch,
                    "--head",
                    branch,
                    "--title",
                    title,
                    "--body",
                    body,
                ],
            )
            .await?;
        if url.is_empty() {
            bail!("gh pr create returned no URL");
        }
        Ok(url)
    }

    async fn rollback_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let base_ref = format!("refs/heads/{}", self.base_branch);
        let base = repo
            .find_reference(&base_ref)
            .with_context(|| format!("Base branch {} not found", self.base_branch))?
            .peel_to_commit()?;

        repo.checkout_tree(base.as_object(), Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out {}", self.base_branch))?;
        repo.set_head(&base_ref)?;

        repo.find_branch(branch, BranchType::Local)?
            .delete()
            .with_context(|| format!("Failed to delete branch {}", branch))?;
        info!(branch = %branch, base = %self.base_branch, "Rolled back branch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitVcs, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        repo.set_head("refs/heads/main").unwrap();

        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        (GitVcs::new(dir.path(), "main"), dir)
    }

    fn head_name(dir: &Path) -> String {
        let repo = Repository::open(dir).unwrap();
        let head = repo.head().unwrap();
        head.shorthand().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_branch_commit_and_rollback() {
        let (vcs, dir) = setup_repo();

        vcs.create_branch("rollout/r1-cache").await.unwrap();
        assert_eq!(head_name(dir.path()), "rollout/r1-cache");

        let file = dir.path().join("src/cache.py");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "B\n").unwrap();
        vcs.commit(&[file.clone()], "Add cache").await.unwrap();

        {
            let repo = Repository::open(dir.path()).unwrap();
            let head = repo.head().unwrap().peel_to_commit().unwrap();
            assert_eq!(head.message(), Some("Add cache"));
            assert!(head.tree().unwrap().get_path(Path::new("src/cache.py")).is_ok());
        }

        vcs.rollback_branch("rollout/r1-cache").await.unwrap();
        assert_eq!(head_name(dir.path()), "main");
        assert!(!file.exists());
        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.find_branch("rollout/r1-cache", BranchType::Local).is_err());
    }

    #[tokio::test]
    async fn test_push_without_remote_fails() {
        let (vcs, _dir) = setup_repo();
        vcs.create_branch("rollout/r2").await.unwrap();
        let err = vcs.push("rollout/r2").await.unwrap_err();
        assert!(format!("{:#}", err).contains("rollout/r2"));
    }

    #[test]
    fn test_relative_to_workdir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "").unwrap();
        assert_eq!(
            relative_to_workdir(dir.path(), &dir.path().join("a.py")).unwrap(),
            PathBuf::from("a.py")
        );
        assert_eq!(
            relative_to_workdir(dir.path(), &dir.path().join("gone.py")).unwrap(),
            PathBuf::from("gone.py")
        );
        assert!(relative_to_workdir(dir.path(), Path::new("/elsewhere/x.py")).is_err());
    }
}
