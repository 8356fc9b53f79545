//! Default collaborator implementations wired by the `rollout` binary.
//!
//! - [`ConventionMapper`] / [`SymbolAnalyzer`]: filesystem conventions
//! - [`ClaudeCli`]: code and test generation through a CLI model runner
//! - [`CommandSafetyChecker`]: configured shell checks per file
//! - [`GitVcs`]: local git operations plus `git push` and `gh pr create`

pub mod claude;
pub mod git;
pub mod mapper;
pub mod safety;

pub use claude::ClaudeCli;
pub use git::GitVcs;
pub use mapper::{ConventionMapper, SymbolAnalyzer};
pub use safety::CommandSafetyChecker;

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Run `cmd` with optional stdin input, killing it if `limit` elapses.
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    input: Option<&str>,
    limit: Duration,
    what: &str,
) -> Result<Output> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", what))?;

    // Feed stdin from its own task so a child that never reads cannot stall
    // the caller past `limit`.
    let writer = match (input, child.stdin.take()) {
        (Some(input), Some(mut stdin)) => {
            let input = input.to_owned();
            Some(tokio::spawn(async move {
                match stdin.write_all(input.as_bytes()).await {
                    // A process may exit without reading its input; its exit status decides.
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            }))
        }
        _ => None,
    };

    // Dropping the child on timeout kills it, which also unblocks the writer.
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("Failed to wait for {}", what))?,
        Err(_) => anyhow::bail!("{} timed out after {} seconds", what, limit.as_secs()),
    };

    if let Some(writer) = writer {
        writer
            .await
            .with_context(|| format!("stdin writer for {} did not finish", what))?
            .with_context(|| format!("Failed to write stdin of {}", what))?;
    }
    Ok(output)
}

/// `sh -c <script>` in `dir`.
pub(crate) fn shell(script: &str, dir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(dir);
    cmd
}

/// First non-empty stream of a finished process, trimmed.
pub(crate) fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    match output.status.code() {
        Some(code) if text.is_empty() => format!("exit code {}", code),
        Some(code) => format!("exit code {}: {}", code, text),
        None if text.is_empty() => "terminated by signal".to_string(),
        None => format!("terminated by signal: {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_with_timeout_passes_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_with_timeout(shell("cat", dir.path()), Some("hello"), Duration::from_secs(5), "cat")
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello");
    }

    #[tokio::test]
    async fn test_run_with_timeout_kills_slow_process() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_with_timeout(shell("sleep 5", dir.path()), None, Duration::from_millis(100), "sleeper")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_applies_while_child_ignores_large_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = "x".repeat(1_000_000);
        let started = std::time::Instant::now();
        let err = run_with_timeout(
            shell("sleep 5", dir.path()),
            Some(&input),
            Duration::from_millis(200),
            "deaf",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_large_input_is_fully_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let input = "y".repeat(500_000);
        let output = run_with_timeout(shell("wc -c", dir.path()), Some(&input), Duration::from_secs(5), "wc")
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "500000");
    }

    #[tokio::test]
    async fn test_describe_failure_prefers_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_with_timeout(
            shell("echo out; echo broken >&2; exit 3", dir.path()),
            None,
            Duration::from_secs(5),
            "failing",
        )
        .await
        .unwrap();
        assert_eq!(describe_failure(&output), "exit code 3: broken");
    }
}
