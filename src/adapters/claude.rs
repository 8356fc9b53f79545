//! Generation through a CLI model runner (`claude --print` by default).
//!
//! The prompt goes to the process on stdin and stdout is taken as the
//! completion. Non-zero exit or a timeout is a generation error.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{describe_failure, run_with_timeout};
use crate::pipeline::collaborators::{
    CodeGenerator, GenerationContext, IntegrationStrategy, TextGenerator,
};
use crate::pipeline::types::WorkItem;
use crate::util::strip_code_fences;

#[derive(Debug, Clone)]
pub struct ClaudeCli {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: PathBuf,
}

impl ClaudeCli {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            working_dir: working_dir.into(),
        }
    }

    async fn run(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).current_dir(&self.working_dir);

        debug!(command = %self.command, prompt_chars = prompt.len(), "Calling generator");
        let output = run_with_timeout(cmd, Some(prompt), self.timeout, &self.command).await?;
        if !output.status.success() {
            bail!("{} failed with {}", self.command, describe_failure(&output));
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            bail!("{} returned no output", self.command);
        }
        Ok(text)
    }
}

fn implementation_prompt(
    item: &WorkItem,
    context: &GenerationContext,
    strategy: IntegrationStrategy,
) -> String {
    let mut prompt = format!(
        "Implement the following change as Python code for `{}`.\n\n\
         ## Change ({})\n{}\n\n{}\n",
        context.target_path.display(),
        item.id,
        item.title,
        item.description
    );
    if !item.metadata.is_empty() {
        prompt.push_str("\n## Details\n");
        for (key, value) in item.metadata.iter() {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
    }

    match strategy {
        IntegrationStrategy::CreateNew => {
            prompt.push_str("\nThe file does not exist yet. Write a complete new module.\n");
        }
        IntegrationStrategy::Extend | IntegrationStrategy::Modify => {
            let verb = if strategy == IntegrationStrategy::Extend {
                "Extend the existing module without breaking its public API"
            } else {
                "Modify the existing module as needed"
            };
            prompt.push_str(&format!("\n{}.\n", verb));
            if !context.existing_symbols.is_empty() {
                prompt.push_str(&format!(
                    "Existing top-level symbols: {}\n",
                    context.existing_symbols.join(", ")
                ));
            }
            if let Some(existing) = &context.existing_code {
                prompt.push_str(&format!("\n## Current file\n```python\n{}\n```\n", existing.trim_end()));
            }
        }
    }

    prompt.push_str("\nReturn the COMPLETE file content only, no commentary.\n");
    prompt
}

#[async_trait]
impl CodeGenerator for ClaudeCli {
    async fn generate(
        &self,
        item: &WorkItem,
        context: &GenerationContext,
        strategy: IntegrationStrategy,
    ) -> Result<String> {
        let raw = self.run(&implementation_prompt(item, context, strategy)).await?;
        Ok(strip_code_fences(&raw))
    }
}

#[async_trait]
impl TextGenerator for ClaudeCli {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.run(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn cli(script: &str, dir: &Path) -> ClaudeCli {
        ClaudeCli::new(
            "sh",
            vec!["-c".into(), script.into()],
            Duration::from_secs(5),
            dir,
        )
    }

    #[tokio::test]
    async fn test_generate_strips_fences() {
        let dir = tempfile::tempdir().unwrap();
        let generator = cli("cat > /dev/null; printf '```python\\nx = 1\\n```\\n'", dir.path());
        let ctx = GenerationContext {
            target_path: dir.path().join("a.py"),
            ..Default::default()
        };
        let code = generator
            .generate(&WorkItem::new("r1", "A", ""), &ctx, IntegrationStrategy::CreateNew)
            .await
            .unwrap();
        assert_eq!(code, "x = 1\n");
    }

    #[tokio::test]
    async fn test_prompt_is_sent_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let echo = cli("cat", dir.path());
        assert_eq!(echo.complete("write tests").await.unwrap(), "write tests");
    }

    #[tokio::test]
    async fn test_failures_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let failing = cli("echo 'rate limited' >&2; exit 2", dir.path());
        let err = failing.complete("p").await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));

        let silent = cli("cat > /dev/null", dir.path());
        assert!(silent.complete("p").await.is_err());
    }

    #[test]
    fn test_prompt_includes_existing_code_for_extend() {
        let ctx = GenerationContext {
            target_path: PathBuf::from("src/cache.py"),
            existing_code: Some("class Cache:\n    pass\n".into()),
            existing_symbols: vec!["Cache".into()],
        };
        let item = WorkItem::new("r1", "Add TTL", "Entries expire");
        let prompt = implementation_prompt(&item, &ctx, IntegrationStrategy::Extend);
        assert!(prompt.contains("Extend the existing module"));
        assert!(prompt.contains("Existing top-level symbols: Cache"));
        assert!(prompt.contains("class Cache:"));

        let fresh = implementation_prompt(&item, &ctx, IntegrationStrategy::CreateNew);
        assert!(!fresh.contains("class Cache:"));
    }
}
