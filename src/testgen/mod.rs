//! Test stage: generate a suite for generated code, persist it, run it, and
//! decide whether the pipeline may proceed.

pub mod generate;
pub mod runner;

pub use generate::{GeneratedTest, ImportLayout, TestGenerator};
pub use runner::{TestResult, TestRunner, parse_output};

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::TestStageError;
use crate::pipeline::types::WorkItem;

#[derive(Debug, Clone)]
pub struct TestStageOutcome {
    /// `result.passed || !block_on_failure`
    pub should_proceed: bool,
    pub test: GeneratedTest,
    pub test_file: PathBuf,
    pub result: TestResult,
}

pub struct TestStage {
    generator: TestGenerator,
    runner: TestRunner,
    block_on_failure: bool,
}

impl TestStage {
    pub fn new(generator: TestGenerator, runner: TestRunner, block_on_failure: bool) -> Self {
        Self {
            generator,
            runner,
            block_on_failure,
        }
    }

    pub fn block_on_failure(&self) -> bool {
        self.block_on_failure
    }

    pub fn generator(&self) -> &TestGenerator {
        &self.generator
    }

    pub async fn generate_tests(&self, code: &str, item: &WorkItem, target: &Path) -> GeneratedTest {
        self.generator.generate(code, item, target).await
    }

    pub async fn run_tests(
        &self,
        test_file: &Path,
        extra_args: &[String],
    ) -> Result<TestResult, TestStageError> {
        self.runner.run(test_file, extra_args).await
    }

    /// Generate, save, then run. The suite is always on disk before it runs.
    pub async fn generate_and_run_tests(
        &self,
        code: &str,
        item: &WorkItem,
        target: &Path,
    ) -> Result<TestStageOutcome, TestStageError> {
        let test = self.generate_tests(code, item, target).await;
        let test_file = self.generator.save(&test)?;
        let result = self.run_tests(&test_file, &[]).await?;

        let should_proceed = result.passed || !self.block_on_failure;
        if result.passed {
            info!(item = %item.id, cases = test.case_count, "Generated tests passed");
        } else if should_proceed {
            warn!(item = %item.id, failed = result.failed_count, "Tests failed; continuing because blocking is disabled");
        } else {
            warn!(item = %item.id, failed = result.failed_count, "Tests failed");
        }

        Ok(TestStageOutcome {
            should_proceed,
            test,
            test_file,
            result,
        })
    }
}
