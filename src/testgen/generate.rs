//! Test suite generation.
//!
//! The primary path asks a [`TextGenerator`] for a complete pytest file. When
//! no generator is configured, or it errors, a smoke-test template is built
//! from the module's top-level declarations instead.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::errors::TestStageError;
use crate::pipeline::collaborators::TextGenerator;
use crate::pipeline::context::extract_symbols;
use crate::pipeline::types::WorkItem;
use crate::util::{slugify, strip_code_fences};

/// Symbols per kind covered by the fallback template.
const FALLBACK_SYMBOL_LIMIT: usize = 5;

static TEST_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:async\s+)?def\s+(test_\w*)\s*\(").expect("valid test decl regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub code: String,
    /// Module under test
    pub target_path: PathBuf,
    /// Where the suite is saved
    pub test_path: PathBuf,
    pub case_count: usize,
    /// Reporting tags only
    pub categories: Vec<String>,
    /// Whether the template was used instead of the text generator
    pub from_fallback: bool,
}

/// How a test file reaches the module under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLayout {
    pub module: String,
    pub prelude: String,
}

/// Number of `def test_*(` declarations in `code`.
pub fn count_test_cases(code: &str) -> usize {
    TEST_DECL.captures_iter(code).count()
}

/// Tag a suite by the names of its tests.
pub fn categorize(code: &str) -> Vec<String> {
    let mut categories = Vec::new();
    for caps in TEST_DECL.captures_iter(code) {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let category = if name.contains("integration") {
            "integration"
        } else if ["edge", "empty", "invalid", "error", "none", "boundary"]
            .iter()
            .any(|k| name.contains(k))
        {
            "edge-case"
        } else {
            "unit"
        };
        if !categories.iter().any(|c| c == category) {
            categories.push(category.to_string());
        }
    }
    categories
}

fn depth(rel: &Path) -> usize {
    rel.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

fn relative_to<'a>(path: &'a Path, base: &Path) -> &'a Path {
    path.strip_prefix(base).unwrap_or(path)
}

pub struct TestGenerator {
    project_dir: PathBuf,
    tests_dir: PathBuf,
    text: Option<Arc<dyn TextGenerator>>,
}

impl TestGenerator {
    pub fn new(project_dir: impl Into<PathBuf>, tests_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            tests_dir: tests_dir.into(),
            text: None,
        }
    }

    pub fn with_text_generator(mut self, text: Arc<dyn TextGenerator>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn tests_dir(&self) -> &Path {
        &self.tests_dir
    }

    /// `<tests_dir>/test_<module stem>.py`
    pub fn test_file_path(&self, target: &Path) -> PathBuf {
        let stem = target
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");
        self.tests_dir.join(format!("test_{}.py", stem))
    }

    /// Module name plus the `sys.path` prelude that makes it importable from
    /// the test file, wherever the module lives in the project.
    pub fn import_layout(&self, target: &Path) -> ImportLayout {
        let module = target
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string();
        let tests_rel = relative_to(&self.tests_dir, &self.project_dir);
        let module_dir = target
            .parent()
            .map(|p| relative_to(p, &self.project_dir))
            .unwrap_or(Path::new(""));

        let mut root = format!("Path(__file__).resolve().parents[{}]", depth(tests_rel));
        for part in module_dir.components() {
            if let Component::Normal(p) = part {
                root.push_str(&format!(" / \"{}\"", p.to_string_lossy()));
            }
        }
        let prelude = format!(
            "import sys\nfrom pathlib import Path\n\nsys.path.insert(0, str({}))\n",
            root
        );
        ImportLayout { module, prelude }
    }

    /// Prepend the prelude unless the suite already sets up the import path.
    pub fn ensure_prelude(code: &str, layout: &ImportLayout) -> String {
        let marker = layout.prelude.lines().last().unwrap_or_default();
        if code.contains(marker) {
            code.to_string()
        } else {
            format!("{}\n{}", layout.prelude, code)
        }
    }

    fn prompt(&self, code: &str, item: &WorkItem, layout: &ImportLayout) -> String {
        format!(
            "Write a complete pytest test file for the Python module `{module}`.\n\n\
             ## Change\n{title}\n\n{description}\n\n\
             ## Module source\n```python\n{code}\n```\n\n\
             ## Requirements\n\
             - The file MUST begin with exactly this prelude so the module is importable:\n\
             ```python\n{prelude}```\n\
             - Import the module as `import {module}` or `from {module} import ...`.\n\
             - Cover normal behaviour, edge cases and error handling.\n\
             - Name every test function `test_*`.\n\
             - Output only the Python file, no commentary.\n",
            module = layout.module,
            title = item.title,
            description = item.description,
            code = code.trim_end(),
            prelude = layout.prelude,
        )
    }

    /// Smoke-test template over the module's top-level declarations.
    pub fn fallback(&self, code: &str, target: &Path) -> GeneratedTest {
        let layout = self.import_layout(target);
        let symbols = extract_symbols(code);
        let module = &layout.module;

        let mut out = layout.prelude.clone();
        out.push_str("\nimport importlib\n\n\n");
        out.push_str(&format!(
            "def test_module_imports():\n    module = importlib.import_module(\"{module}\")\n    assert module is not None\n"
        ));
        for name in symbols
            .types
            .iter()
            .take(FALLBACK_SYMBOL_LIMIT)
            .chain(symbols.callables.iter().take(FALLBACK_SYMBOL_LIMIT))
        {
            out.push_str(&format!(
                "\n\ndef test_{slug}_exists():\n    from {module} import {name}\n    assert {name} is not None\n",
                slug = slugify(name, '_', 60),
            ));
        }

        GeneratedTest {
            case_count: count_test_cases(&out),
            code: out,
            target_path: target.to_path_buf(),
            test_path: self.test_file_path(target),
            categories: vec!["smoke".to_string()],
            from_fallback: true,
        }
    }

    /// Produce a suite for `code`, which will be written to `target`.
    pub async fn generate(&self, code: &str, item: &WorkItem, target: &Path) -> GeneratedTest {
        let Some(text) = &self.text else {
            debug!(item = %item.id, "No text generator configured; using test template");
            return self.fallback(code, target);
        };

        let layout = self.import_layout(target);
        match text.complete(&self.prompt(code, item, &layout)).await {
            Ok(raw) => {
                let stripped = strip_code_fences(&raw);
                if count_test_cases(&stripped) == 0 {
                    warn!(item = %item.id, "Generated suite has no test functions; using template");
                    return self.fallback(code, target);
                }
                let code = Self::ensure_prelude(&stripped, &layout);
                GeneratedTest {
                    case_count: count_test_cases(&code),
                    categories: categorize(&code),
                    code,
                    target_path: target.to_path_buf(),
                    test_path: self.test_file_path(target),
                    from_fallback: false,
                }
            }
            Err(e) => {
                warn!(item = %item.id, error = %e, "Test generation failed; using template");
                self.fallback(code, target)
            }
        }
    }

    /// Write the suite to its test path.
    pub fn save(&self, test: &GeneratedTest) -> Result<PathBuf, TestStageError> {
        let path = &test.test_path;
        let write = |p: &Path| -> std::io::Result<()> {
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(p, &test.code)
        };
        write(path).map_err(|source| TestStageError::WriteFailed {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), cases = test.case_count, "Test suite saved");
        Ok(path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct Canned(Result<String, String>);

    #[async_trait]
    impl TextGenerator for Canned {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn generator(root: &Path) -> TestGenerator {
        TestGenerator::new(root, root.join("tests"))
    }

    #[test]
    fn test_file_path_uses_module_stem() {
        let g = generator(Path::new("/proj"));
        assert_eq!(
            g.test_file_path(Path::new("/proj/src/pkg/cache.py")),
            PathBuf::from("/proj/tests/test_cache.py")
        );
    }

    #[test]
    fn test_import_layout_depth() {
        let g = generator(Path::new("/proj"));
        let layout = g.import_layout(Path::new("/proj/src/pkg/cache.py"));
        assert_eq!(layout.module, "cache");
        assert!(layout.prelude.contains("parents[1] / \"src\" / \"pkg\""));

        let nested = TestGenerator::new("/proj", "/proj/tests/unit");
        let layout = nested.import_layout(Path::new("/proj/cache.py"));
        assert!(layout.prelude.contains("sys.path.insert(0, str(Path(__file__).resolve().parents[2]))"));
    }

    #[test]
    fn test_count_and_categorize() {
        let code = "def test_get():\n    pass\n\nasync def test_empty_key():\n    pass\n\n    def test_integration_flow( ):\n        pass\n\ndef helper():\n    pass\n";
        assert_eq!(count_test_cases(code), 3);
        assert_eq!(categorize(code), vec!["unit", "edge-case", "integration"]);
    }

    #[test]
    fn test_ensure_prelude_is_idempotent() {
        let g = generator(Path::new("/proj"));
        let layout = g.import_layout(Path::new("/proj/src/a.py"));
        let once = TestGenerator::ensure_prelude("def test_x():\n    pass\n", &layout);
        assert!(once.starts_with("import sys"));
        assert_eq!(TestGenerator::ensure_prelude(&once, &layout), once);
    }

    #[test]
    fn test_fallback_template_is_bounded() {
        let g = generator(Path::new("/proj"));
        let mut code = String::new();
        for i in 0..7 {
            code.push_str(&format!("class Type{i}:\n    pass\n\ndef func_{i}():\n    pass\n\n"));
        }
        let test = g.fallback(&code, Path::new("/proj/src/mod_a.py"));
        assert!(test.from_fallback);
        assert_eq!(test.case_count, 1 + 5 + 5);
        assert!(test.code.contains("importlib.import_module(\"mod_a\")"));
        assert!(test.code.contains("def test_type0_exists():"));
        assert!(test.code.contains("from mod_a import func_4"));
        assert!(!test.code.contains("func_5"));
    }

    #[tokio::test]
    async fn test_generate_strips_fences_and_adds_prelude() {
        let dir = tempfile::tempdir().unwrap();
        let text = Canned(Ok(
            "Sure:\n```python\nfrom cache import get\n\ndef test_get():\n    assert get() is None\n```\n"
                .to_string(),
        ));
        let g = generator(dir.path()).with_text_generator(Arc::new(text));
        let target = dir.path().join("src/cache.py");
        let item = WorkItem::new("r1", "Cache", "");

        let test = g.generate("def get():\n    return None\n", &item, &target).await;
        assert!(!test.from_fallback);
        assert_eq!(test.case_count, 1);
        assert!(test.code.starts_with("import sys"));
        assert!(!test.code.contains("```"));

        let saved = g.save(&test).unwrap();
        assert_eq!(saved, dir.path().join("tests/test_cache.py"));
        assert_eq!(std::fs::read_to_string(saved).unwrap(), test.code);
    }

    #[tokio::test]
    async fn test_generate_falls_back_on_error() {
        let g = generator(Path::new("/proj"))
            .with_text_generator(Arc::new(Canned(Err("provider down".into()))));
        let item = WorkItem::new("r1", "Cache", "");
        let test = g
            .generate("class Cache:\n    pass\n", &item, Path::new("/proj/src/cache.py"))
            .await;
        assert!(test.from_fallback);
        assert_eq!(test.case_count, 2);
    }
}
