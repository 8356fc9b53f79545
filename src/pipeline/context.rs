//! Context gathered from an existing target file before generation.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::errors::PipelineError;

static TYPE_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^class\s+([A-Za-z_]\w*)").expect("valid class regex"));

static CALLABLE_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:async\s+)?def\s+([A-Za-z_]\w*)").expect("valid def regex")
});

/// Top-level declarations found in a source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbols {
    pub types: Vec<String>,
    pub callables: Vec<String>,
}

impl Symbols {
    /// Types first, then callables, in source order.
    pub fn all(&self) -> Vec<String> {
        self.types.iter().chain(&self.callables).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.callables.is_empty()
    }
}

/// Extract unindented class and function declarations.
pub fn extract_symbols(code: &str) -> Symbols {
    let collect = |re: &Regex| -> Vec<String> {
        re.captures_iter(code)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    };
    Symbols {
        types: collect(&TYPE_DECL),
        callables: collect(&CALLABLE_DECL),
    }
}

/// Read the target if it exists.
pub fn read_existing(target: &Path) -> Result<Option<String>, PipelineError> {
    if !target.is_file() {
        return Ok(None);
    }
    std::fs::read_to_string(target)
        .map(Some)
        .map_err(|e| PipelineError::Context {
            path: target.to_path_buf(),
            message: e.to_string(),
        })
}
