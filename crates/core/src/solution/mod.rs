//! Loading, checking and summarising solution files.

pub mod coverage;
pub mod summary;
pub mod validation;

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::domain::solution::Solution;

pub use coverage::{CoverageReport, CoverageTracker, ScenarioCoverage};
pub use summary::{LlmBlockSummary, ScenarioSummary, SolutionSummary};
pub use validation::ReferenceViolation;

#[derive(Debug, Error)]
pub enum SolutionError {
    #[error("failed to read solution file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse solution: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("solution has no scenarios")]
    Empty,
    #[error("solution has {} reference violation(s); first: {}", .0.len(), first_reason(.0))]
    Invalid(Vec<ReferenceViolation>),
}

fn first_reason(violations: &[ReferenceViolation]) -> String {
    violations.first().map(ReferenceViolation::reason).unwrap_or_default()
}

impl Solution {
    /// Parses raw solution attributes or the exported `{"data": {"attributes": ..}}` envelope.
    pub fn from_json_str(raw: &str) -> Result<Self, SolutionError> {
        let mut document: Value = serde_json::from_str(raw)?;
        if let Some(attributes) =
            document.get_mut("data").and_then(|data| data.get_mut("attributes"))
        {
            document = attributes.take();
        }
        normalize_slugs(&mut document);

        let solution: Solution = serde_json::from_value(document)?;
        if solution.scenarios.is_empty() {
            return Err(SolutionError::Empty);
        }
        Ok(solution)
    }

    pub fn from_path(path: &Path) -> Result<Self, SolutionError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| SolutionError::Read { path: path.to_path_buf(), source })?;
        Self::from_json_str(&raw)
    }

    /// Loads a solution and rejects it when any reference does not resolve.
    pub fn load_checked(path: &Path) -> Result<Self, SolutionError> {
        let solution = Self::from_path(path)?;
        let violations = solution.check_references();
        if !violations.is_empty() {
            return Err(SolutionError::Invalid(violations));
        }
        Ok(solution)
    }
}

/// Derives missing slugs from the scenario name (or id, or position).
fn normalize_slugs(document: &mut Value) {
    let Some(scenarios) = document.get_mut("scenarios").and_then(Value::as_array_mut) else {
        return;
    };
    for (index, scenario) in scenarios.iter_mut().enumerate() {
        let Some(fields) = scenario.as_object_mut() else {
            continue;
        };
        let has_slug =
            fields.get("slug").and_then(Value::as_str).is_some_and(|slug| !slug.trim().is_empty());
        if has_slug {
            continue;
        }
        let source = ["name", "id"]
            .iter()
            .filter_map(|key| fields.get(*key).and_then(Value::as_str))
            .find(|value| !value.trim().is_empty())
            .map(str::to_owned);
        let slug = match source {
            Some(source) => slugify(&source),
            None => format!("scenario_{index}"),
        };
        fields.insert("slug".to_owned(), Value::String(slug));
    }
}

pub fn slugify(name: &str) -> String {
    name.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join("_")
}
