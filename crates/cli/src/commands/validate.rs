use std::path::Path;

use convoflow_core::solution::SolutionError;
use convoflow_core::Solution;
use serde_json::json;

use crate::commands::CommandResult;

pub fn run(path: &Path) -> CommandResult {
    let solution = match Solution::from_path(path) {
        Ok(solution) => solution,
        Err(error) => return load_failure("validate", &error),
    };

    let violations = solution.check_references();
    if violations.is_empty() {
        return CommandResult::success(
            "validate",
            format!(
                "solution `{}` is consistent ({} scenario(s))",
                solution.bot_name,
                solution.scenarios.len()
            ),
        );
    }

    let reasons = violations.iter().map(|violation| violation.reason()).collect::<Vec<_>>();
    CommandResult::failure_with_details(
        "validate",
        "reference_violation",
        format!("{} reference violation(s)", violations.len()),
        3,
        Some(json!({ "violations": violations, "reasons": reasons })),
    )
}

pub(crate) fn load_failure(command: &str, error: &SolutionError) -> CommandResult {
    let error_class = match error {
        SolutionError::Read { .. } => "solution_read",
        SolutionError::Parse(_) | SolutionError::Empty => "solution_parse",
        SolutionError::Invalid(_) => "reference_violation",
    };
    CommandResult::failure(command, error_class, error.to_string(), 2)
}
