use std::path::Path;

use convoflow_core::Solution;

use crate::commands::validate::load_failure;
use crate::commands::CommandResult;

pub fn run(path: &Path) -> CommandResult {
    let solution = match Solution::from_path(path) {
        Ok(solution) => solution,
        Err(error) => return load_failure("summary", &error),
    };

    let summary = solution.summary();
    let message = format!(
        "{} scenario(s), {} node(s), {} block(s), {} edge(s)",
        summary.scenarios_count, summary.nodes_count, summary.blocks_count, summary.edges_count
    );
    match serde_json::to_value(&summary) {
        Ok(details) => CommandResult::success_with_details("summary", message, Some(details)),
        Err(error) => CommandResult::failure("summary", "serialization", error.to_string(), 1),
    }
}
