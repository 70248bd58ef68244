use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::solution::Solution;
use crate::domain::turn::TraceStep;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCoverage {
    pub slug: String,
    pub nodes: usize,
    pub visited_nodes: usize,
    pub blocks: usize,
    pub visited_blocks: usize,
}

/// Which parts of a solution a set of conversations reached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub total_nodes: usize,
    pub visited_nodes: usize,
    pub total_blocks: usize,
    pub visited_blocks: usize,
    /// Visited share of all blocks, rounded to one decimal. `0.0` for a solution without blocks.
    pub coverage_percent: f64,
    pub scenarios: Vec<ScenarioCoverage>,
    /// `scenario/node:block` paths never visited, in solution order.
    pub unvisited_blocks: Vec<String>,
}

/// Accumulates visited blocks from debug traces across turns.
#[derive(Clone, Debug, Default)]
pub struct CoverageTracker {
    visited: BTreeSet<(String, String, String)>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, trace: &[TraceStep]) {
        for step in trace {
            self.visited.insert((
                step.scenario_slug.clone(),
                step.node_id.clone(),
                step.block_id.clone(),
            ));
        }
    }

    fn visited(&self, scenario: &str, node: &str, block: &str) -> bool {
        self.visited.contains(&(scenario.to_owned(), node.to_owned(), block.to_owned()))
    }

    /// Rolls the recorded steps up against `solution`. Steps for elements it lacks are ignored.
    pub fn report(&self, solution: &Solution) -> CoverageReport {
        let mut report = CoverageReport::default();
        for scenario in &solution.scenarios {
            let mut entry = ScenarioCoverage {
                slug: scenario.slug.clone(),
                nodes: scenario.nodes.len(),
                ..ScenarioCoverage::default()
            };
            for node in &scenario.nodes {
                let mut node_visited = false;
                for block in &node.blocks {
                    entry.blocks += 1;
                    if self.visited(&scenario.slug, &node.id, block.id()) {
                        entry.visited_blocks += 1;
                        node_visited = true;
                    } else {
                        report
                            .unvisited_blocks
                            .push(format!("{}/{}:{}", scenario.slug, node.id, block.id()));
                    }
                }
                if node_visited {
                    entry.visited_nodes += 1;
                }
            }

            report.total_nodes += entry.nodes;
            report.visited_nodes += entry.visited_nodes;
            report.total_blocks += entry.blocks;
            report.visited_blocks += entry.visited_blocks;
            report.scenarios.push(entry);
        }
        report.coverage_percent = percent(report.visited_blocks, report.total_blocks);
        report
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 1000.0).round() / 10.0
}
