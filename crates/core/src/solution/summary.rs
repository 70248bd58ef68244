use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::block::Block;
use crate::domain::solution::Solution;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmBlockSummary {
    pub scenario: String,
    pub block_id: String,
    pub model: Option<String>,
    pub result_variable: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub slug: String,
    pub nodes: usize,
    pub blocks: usize,
    pub entry_edges: usize,
}

/// Static shape of a solution, as reported by `convoflow summary`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionSummary {
    pub bot_name: String,
    pub no_match_stub_answer: String,
    pub request_ttl_in_seconds: u64,
    pub scenarios_count: usize,
    pub nodes_count: usize,
    pub blocks_count: usize,
    pub edges_count: usize,
    pub blocks_by_type: BTreeMap<String, usize>,
    pub edges_by_type: BTreeMap<String, usize>,
    pub llm_blocks: Vec<LlmBlockSummary>,
    pub extend_blocks_count: usize,
    pub button_blocks_count: usize,
    pub scenarios: Vec<ScenarioSummary>,
}

impl SolutionSummary {
    pub fn from_solution(solution: &Solution) -> Self {
        let mut summary = Self {
            bot_name: solution.bot_name.clone(),
            no_match_stub_answer: solution.no_match_stub_answer.clone(),
            request_ttl_in_seconds: solution.request_ttl_in_seconds,
            scenarios_count: solution.scenarios.len(),
            ..Self::default()
        };

        for scenario in &solution.scenarios {
            let mut scenario_blocks = 0;
            for edge in &scenario.entry_edges {
                *summary.edges_by_type.entry(edge.kind().to_owned()).or_default() += 1;
            }
            for block in scenario.nodes.iter().flat_map(|node| &node.blocks) {
                scenario_blocks += 1;
                *summary.blocks_by_type.entry(block.kind().to_owned()).or_default() += 1;
                match block {
                    Block::Extend(_) | Block::MatchExtend(_) => summary.extend_blocks_count += 1,
                    Block::Buttons(_) | Block::DynamicButtons(_) => {
                        summary.button_blocks_count += 1
                    }
                    Block::Llm(llm) => summary.llm_blocks.push(LlmBlockSummary {
                        scenario: scenario.slug.clone(),
                        block_id: llm.id.clone(),
                        model: llm.chat.model.model_name.clone(),
                        result_variable: llm.chat.result_variable_name.clone(),
                    }),
                    _ => {}
                }
            }

            summary.nodes_count += scenario.nodes.len();
            summary.blocks_count += scenario_blocks;
            summary.edges_count += scenario.entry_edges.len();
            summary.scenarios.push(ScenarioSummary {
                slug: scenario.slug.clone(),
                nodes: scenario.nodes.len(),
                blocks: scenario_blocks,
                entry_edges: scenario.entry_edges.len(),
            });
        }
        summary
    }
}

impl Solution {
    pub fn summary(&self) -> SolutionSummary {
        SolutionSummary::from_solution(self)
    }
}
