use std::collections::HashSet;
use std::fmt;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::domain::block::{Block, VariableKind};
use crate::domain::edge::EntryEdge;
use crate::domain::solution::{Node, PreprocessingMode, Scenario, Solution};
use crate::flows::executor::HTTP_METHODS;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceViolation {
    NoScenarios,
    ZeroRequestTtl,
    DuplicateSlug { slug: String },
    DuplicateScenarioId { id: String },
    DuplicateNodeId { scenario: String, node_id: String },
    DuplicateBlockId { scenario: String, node_id: String, block_id: String },
    DanglingNode { scenario: String, location: String, target: String },
    DanglingScenario { scenario: String, location: String, reference: String },
    MissingPreprocessingScenario { reference: String },
    InvalidPattern { scenario: String, location: String, pattern: String, message: String },
    ThresholdOutOfRange { scenario: String, location: String, threshold: f64 },
    MissingRuleId { scenario: String, location: String },
    InvalidHttpMethod { scenario: String, location: String, method: String },
    EmptySystemMessage { scenario: String, location: String },
    EmptyButtonTitle { scenario: String, location: String },
    EmptyExpression { scenario: String, location: String },
}

impl ReferenceViolation {
    pub fn reason(&self) -> String {
        match self {
            Self::NoScenarios => "solution declares no scenarios".to_owned(),
            Self::ZeroRequestTtl => "request_ttl_in_seconds must be positive".to_owned(),
            Self::DuplicateSlug { slug } => {
                format!("scenario slug `{slug}` is used more than once")
            }
            Self::DuplicateScenarioId { id } => {
                format!("scenario id `{id}` is used more than once")
            }
            Self::DuplicateNodeId { scenario, node_id } => {
                format!("node id `{node_id}` repeats in scenario `{scenario}`")
            }
            Self::DuplicateBlockId { scenario, node_id, block_id } => {
                format!("block id `{block_id}` repeats in `{scenario}/{node_id}`")
            }
            Self::DanglingNode { scenario, location, target } => {
                format!("{location} in `{scenario}` targets missing node `{target}`")
            }
            Self::DanglingScenario { scenario, location, reference } => {
                format!("{location} in `{scenario}` references missing scenario `{reference}`")
            }
            Self::MissingPreprocessingScenario { reference } => {
                format!("preprocessing scenario `{reference}` does not exist")
            }
            Self::InvalidPattern { scenario, location, pattern, message } => {
                format!("{location} in `{scenario}` has invalid pattern `{pattern}`: {message}")
            }
            Self::ThresholdOutOfRange { scenario, location, threshold } => {
                format!("{location} in `{scenario}` has threshold {threshold} outside 0..=1")
            }
            Self::MissingRuleId { scenario, location } => {
                format!("{location} in `{scenario}` is a rule edge without an id")
            }
            Self::InvalidHttpMethod { scenario, location, method } => {
                format!("{location} in `{scenario}` uses unsupported http method `{method}`")
            }
            Self::EmptySystemMessage { scenario, location } => {
                format!("{location} in `{scenario}` has an empty system message")
            }
            Self::EmptyButtonTitle { scenario, location } => {
                format!("{location} in `{scenario}` has a button without a title")
            }
            Self::EmptyExpression { scenario, location } => {
                format!("{location} in `{scenario}` has an empty expression")
            }
        }
    }
}

impl fmt::Display for ReferenceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

impl Solution {
    /// Reports every reference that would fail at runtime, plus structural rules the engine
    /// relies on. An empty list means the solution is safe to run.
    pub fn check_references(&self) -> Vec<ReferenceViolation> {
        let mut violations = Vec::new();
        if self.scenarios.is_empty() {
            violations.push(ReferenceViolation::NoScenarios);
        }
        if self.request_ttl_in_seconds == 0 {
            violations.push(ReferenceViolation::ZeroRequestTtl);
        }

        let mut slugs = HashSet::new();
        let mut ids = HashSet::new();
        for scenario in &self.scenarios {
            if !slugs.insert(scenario.slug.as_str()) {
                violations.push(ReferenceViolation::DuplicateSlug { slug: scenario.slug.clone() });
            }
            if let Some(id) = &scenario.id {
                if !ids.insert(id.as_str()) {
                    violations.push(ReferenceViolation::DuplicateScenarioId { id: id.clone() });
                }
            }
            if let Some(parent) = &scenario.parent_scenario_id {
                if self.scenario_by_ref(parent).is_none() {
                    violations.push(ReferenceViolation::DanglingScenario {
                        scenario: scenario.slug.clone(),
                        location: "parent_scenario_id".to_owned(),
                        reference: parent.clone(),
                    });
                }
            }
            self.check_edges(scenario, &mut violations);
            self.check_nodes(scenario, &mut violations);
        }

        if self.preprocessing_mode != PreprocessingMode::Disabled {
            if let Some(reference) = &self.preprocessing_scenario {
                if self.scenario_by_ref(reference).is_none() {
                    violations.push(ReferenceViolation::MissingPreprocessingScenario {
                        reference: reference.clone(),
                    });
                }
            }
        }
        violations
    }

    fn check_edges(&self, scenario: &Scenario, violations: &mut Vec<ReferenceViolation>) {
        for (index, edge) in scenario.entry_edges.iter().enumerate() {
            let location = format!("{} edge #{index}", edge.kind());
            let target = edge.target_node_id();
            if scenario.node(target).is_none() {
                violations.push(ReferenceViolation::DanglingNode {
                    scenario: scenario.slug.clone(),
                    location: location.clone(),
                    target: target.to_owned(),
                });
            }

            let threshold = match edge {
                EntryEdge::Match(edge) => {
                    check_pattern(scenario, &location, &edge.value, violations);
                    None
                }
                EntryEdge::Intent(edge) => edge.threshold,
                EntryEdge::Rule(edge) => {
                    if edge.common.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
                        violations.push(ReferenceViolation::MissingRuleId {
                            scenario: scenario.slug.clone(),
                            location: location.clone(),
                        });
                    }
                    edge.threshold
                }
                EntryEdge::Event(_) | EntryEdge::Manual(_) => None,
            };
            if let Some(threshold) = threshold.filter(|value| !(0.0..=1.0).contains(value)) {
                violations.push(ReferenceViolation::ThresholdOutOfRange {
                    scenario: scenario.slug.clone(),
                    location,
                    threshold,
                });
            }
        }
    }

    fn check_nodes(&self, scenario: &Scenario, violations: &mut Vec<ReferenceViolation>) {
        let mut node_ids = HashSet::new();
        for node in &scenario.nodes {
            if !node_ids.insert(node.id.as_str()) {
                violations.push(ReferenceViolation::DuplicateNodeId {
                    scenario: scenario.slug.clone(),
                    node_id: node.id.clone(),
                });
            }
            if let Some(next) = &node.next_node_id {
                if scenario.node(next).is_none() {
                    violations.push(ReferenceViolation::DanglingNode {
                        scenario: scenario.slug.clone(),
                        location: format!("next_node_id of `{}`", node.id),
                        target: next.clone(),
                    });
                }
            }

            let mut block_ids = HashSet::new();
            for block in &node.blocks {
                if !block_ids.insert(block.id()) {
                    violations.push(ReferenceViolation::DuplicateBlockId {
                        scenario: scenario.slug.clone(),
                        node_id: node.id.clone(),
                        block_id: block.id().to_owned(),
                    });
                }
                self.check_block(scenario, node, block, violations);
            }
        }
    }

    fn check_block(
        &self,
        scenario: &Scenario,
        node: &Node,
        block: &Block,
        violations: &mut Vec<ReferenceViolation>,
    ) {
        let location = format!("{} block `{}/{}`", block.kind(), node.id, block.id());
        let slug = || scenario.slug.clone();

        for target in block.node_targets() {
            if scenario.node(target).is_none() {
                violations.push(ReferenceViolation::DanglingNode {
                    scenario: slug(),
                    location: location.clone(),
                    target: target.to_owned(),
                });
            }
        }

        match block {
            Block::Variables(variables)
                if matches!(
                    variables.variable_type,
                    VariableKind::Regexp | VariableKind::RegexpMap
                ) =>
            {
                if let Some(pattern) = variables.value.as_str() {
                    check_pattern(scenario, &location, pattern, violations);
                }
            }
            Block::SingleIf(single_if) if single_if.expression.trim().is_empty() => {
                violations.push(ReferenceViolation::EmptyExpression { scenario: slug(), location });
            }
            Block::HttpRequest(request) => {
                let method = request.method.trim().to_ascii_uppercase();
                let templated = method.contains("{{");
                if !templated && !HTTP_METHODS.contains(&method.as_str()) {
                    violations.push(ReferenceViolation::InvalidHttpMethod {
                        scenario: slug(),
                        location,
                        method: request.method.clone(),
                    });
                }
            }
            Block::Buttons(buttons)
                if buttons.buttons.iter().any(|button| button.title.trim().is_empty()) =>
            {
                violations
                    .push(ReferenceViolation::EmptyButtonTitle { scenario: slug(), location });
            }
            Block::Extend(extend) => {
                match self.scenario_by_ref(&extend.scenario_id) {
                    None => violations.push(ReferenceViolation::DanglingScenario {
                        scenario: slug(),
                        location,
                        reference: extend.scenario_id.clone(),
                    }),
                    Some(target) => {
                        if let Some(node_id) = &extend.node_id {
                            if target.node(node_id).is_none() {
                                violations.push(ReferenceViolation::DanglingNode {
                                    scenario: target.slug.clone(),
                                    location,
                                    target: node_id.clone(),
                                });
                            }
                        }
                    }
                }
            }
            Block::MatchExtend(match_extend) => {
                for reference in &match_extend.scenario_ids {
                    if self.scenario_by_ref(reference).is_none() {
                        violations.push(ReferenceViolation::DanglingScenario {
                            scenario: slug(),
                            location: location.clone(),
                            reference: reference.clone(),
                        });
                    }
                }
            }
            Block::Llm(llm) if llm.chat.system_message.trim().is_empty() => {
                violations
                    .push(ReferenceViolation::EmptySystemMessage { scenario: slug(), location });
            }
            Block::Agent(agent) if agent.chat.system_message.trim().is_empty() => {
                violations
                    .push(ReferenceViolation::EmptySystemMessage { scenario: slug(), location });
            }
            _ => {}
        }
    }
}

fn check_pattern(
    scenario: &Scenario,
    location: &str,
    pattern: &str,
    violations: &mut Vec<ReferenceViolation>,
) {
    if let Err(error) = RegexBuilder::new(pattern).case_insensitive(true).build() {
        violations.push(ReferenceViolation::InvalidPattern {
            scenario: scenario.slug.clone(),
            location: location.to_owned(),
            pattern: pattern.to_owned(),
            message: error.to_string(),
        });
    }
}
