use serde::{Deserialize, Serialize};

use crate::domain::block::Block;
use crate::domain::edge::{EntryEdge, EventName};
use crate::errors::EngineError;

pub const DEFAULT_REQUEST_TTL_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessingMode {
    #[default]
    Disabled,
    Optional,
    Required,
}

/// Root bot definition the engine executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub bot_name: String,
    #[serde(default = "default_request_ttl")]
    pub request_ttl_in_seconds: u64,
    #[serde(default)]
    pub no_match_stub_answer: String,
    #[serde(default)]
    pub preprocessing_mode: PreprocessingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing_scenario: Option<String>,
    pub scenarios: Vec<Scenario>,
}

fn default_request_ttl() -> u64 {
    DEFAULT_REQUEST_TTL_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scenario_id: Option<String>,
    #[serde(default)]
    pub entry_edges: Vec<EntryEdge>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

impl Solution {
    /// Scenario entered when nothing else is active.
    pub fn main_scenario(&self) -> Option<&Scenario> {
        self.scenarios.first()
    }

    pub fn scenario_by_slug(&self, slug: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|scenario| scenario.slug == slug)
    }

    /// Resolves a scenario reference by id first, then by slug.
    pub fn scenario_by_ref(&self, reference: &str) -> Option<&Scenario> {
        self.scenarios
            .iter()
            .find(|scenario| scenario.id.as_deref() == Some(reference))
            .or_else(|| self.scenario_by_slug(reference))
    }

    pub fn parent_of(&self, scenario: &Scenario) -> Option<&Scenario> {
        scenario.parent_scenario_id.as_deref().and_then(|parent| self.scenario_by_ref(parent))
    }

    /// Slugs of the scenario's ancestors, nearest first.
    pub fn ancestors_of(&self, scenario: &Scenario) -> Vec<&str> {
        let mut ancestors: Vec<&str> = Vec::new();
        let mut cursor = self.parent_of(scenario);
        while let Some(parent) = cursor {
            if parent.slug == scenario.slug || ancestors.contains(&parent.slug.as_str()) {
                break;
            }
            ancestors.push(parent.slug.as_str());
            cursor = self.parent_of(parent);
        }
        ancestors
    }

    /// Preprocessing scenario, `None` when disabled. An enabled mode must name an existing one.
    pub fn preprocessing(&self) -> Result<Option<&Scenario>, EngineError> {
        if self.preprocessing_mode == PreprocessingMode::Disabled {
            return Ok(None);
        }
        let reference = self.preprocessing_scenario.as_deref().ok_or_else(|| {
            EngineError::ConfigReference(
                "preprocessing is enabled but no preprocessing_scenario is set".to_owned(),
            )
        })?;
        self.scenario_by_ref(reference).map(Some).ok_or_else(|| {
            let message = format!("preprocessing scenario `{reference}` does not exist");
            EngineError::ConfigReference(message)
        })
    }
}

impl Scenario {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    pub fn is_referenced_by(&self, reference: &str) -> bool {
        self.id.as_deref() == Some(reference) || self.slug == reference
    }

    /// Node entered when control is transferred here without an activation.
    pub fn entry_node_id(&self) -> Option<&str> {
        self.entry_edges
            .iter()
            .find(|edge| matches!(edge, EntryEdge::Manual(_)))
            .or_else(|| self.entry_edges.iter().find(|edge| edge.is_event(&EventName::Init)))
            .map(EntryEdge::target_node_id)
            .or_else(|| self.nodes.first().map(|node| node.id.as_str()))
    }

    pub fn no_match_edge(&self) -> Option<&EntryEdge> {
        self.entry_edges.iter().find(|edge| edge.is_event(&EventName::NoMatch))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{PreprocessingMode, Solution, DEFAULT_REQUEST_TTL_SECS};

    fn nested_solution() -> Solution {
        serde_json::from_value(json!({
            "bot_name": "nesting bot",
            "no_match_stub_answer": "Sorry, I did not get that",
            "preprocessing_mode": "optional",
            "preprocessing_scenario": "prep",
            "scenarios": [
                {"id": "s-root", "slug": "root", "name": "Root",
                 "entry_edges": [{"type": "event", "value": "init", "target_node_id": "start"}],
                 "nodes": [{"id": "start", "blocks": []}]},
                {"id": "s-child", "slug": "child", "parent_scenario_id": "s-root",
                 "entry_edges": [{"type": "manual", "target_node_id": "second"}],
                 "nodes": [{"id": "first", "blocks": []}, {"id": "second", "blocks": []}]},
                {"slug": "grandchild", "parent_scenario_id": "child",
                 "nodes": [{"id": "only", "blocks": []}]},
                {"slug": "prep", "nodes": [{"id": "p", "blocks": []}]}
            ]
        }))
        .expect("solution deserializes")
    }

    #[test]
    fn defaults_are_applied() {
        let solution = nested_solution();
        assert_eq!(solution.request_ttl_in_seconds, DEFAULT_REQUEST_TTL_SECS);
        assert_eq!(solution.preprocessing_mode, PreprocessingMode::Optional);
        let preprocessing = solution.preprocessing().expect("reference resolves");
        assert_eq!(preprocessing.map(|s| s.slug.as_str()), Some("prep"));
        assert_eq!(solution.main_scenario().map(|s| s.slug.as_str()), Some("root"));
    }

    #[test]
    fn references_resolve_by_id_then_slug() {
        let solution = nested_solution();
        assert_eq!(solution.scenario_by_ref("s-child").map(|s| s.slug.as_str()), Some("child"));
        assert_eq!(solution.scenario_by_ref("child").map(|s| s.slug.as_str()), Some("child"));
        assert!(solution.scenario_by_ref("missing").is_none());
    }

    #[test]
    fn ancestors_are_listed_nearest_first() {
        let solution = nested_solution();
        let grandchild = solution.scenario_by_slug("grandchild").expect("grandchild");
        assert_eq!(solution.ancestors_of(grandchild), vec!["child", "root"]);
    }

    #[test]
    fn entry_node_prefers_manual_edge_then_init_then_first_node() {
        let solution = nested_solution();
        assert_eq!(
            solution.scenario_by_slug("child").and_then(|s| s.entry_node_id()),
            Some("second")
        );
        assert_eq!(
            solution.scenario_by_slug("root").and_then(|s| s.entry_node_id()),
            Some("start")
        );
        assert_eq!(
            solution.scenario_by_slug("grandchild").and_then(|s| s.entry_node_id()),
            Some("only")
        );
    }
}
