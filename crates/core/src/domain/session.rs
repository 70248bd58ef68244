use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::block::WritableScope;

/// Writable variable scopes persisted with the session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scopes {
    #[serde(default)]
    pub session: Map<String, Value>,
    #[serde(default)]
    pub request: Map<String, Value>,
    #[serde(default)]
    pub temp: Map<String, Value>,
}

impl Scopes {
    pub fn scope(&self, scope: WritableScope) -> &Map<String, Value> {
        match scope {
            WritableScope::Session => &self.session,
            WritableScope::Request => &self.request,
            WritableScope::Temp => &self.temp,
        }
    }

    pub fn scope_mut(&mut self, scope: WritableScope) -> &mut Map<String, Value> {
        match scope {
            WritableScope::Session => &mut self.session,
            WritableScope::Request => &mut self.request,
            WritableScope::Temp => &mut self.temp,
        }
    }
}

/// Return point pushed by `extend`/`match_extend` with `return_back`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFrame {
    pub scenario_slug: String,
    pub node_id: String,
    pub block_index: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChoiceSet {
    pub options: Vec<ChoiceOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
}

impl ChoiceSet {
    /// Matches a reply against option titles (case-insensitive) or 1-based indexes.
    pub fn select(&self, reply: &str) -> Option<&ChoiceOption> {
        let reply = reply.trim();
        if reply.is_empty() {
            return None;
        }
        let lowered = reply.to_lowercase();
        self.options
            .iter()
            .find(|option| option.title.trim().to_lowercase() == lowered)
            .or_else(|| {
                reply
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| index.checked_sub(1))
                    .and_then(|index| self.options.get(index))
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "choices", rename_all = "snake_case")]
pub enum AwaitedInput {
    Message,
    Choice(ChoiceSet),
}

/// Explicit resumable position of a parked dialog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuspendedPosition {
    pub scenario_slug: String,
    pub node_id: String,
    pub block_index: usize,
    pub block_id: String,
    pub awaiting: AwaitedInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Bot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

/// Everything the engine needs to continue a dialog on the next turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_position: Option<SuspendedPosition>,
    #[serde(default)]
    pub scenario_stack: Vec<ScenarioFrame>,
    #[serde(default)]
    pub messages_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_scenario: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub version: u64,
}

impl SessionState {
    pub fn is_fresh(&self) -> bool {
        self.messages_number == 0
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_position.is_some()
    }

    pub fn push_history(&mut self, role: HistoryRole, text: impl Into<String>, limit: usize) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.history.push(HistoryEntry { role, text });
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    /// Most recent `depth` history entries, oldest first.
    pub fn recent_history(&self, depth: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(depth);
        &self.history[start..]
    }
}
