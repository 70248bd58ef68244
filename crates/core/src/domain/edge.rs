use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_INTENT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_RULE_THRESHOLD: f64 = 0.5;

/// Activation rule mapping a signal onto a node of the owning scenario.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryEdge {
    Match(MatchEdge),
    Intent(IntentEdge),
    Rule(RuleEdge),
    Event(EventEdge),
    Manual(ManualEdge),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCommon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEdge {
    #[serde(flatten)]
    pub common: EdgeCommon,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentEdge {
    #[serde(flatten)]
    pub common: EdgeCommon,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleEdge {
    #[serde(flatten)]
    pub common: EdgeCommon,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEdge {
    #[serde(flatten)]
    pub common: EdgeCommon,
    pub value: EventName,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualEdge {
    #[serde(flatten)]
    pub common: EdgeCommon,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventName {
    Init,
    NoMatch,
    Custom(String),
}

impl From<String> for EventName {
    fn from(value: String) -> Self {
        match value.as_str() {
            "init" => Self::Init,
            "no_match" => Self::NoMatch,
            _ => Self::Custom(value),
        }
    }
}

impl From<EventName> for String {
    fn from(value: EventName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::NoMatch => f.write_str("no_match"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

impl IntentEdge {
    pub fn effective_threshold(&self) -> f64 {
        self.threshold.unwrap_or(DEFAULT_INTENT_THRESHOLD)
    }
}

impl RuleEdge {
    pub fn effective_threshold(&self) -> f64 {
        self.threshold.unwrap_or(DEFAULT_RULE_THRESHOLD)
    }
}

impl EntryEdge {
    pub fn common(&self) -> &EdgeCommon {
        match self {
            Self::Match(edge) => &edge.common,
            Self::Intent(edge) => &edge.common,
            Self::Rule(edge) => &edge.common,
            Self::Event(edge) => &edge.common,
            Self::Manual(edge) => &edge.common,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.common().id.as_deref()
    }

    pub fn target_node_id(&self) -> &str {
        &self.common().target_node_id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Match(_) => "match",
            Self::Intent(_) => "intent",
            Self::Rule(_) => "rule",
            Self::Event(_) => "event",
            Self::Manual(_) => "manual",
        }
    }

    pub fn is_event(&self, name: &EventName) -> bool {
        matches!(self, Self::Event(edge) if &edge.value == name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EntryEdge, EventName, DEFAULT_INTENT_THRESHOLD};

    #[test]
    fn edges_deserialize_by_type_tag() {
        let edges: Vec<EntryEdge> = serde_json::from_value(json!([
            {"type": "match", "value": "^hello", "target_node_id": "greet", "id": "e1"},
            {"type": "intent", "value": "order_pizza", "target_node_id": "order"},
            {"type": "rule", "id": "r1", "rule_ids": ["vip"], "threshold": 0.7, "target_node_id": "vip"},
            {"type": "event", "value": "no_match", "target_node_id": "fallback"},
            {"type": "event", "value": "callback_received", "target_node_id": "cb"},
            {"type": "manual", "target_node_id": "start"}
        ]))
        .expect("edges deserialize");

        assert_eq!(edges.len(), 6);
        assert_eq!(edges[0].id(), Some("e1"));
        assert_eq!(edges[0].kind(), "match");
        match &edges[1] {
            EntryEdge::Intent(edge) => {
                assert_eq!(edge.effective_threshold(), DEFAULT_INTENT_THRESHOLD)
            }
            other => panic!("unexpected edge {other:?}"),
        }
        assert!(edges[3].is_event(&EventName::NoMatch));
        assert!(edges[4].is_event(&EventName::Custom("callback_received".to_owned())));
        assert_eq!(edges[5].target_node_id(), "start");
    }

    #[test]
    fn event_names_round_trip_through_strings() {
        let value = serde_json::to_value(EventName::Init).expect("serialize");
        assert_eq!(value, json!("init"));
        let custom: EventName = serde_json::from_value(json!("payment_done")).expect("parse");
        assert_eq!(custom, EventName::Custom("payment_done".to_owned()));
    }
}
