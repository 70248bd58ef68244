use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TurnInput {
    Message(String),
    Event(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredLabel {
    pub name: String,
    pub confidence: f64,
}

/// Classifier and rule output for one message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NluResult {
    #[serde(default)]
    pub intents: Vec<ScoredLabel>,
    #[serde(default)]
    pub rules: Vec<ScoredLabel>,
}

impl NluResult {
    pub fn intent_confidence(&self, name: &str) -> Option<f64> {
        self.intents
            .iter()
            .filter(|intent| intent.name == name)
            .map(|intent| intent.confidence)
            .reduce(f64::max)
    }

    /// Highest confidence among the listed rule ids.
    pub fn rule_confidence(&self, rule_ids: &[String]) -> Option<f64> {
        self.rules
            .iter()
            .filter(|rule| rule_ids.iter().any(|id| id == &rule.name))
            .map(|rule| rule.confidence)
            .reduce(f64::max)
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.rules.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundTurn {
    pub session_id: String,
    pub channel_id: String,
    pub input: TurnInput,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nlu: Option<NluResult>,
    #[serde(default)]
    pub debug: bool,
}

impl InboundTurn {
    pub fn message(
        session_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            channel_id: channel_id.into(),
            input: TurnInput::Message(text.into()),
            timestamp: Utc::now(),
            nlu: None,
            debug: false,
        }
    }

    pub fn event(
        session_id: impl Into<String>,
        channel_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { input: TurnInput::Event(name.into()), ..Self::message(session_id, channel_id, "") }
    }

    pub fn with_nlu(mut self, nlu: NluResult) -> Self {
        self.nlu = Some(nlu);
        self
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn message_text(&self) -> Option<&str> {
        match &self.input {
            TurnInput::Message(text) => Some(text.as_str()),
            TurnInput::Event(_) => None,
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match &self.input {
            TurnInput::Event(name) => Some(name.as_str()),
            TurnInput::Message(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tts: Option<String>,
    },
    Buttons {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        buttons: Vec<String>,
    },
    OperatorHandoff {
        #[serde(default)]
        metadata: Map<String, Value>,
    },
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), tts: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogStatus {
    Suspended,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConfigReference,
    ExpressionEvaluation,
    ExternalCall,
    SuspensionMismatch,
    BudgetExceeded,
}

/// Structured record of an error raised while processing a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    pub recovered: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub score: f64,
    pub no_match: bool,
    pub resumed: bool,
}

/// Interpreter state machine. A trace step records the state its block left the machine in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Suspended,
    Extending,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub scenario_slug: String,
    pub node_id: String,
    pub block_id: String,
    pub block_type: String,
    pub state: ExecutionState,
}

/// Everything produced by one processed turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnOutput {
    pub session_id: String,
    pub correlation_id: String,
    pub messages: Vec<OutboundMessage>,
    pub status: DialogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<ActivationTrace>,
    #[serde(default)]
    pub errors: Vec<TurnFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceStep>,
}

impl TurnOutput {
    pub fn texts(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter_map(|message| match message {
                OutboundMessage::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_operator_handoff(&self) -> bool {
        self.messages
            .iter()
            .any(|message| matches!(message, OutboundMessage::OperatorHandoff { .. }))
    }

    /// Renders the messenger payload shape: text bubbles plus button suggestions.
    pub fn to_payload(&self) -> Value {
        let mut items = Vec::new();
        let mut buttons = Vec::new();
        for message in &self.messages {
            match message {
                OutboundMessage::Text { text, tts } => {
                    let mut bubble = json!({"type": "text", "value": text});
                    if let Some(tts) = tts {
                        bubble["tts"] = json!(tts);
                    }
                    items.push(json!({ "bubble": bubble }));
                }
                OutboundMessage::Buttons { text, buttons: titles } => {
                    if let Some(text) = text {
                        items.push(json!({"bubble": {"type": "text", "value": text}}));
                    }
                    buttons.extend(titles.iter().map(|title| {
                        json!({"title": title, "action": {"type": "text", "value": title}})
                    }));
                }
                OutboundMessage::OperatorHandoff { metadata } => {
                    items.push(json!({"operator_handoff": metadata}));
                }
            }
        }

        let mut payload = json!({ "items": items });
        if !buttons.is_empty() {
            payload["suggestions"] = json!({ "buttons": buttons });
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        DialogStatus, InboundTurn, NluResult, OutboundMessage, ScoredLabel, TurnInput, TurnOutput,
    };

    #[test]
    fn payload_collects_bubbles_and_suggestions() {
        let output = TurnOutput {
            session_id: "s1".to_owned(),
            correlation_id: "c1".to_owned(),
            messages: vec![
                OutboundMessage::text("Hello"),
                OutboundMessage::Buttons {
                    text: Some("Pick one".to_owned()),
                    buttons: vec!["Yes".to_owned(), "No".to_owned()],
                },
            ],
            status: DialogStatus::Suspended,
            activation: None,
            errors: Vec::new(),
            trace: Vec::new(),
        };

        let payload = output.to_payload();
        assert_eq!(payload["items"][0]["bubble"]["value"], json!("Hello"));
        assert_eq!(payload["items"][1]["bubble"]["value"], json!("Pick one"));
        assert_eq!(payload["suggestions"]["buttons"][1]["title"], json!("No"));
        assert_eq!(output.texts(), vec!["Hello"]);
    }

    #[test]
    fn nlu_confidence_takes_best_matching_label() {
        let nlu = NluResult {
            intents: vec![
                ScoredLabel { name: "greet".to_owned(), confidence: 0.4 },
                ScoredLabel { name: "greet".to_owned(), confidence: 0.8 },
            ],
            rules: vec![ScoredLabel { name: "vip".to_owned(), confidence: 0.9 }],
        };
        assert_eq!(nlu.intent_confidence("greet"), Some(0.8));
        assert_eq!(nlu.intent_confidence("bye"), None);
        assert_eq!(nlu.rule_confidence(&["other".to_owned(), "vip".to_owned()]), Some(0.9));
    }

    #[test]
    fn event_turns_carry_no_message_text() {
        let turn = InboundTurn::event("s1", "web", "payment_done");
        assert_eq!(turn.input, TurnInput::Event("payment_done".to_owned()));
        assert_eq!(turn.message_text(), None);
        assert_eq!(turn.event_name(), Some("payment_done"));
    }
}
