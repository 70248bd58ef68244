use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One atomic operation inside a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Answer(AnswerBlock),
    WaitForUser(WaitForUserBlock),
    Variables(VariablesBlock),
    Script(ScriptBlock),
    SingleIf(SingleIfBlock),
    HttpRequest(HttpRequestBlock),
    Buttons(ButtonsBlock),
    DynamicButtons(DynamicButtonsBlock),
    Extend(ExtendBlock),
    MatchExtend(MatchExtendBlock),
    Llm(LlmBlock),
    Agent(AgentBlock),
    Close(CloseBlock),
    GoOperator(GoOperatorBlock),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerBlock {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForUserBlock {
    pub id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Constant,
    Python,
    Regexp,
    RegexpMap,
}

/// Scopes a block is allowed to write into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritableScope {
    #[default]
    Session,
    Request,
    Temp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariablesBlock {
    pub id: String,
    #[serde(alias = "variable_name")]
    pub name: String,
    #[serde(default)]
    pub value: Value,
    pub variable_type: VariableKind,
    #[serde(default)]
    pub scope: WritableScope,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBlock {
    pub id: String,
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleIfBlock {
    pub id: String,
    pub expression: String,
    pub target_node_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMapping {
    pub path: String,
    pub variable_name: String,
    #[serde(default)]
    pub scope: WritableScope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestBlock {
    pub id: String,
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_seconds: Option<u64>,
    #[serde(default)]
    pub mappings: Vec<ResponseMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_variable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok_target_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_target_node_id: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub title: String,
    pub target_node_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonsBlock {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub buttons: Vec<Button>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_node_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicButtonsBlock {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub source_variable_name: String,
    pub result_variable_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_node_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendBlock {
    pub id: String,
    pub scenario_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub return_back: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExtendBlock {
    pub id: String,
    pub scenario_ids: Vec<String>,
    #[serde(default)]
    pub return_back: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Prompt and routing settings shared by `llm` and `agent` blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub system_message: String,
    #[serde(default)]
    pub user_message: String,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub history_depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable_name: Option<String>,
    #[serde(default)]
    pub emit_answer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok_target_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_target_node_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmBlock {
    pub id: String,
    #[serde(flatten)]
    pub chat: ChatSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentBlock {
    pub id: String,
    #[serde(flatten)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseBlock {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoOperatorBlock {
    pub id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Block {
    pub fn id(&self) -> &str {
        match self {
            Self::Answer(block) => &block.id,
            Self::WaitForUser(block) => &block.id,
            Self::Variables(block) => &block.id,
            Self::Script(block) => &block.id,
            Self::SingleIf(block) => &block.id,
            Self::HttpRequest(block) => &block.id,
            Self::Buttons(block) => &block.id,
            Self::DynamicButtons(block) => &block.id,
            Self::Extend(block) => &block.id,
            Self::MatchExtend(block) => &block.id,
            Self::Llm(block) => &block.id,
            Self::Agent(block) => &block.id,
            Self::Close(block) => &block.id,
            Self::GoOperator(block) => &block.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Answer(_) => "answer",
            Self::WaitForUser(_) => "wait_for_user",
            Self::Variables(_) => "variables",
            Self::Script(_) => "script",
            Self::SingleIf(_) => "single_if",
            Self::HttpRequest(_) => "http_request",
            Self::Buttons(_) => "buttons",
            Self::DynamicButtons(_) => "dynamic_buttons",
            Self::Extend(_) => "extend",
            Self::MatchExtend(_) => "match_extend",
            Self::Llm(_) => "llm",
            Self::Agent(_) => "agent",
            Self::Close(_) => "close",
            Self::GoOperator(_) => "go_operator",
        }
    }

    /// Node declared by the block for recovering from its own failures.
    pub fn error_target(&self) -> Option<&str> {
        match self {
            Self::HttpRequest(block) => block.error_target_node_id.as_deref(),
            Self::Llm(block) => block.chat.error_target_node_id.as_deref(),
            Self::Agent(block) => block.chat.error_target_node_id.as_deref(),
            _ => None,
        }
    }

    /// Whether execution may park on this block awaiting user input.
    pub fn suspends(&self) -> bool {
        matches!(self, Self::WaitForUser(_) | Self::Buttons(_) | Self::DynamicButtons(_))
    }

    /// Every node id the block may branch to inside its own scenario.
    pub fn node_targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        match self {
            Self::SingleIf(block) => targets.push(block.target_node_id.as_str()),
            Self::HttpRequest(block) => {
                targets.extend(block.ok_target_node_id.as_deref());
                targets.extend(block.error_target_node_id.as_deref());
            }
            Self::Buttons(block) => {
                targets.extend(block.buttons.iter().map(|button| button.target_node_id.as_str()));
                targets.extend(block.invalid_node_id.as_deref());
            }
            Self::DynamicButtons(block) => {
                targets.extend(block.target_node_id.as_deref());
                targets.extend(block.invalid_node_id.as_deref());
            }
            Self::Llm(LlmBlock { chat, .. }) | Self::Agent(AgentBlock { chat, .. }) => {
                targets.extend(chat.ok_target_node_id.as_deref());
                targets.extend(chat.error_target_node_id.as_deref());
            }
            _ => {}
        }
        targets
    }
}
