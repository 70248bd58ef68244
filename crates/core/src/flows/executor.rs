//! Per-block semantics. Each call runs exactly one block against the variable context.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{timeout, Instant};

use crate::activation::{ActivationResolver, Signal};
use crate::config::EngineConfig;
use crate::context::VariableContext;
use crate::domain::block::{
    AgentBlock, Block, ButtonsBlock, ChatSettings, DynamicButtonsBlock, HttpRequestBlock,
    VariableKind, VariablesBlock, WritableScope,
};
use crate::domain::session::{AwaitedInput, ChoiceOption, ChoiceSet, HistoryEntry, HistoryRole};
use crate::domain::solution::{Scenario, Solution};
use crate::domain::turn::{NluResult, OutboundMessage};
use crate::errors::{is_retryable_status, EngineError, ExternalCallError};
use crate::expression::{self, json_path, ScriptProgram};
use crate::flows::agent_loop::AgentRun;
use crate::flows::gateway::{
    ChatMessage, ChatRequest, ChatRole, Gateways, HttpCall, HttpReply,
};
use crate::flows::retry::RetryPolicy;
use crate::flows::states::BlockOutcome;

pub const HTTP_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// Read-only surroundings shared by every block of a turn.
pub struct ExecutionEnv<'a> {
    pub solution: &'a Solution,
    pub gateways: &'a Gateways,
    pub settings: &'a EngineConfig,
    pub nlu: &'a NluResult,
    pub history: &'a [HistoryEntry],
    pub deadline: Instant,
}

impl ExecutionEnv<'_> {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_config(self.settings)
    }
}

pub struct BlockExecutor<'a> {
    env: &'a ExecutionEnv<'a>,
}

impl<'a> BlockExecutor<'a> {
    pub fn new(env: &'a ExecutionEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn execute(
        &self,
        block: &Block,
        context: &mut VariableContext,
        messages: &mut Vec<OutboundMessage>,
    ) -> Result<BlockOutcome, EngineError> {
        match block {
            Block::Answer(answer) => {
                let text = expression::render(&answer.text, context)?;
                let tts = match &answer.tts {
                    Some(tts) => Some(expression::render(tts, context)?),
                    None => None,
                };
                messages.push(OutboundMessage::Text { text, tts });
                Ok(BlockOutcome::Continue)
            }
            Block::WaitForUser(_) => Ok(BlockOutcome::Suspend(AwaitedInput::Message)),
            Block::Variables(variables) => {
                let value = variable_value(variables, context)?;
                context.set(variables.scope, variables.name.clone(), value);
                Ok(BlockOutcome::Continue)
            }
            Block::Script(script) => {
                ScriptProgram::parse(&script.code)?.run(context)?;
                Ok(BlockOutcome::Continue)
            }
            Block::SingleIf(single_if) => {
                if expression::evaluate_bool(&single_if.expression, context)? {
                    Ok(BlockOutcome::Branch(single_if.target_node_id.clone()))
                } else {
                    Ok(BlockOutcome::Continue)
                }
            }
            Block::HttpRequest(request) => self.http_request(request, context).await,
            Block::Buttons(buttons) => buttons_outcome(buttons, context, messages),
            Block::DynamicButtons(buttons) => dynamic_buttons_outcome(buttons, context, messages),
            Block::Extend(extend) => {
                let scenario = self.scenario(&extend.scenario_id)?;
                let node_id = match &extend.node_id {
                    Some(node_id) => node_id.clone(),
                    None => entry_node(scenario)?,
                };
                Ok(BlockOutcome::Extend {
                    scenario_slug: scenario.slug.clone(),
                    node_id,
                    return_back: extend.return_back,
                })
            }
            Block::MatchExtend(match_extend) => {
                let candidates = match_extend
                    .scenario_ids
                    .iter()
                    .map(|reference| self.scenario(reference))
                    .collect::<Result<Vec<&Scenario>, EngineError>>()?;
                let text = context.last_user_message().to_owned();
                let resolver = ActivationResolver::new(self.env.solution);
                Ok(resolver
                    .resolve_within(&Signal::Message(&text), self.env.nlu, &candidates)
                    .map_or(BlockOutcome::Continue, |entry| BlockOutcome::Extend {
                        scenario_slug: entry.scenario_slug,
                        node_id: entry.node_id,
                        return_back: match_extend.return_back,
                    }))
            }
            Block::Llm(llm) => {
                let request = self.chat_request(&llm.chat, context)?;
                let llm_client = &self.env.gateways.llm;
                let response = self
                    .env
                    .retry()
                    .run(self.env.deadline, "llm", || llm_client.complete(request.clone()))
                    .await?;
                let text = response.content.unwrap_or_default();
                Ok(store_chat_result(&llm.chat, text, context, messages))
            }
            Block::Agent(agent) => {
                let text = self.agent(agent, context).await?;
                Ok(store_chat_result(&agent.chat, text, context, messages))
            }
            Block::Close(_) => Ok(BlockOutcome::Close),
            Block::GoOperator(operator) => {
                let metadata = operator.metadata.clone();
                messages.push(OutboundMessage::OperatorHandoff { metadata: metadata.clone() });
                Ok(BlockOutcome::Handoff(metadata))
            }
        }
    }

    fn scenario(&self, reference: &str) -> Result<&'a Scenario, EngineError> {
        self.env.solution.scenario_by_ref(reference).ok_or_else(|| {
            EngineError::ConfigReference(format!("scenario `{reference}` does not exist"))
        })
    }

    async fn http_request(
        &self,
        block: &HttpRequestBlock,
        context: &mut VariableContext,
    ) -> Result<BlockOutcome, EngineError> {
        let method = expression::render(&block.method, context)?.trim().to_ascii_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            return Err(EngineError::ExpressionEvaluation(format!(
                "unsupported http method `{method}`"
            )));
        }

        let mut headers = BTreeMap::new();
        for (name, value) in &block.headers {
            headers.insert(name.clone(), expression::render(value, context)?);
        }
        let body = match &block.body {
            Some(body) => Some(expression::render(body, context)?),
            None => None,
        };
        let call = HttpCall {
            method,
            url: expression::render(&block.url, context)?,
            headers,
            body,
            timeout: Duration::from_secs(
                block.timeout_in_seconds.unwrap_or(self.env.settings.http_timeout_secs),
            ),
        };

        let http = &self.env.gateways.http;
        let attempt = self
            .env
            .retry()
            .run(self.env.deadline, "http", || {
                let call = call.clone();
                async move {
                    let limit = call.timeout;
                    let reply = timeout(limit, http.send(call))
                        .await
                        .unwrap_or(Err(ExternalCallError::Timeout(limit)))?;
                    // Transient statuses go back to the policy; the rest are judged below.
                    if is_retryable_status(reply.status) {
                        return Err(ExternalCallError::Status {
                            status: reply.status,
                            body: reply.body,
                        });
                    }
                    Ok(reply)
                }
            })
            .await;
        let reply = match attempt {
            Ok(reply) => reply,
            Err(ExternalCallError::Status { status, body }) => HttpReply { status, body },
            Err(error) => return Err(error.into()),
        };

        if let Some(status_variable) = &block.status_variable_name {
            context.set(WritableScope::Session, status_variable.clone(), Value::from(reply.status));
        }
        if !reply.is_success() {
            return Err(ExternalCallError::Status { status: reply.status, body: reply.body }.into());
        }

        let document = reply.body_value();
        for mapping in &block.mappings {
            let value =
                json_path::select(&document, &mapping.path)?.cloned().unwrap_or(Value::Null);
            context.set(mapping.scope, mapping.variable_name.clone(), value);
        }
        if let Some(result_variable) = &block.result_variable_name {
            context.set(WritableScope::Session, result_variable.clone(), document);
        }

        Ok(block.ok_target_node_id.clone().map_or(BlockOutcome::Continue, BlockOutcome::Branch))
    }

    fn chat_request(
        &self,
        chat: &ChatSettings,
        context: &VariableContext,
    ) -> Result<ChatRequest, EngineError> {
        let system_message = expression::render(&chat.system_message, context)?;
        let mut messages = vec![ChatMessage::new(ChatRole::System, system_message)];
        let start = self.env.history.len().saturating_sub(chat.history_depth);
        messages.extend(self.env.history[start..].iter().map(|entry| {
            let role = match entry.role {
                HistoryRole::User => ChatRole::User,
                HistoryRole::Bot => ChatRole::Assistant,
            };
            ChatMessage::new(role, entry.text.clone())
        }));
        let user_message = expression::render(&chat.user_message, context)?;
        if !user_message.trim().is_empty() {
            messages.push(ChatMessage::new(ChatRole::User, user_message));
        }

        Ok(ChatRequest {
            model: chat.model.model_name.clone(),
            messages,
            temperature: chat.model.temperature,
            max_tokens: chat.model.max_tokens,
            tools: Vec::new(),
        })
    }

    async fn agent(
        &self,
        block: &AgentBlock,
        context: &VariableContext,
    ) -> Result<String, EngineError> {
        let request = self.chat_request(&block.chat, context)?;
        let run = AgentRun {
            llm: self.env.gateways.llm.as_ref(),
            tools: self.env.gateways.tools.as_ref(),
            request,
            allowlist: &block.tools,
            servers: &block.mcp_servers,
            max_steps: block.max_steps.unwrap_or(self.env.settings.agent_max_steps),
            retry: self.env.retry(),
            deadline: self.env.deadline,
        };
        Ok(run.run().await?)
    }
}

fn entry_node(scenario: &Scenario) -> Result<String, EngineError> {
    scenario.entry_node_id().map(str::to_owned).ok_or_else(|| {
        EngineError::ConfigReference(format!("scenario `{}` has no nodes", scenario.slug))
    })
}

fn variable_value(block: &VariablesBlock, context: &VariableContext) -> Result<Value, EngineError> {
    let source = || {
        block.value.as_str().ok_or_else(|| {
            EngineError::ExpressionEvaluation(format!(
                "variable `{}` of type {:?} needs a string value",
                block.name, block.variable_type
            ))
        })
    };

    match block.variable_type {
        VariableKind::Constant => Ok(block.value.clone()),
        VariableKind::Python => expression::evaluate(source()?, context),
        VariableKind::Regexp => {
            let extracted = expression::extract_match(source()?, context.last_user_message())?;
            Ok(extracted.map_or(Value::Null, Value::String))
        }
        VariableKind::RegexpMap => {
            let extracted = expression::extract_match(source()?, context.last_user_message())?;
            let mapped = extracted.and_then(|found| {
                let found = found.to_lowercase();
                block
                    .map
                    .iter()
                    .find(|(key, _)| key.to_lowercase() == found)
                    .map(|(_, value)| value.clone())
            });
            Ok(mapped.or_else(|| block.default.clone()).unwrap_or(Value::Null))
        }
    }
}

fn render_optional(
    text: &Option<String>,
    context: &VariableContext,
) -> Result<Option<String>, EngineError> {
    text.as_deref().map(|text| expression::render(text, context)).transpose()
}

fn buttons_outcome(
    block: &ButtonsBlock,
    context: &VariableContext,
    messages: &mut Vec<OutboundMessage>,
) -> Result<BlockOutcome, EngineError> {
    let mut options = Vec::with_capacity(block.buttons.len());
    for button in &block.buttons {
        let title = expression::render(&button.title, context)?;
        options.push(ChoiceOption {
            value: Value::String(title.clone()),
            title,
            target_node_id: Some(button.target_node_id.clone()),
        });
    }

    messages.push(OutboundMessage::Buttons {
        text: render_optional(&block.text, context)?,
        buttons: options.iter().map(|option| option.title.clone()).collect(),
    });
    Ok(BlockOutcome::Suspend(AwaitedInput::Choice(ChoiceSet {
        options,
        invalid_node_id: block.invalid_node_id.clone(),
        result_variable_name: None,
        target_node_id: None,
    })))
}

fn dynamic_buttons_outcome(
    block: &DynamicButtonsBlock,
    context: &VariableContext,
    messages: &mut Vec<OutboundMessage>,
) -> Result<BlockOutcome, EngineError> {
    let source = context.lookup(&block.source_variable_name).ok_or_else(|| {
        EngineError::ExpressionEvaluation(format!(
            "button source `{}` is not set",
            block.source_variable_name
        ))
    })?;
    let items = source.as_array().ok_or_else(|| {
        EngineError::ExpressionEvaluation(format!(
            "button source `{}` is not a list",
            block.source_variable_name
        ))
    })?;

    let options: Vec<ChoiceOption> = items
        .iter()
        .map(|item| {
            let title = item
                .get("title")
                .or_else(|| item.get("name"))
                .or_else(|| item.get("text"))
                .unwrap_or(item);
            ChoiceOption {
                title: expression::display_value(title),
                target_node_id: None,
                value: item.get("value").cloned().unwrap_or_else(|| item.clone()),
            }
        })
        .collect();

    messages.push(OutboundMessage::Buttons {
        text: render_optional(&block.text, context)?,
        buttons: options.iter().map(|option| option.title.clone()).collect(),
    });
    Ok(BlockOutcome::Suspend(AwaitedInput::Choice(ChoiceSet {
        options,
        invalid_node_id: block.invalid_node_id.clone(),
        result_variable_name: Some(block.result_variable_name.clone()),
        target_node_id: block.target_node_id.clone(),
    })))
}

fn store_chat_result(
    chat: &ChatSettings,
    text: String,
    context: &mut VariableContext,
    messages: &mut Vec<OutboundMessage>,
) -> BlockOutcome {
    if chat.emit_answer && !text.trim().is_empty() {
        messages.push(OutboundMessage::text(text.clone()));
    }
    if let Some(result_variable) = &chat.result_variable_name {
        context.set(WritableScope::Session, result_variable.clone(), Value::String(text));
    }
    chat.ok_target_node_id.clone().map_or(BlockOutcome::Continue, BlockOutcome::Branch)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map};
    use tokio::time::Instant;

    use super::{BlockExecutor, ExecutionEnv};
    use crate::config::EngineConfig;
    use crate::context::VariableContext;
    use crate::domain::block::{Block, WritableScope};
    use crate::domain::session::{AwaitedInput, HistoryEntry, HistoryRole, Scopes};
    use crate::domain::solution::Solution;
    use crate::domain::turn::{NluResult, OutboundMessage};
    use crate::errors::{EngineError, ExternalCallError};
    use crate::flows::gateway::{
        ChatRequest, ChatResponse, Gateways, HttpCall, HttpReply, HttpTransport, LlmClient,
    };
    use crate::flows::states::BlockOutcome;

    struct CannedHttp {
        reply: Result<HttpReply, ExternalCallError>,
        calls: Mutex<Vec<HttpCall>>,
    }

    #[async_trait]
    impl HttpTransport for CannedHttp {
        async fn send(&self, call: HttpCall) -> Result<HttpReply, ExternalCallError> {
            self.calls.lock().expect("lock").push(call);
            self.reply.clone()
        }
    }

    /// Replays `replies` in order, repeating the last one once exhausted.
    struct ScriptedHttp {
        replies: Vec<HttpReply>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl HttpTransport for ScriptedHttp {
        async fn send(&self, _call: HttpCall) -> Result<HttpReply, ExternalCallError> {
            let mut calls = self.calls.lock().expect("lock");
            let reply = self.replies[(*calls).min(self.replies.len() - 1)].clone();
            *calls += 1;
            Ok(reply)
        }
    }

    struct SlowHttp;

    #[async_trait]
    impl HttpTransport for SlowHttp {
        async fn send(&self, _call: HttpCall) -> Result<HttpReply, ExternalCallError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HttpReply { status: 200, body: String::new() })
        }
    }

    struct EchoLlm {
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ExternalCallError> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.seen.lock().expect("lock").push(request);
            Ok(ChatResponse { content: Some(format!("echo: {last}")), tool_calls: Vec::new() })
        }
    }

    struct OverloadedLlm {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl LlmClient for OverloadedLlm {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ExternalCallError> {
            *self.calls.lock().expect("lock") += 1;
            Err(ExternalCallError::Status { status: 503, body: "overloaded".to_owned() })
        }
    }

    fn solution() -> Solution {
        serde_json::from_value(json!({
            "bot_name": "exec",
            "scenarios": [
                {"id": "s-main", "slug": "main", "nodes": [{"id": "start"}]},
                {"slug": "refunds",
                 "entry_edges": [{"type": "match", "value": "refund", "target_node_id": "ask"}],
                 "nodes": [{"id": "intro"}, {"id": "ask"}]},
                {"slug": "faq", "entry_edges": [{"type": "manual", "target_node_id": "answers"}],
                 "nodes": [{"id": "answers"}]}
            ]
        }))
        .expect("solution deserializes")
    }

    fn context(message: &str) -> VariableContext {
        let mut system = Map::new();
        system.insert("last_user_message".to_owned(), json!(message));
        VariableContext::new(system, Scopes::default())
    }

    fn block(value: serde_json::Value) -> Block {
        serde_json::from_value(value).expect("block deserializes")
    }

    async fn execute(
        gateways: &Gateways,
        history: &[HistoryEntry],
        block: &Block,
        context: &mut VariableContext,
    ) -> (Result<BlockOutcome, EngineError>, Vec<OutboundMessage>) {
        let settings = EngineConfig { max_retries: 0, ..EngineConfig::default() };
        execute_with(&settings, gateways, history, block, context).await
    }

    fn retrying() -> EngineConfig {
        EngineConfig { max_retries: 2, retry_backoff_ms: 1, ..EngineConfig::default() }
    }

    async fn execute_with(
        settings: &EngineConfig,
        gateways: &Gateways,
        history: &[HistoryEntry],
        block: &Block,
        context: &mut VariableContext,
    ) -> (Result<BlockOutcome, EngineError>, Vec<OutboundMessage>) {
        let solution = solution();
        let nlu = NluResult::default();
        let env = ExecutionEnv {
            solution: &solution,
            gateways,
            settings,
            nlu: &nlu,
            history,
            deadline: Instant::now() + Duration::from_secs(60),
        };
        let mut messages = Vec::new();
        let outcome = BlockExecutor::new(&env).execute(block, context, &mut messages).await;
        (outcome, messages)
    }

    #[tokio::test]
    async fn answer_renders_templates() {
        let mut ctx = context("hi");
        ctx.set(WritableScope::Session, "name", json!("Ada"));
        let answer =
            block(json!({"type": "answer", "id": "a", "text": "Hello {{ session.name }}"}));

        let (outcome, messages) = execute(&Gateways::default(), &[], &answer, &mut ctx).await;
        assert_eq!(outcome, Ok(BlockOutcome::Continue));
        assert_eq!(messages, vec![OutboundMessage::text("Hello Ada")]);
    }

    #[tokio::test]
    async fn variables_cover_every_kind() {
        let mut ctx = context("I want the LARGE pizza, order 981");
        let gateways = Gateways::default();
        let blocks = [
            json!({"type": "variables", "id": "v1", "name": "greeting", "value": {"x": 1},
                   "variable_type": "constant"}),
            json!({"type": "variables", "id": "v2", "name": "double", "value": "2 * 21",
                   "variable_type": "python", "scope": "request"}),
            json!({"type": "variables", "id": "v3", "name": "order", "value": "order (\\d+)",
                   "variable_type": "regexp"}),
            json!({"type": "variables", "id": "v4", "name": "size", "value": "(small|large)",
                   "variable_type": "regexp_map", "map": {"large": "L", "small": "S"}}),
            json!({"type": "variables", "id": "v5", "name": "topping", "value": "(ham|olive)",
                   "variable_type": "regexp_map", "map": {"ham": "H"}, "default": "none"}),
        ];
        for value in blocks {
            let (outcome, _) = execute(&gateways, &[], &block(value), &mut ctx).await;
            assert_eq!(outcome, Ok(BlockOutcome::Continue));
        }

        let scopes = ctx.scopes();
        assert_eq!(scopes.session.get("greeting"), Some(&json!({"x": 1})));
        assert_eq!(scopes.request.get("double"), Some(&json!(42)));
        assert_eq!(scopes.session.get("order"), Some(&json!("981")));
        assert_eq!(scopes.session.get("size"), Some(&json!("L")));
        assert_eq!(scopes.session.get("topping"), Some(&json!("none")));
    }

    #[tokio::test]
    async fn single_if_branches_only_when_truthy() {
        let mut ctx = context("");
        ctx.set(WritableScope::Session, "n", json!(3));
        let gateways = Gateways::default();

        let yes = block(json!({"type": "single_if", "id": "i", "expression": "session.n > 2",
                               "target_node_id": "big"}));
        let no = block(json!({"type": "single_if", "id": "i", "expression": "session.n > 5",
                              "target_node_id": "huge"}));
        assert_eq!(
            execute(&gateways, &[], &yes, &mut ctx).await.0,
            Ok(BlockOutcome::Branch("big".to_owned()))
        );
        assert_eq!(execute(&gateways, &[], &no, &mut ctx).await.0, Ok(BlockOutcome::Continue));
    }

    #[tokio::test]
    async fn http_success_applies_mappings_and_branches() {
        let http = Arc::new(CannedHttp {
            reply: Ok(HttpReply {
                status: 200,
                body: r#"{"order": {"id": "A-1", "items": [{"sku": "x"}]}}"#.to_owned(),
            }),
            calls: Mutex::new(Vec::new()),
        });
        let gateways = Gateways::default().with_http(http.clone());
        let mut ctx = context("");
        ctx.set(WritableScope::Session, "token", json!("t0k"));

        let request = block(json!({
            "type": "http_request", "id": "h", "url": "https://api.test/orders/{{ session.token }}",
            "method": "post", "headers": {"Authorization": "Bearer {{ session.token }}"},
            "body": "{\"q\": 1}",
            "mappings": [
                {"path": "$.order.id", "variable_name": "order_id"},
                {"path": "$.order.items[0].sku", "variable_name": "sku", "scope": "temp"},
                {"path": "$.order.missing", "variable_name": "gone"}
            ],
            "result_variable_name": "raw", "status_variable_name": "status",
            "ok_target_node_id": "done"
        }));

        let (outcome, _) = execute(&gateways, &[], &request, &mut ctx).await;
        assert_eq!(outcome, Ok(BlockOutcome::Branch("done".to_owned())));

        let scopes = ctx.scopes();
        assert_eq!(scopes.session.get("order_id"), Some(&json!("A-1")));
        assert_eq!(scopes.temp.get("sku"), Some(&json!("x")));
        assert_eq!(scopes.session.get("gone"), Some(&json!(null)));
        assert_eq!(scopes.session.get("status"), Some(&json!(200)));
        assert!(scopes.session.get("raw").is_some_and(|raw| raw.is_object()));

        let calls = http.calls.lock().expect("lock");
        assert_eq!(calls[0].method, "POST");
        assert_eq!(calls[0].url, "https://api.test/orders/t0k");
        assert_eq!(calls[0].headers.get("Authorization").map(String::as_str), Some("Bearer t0k"));
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn http_failure_status_is_an_external_call_error() {
        let http = Arc::new(CannedHttp {
            reply: Ok(HttpReply { status: 500, body: "boom".to_owned() }),
            calls: Mutex::new(Vec::new()),
        });
        let gateways = Gateways::default().with_http(http);
        let mut ctx = context("");
        let request = block(json!({"type": "http_request", "id": "h", "url": "https://api.test",
                                   "status_variable_name": "status"}));

        let (outcome, _) = execute(&gateways, &[], &request, &mut ctx).await;
        assert!(matches!(
            outcome,
            Err(EngineError::ExternalCall(ExternalCallError::Status { status: 500, .. }))
        ));
        assert_eq!(ctx.scopes().session.get("status"), Some(&json!(500)));
    }

    #[tokio::test]
    async fn http_retries_transient_statuses_before_reading_the_reply() {
        let http = Arc::new(ScriptedHttp {
            replies: vec![
                HttpReply { status: 503, body: "busy".to_owned() },
                HttpReply { status: 200, body: r#"{"ok": true}"#.to_owned() },
            ],
            calls: Mutex::new(0),
        });
        let gateways = Gateways::default().with_http(http.clone());
        let settings = retrying();
        let mut ctx = context("");
        let request = block(json!({"type": "http_request", "id": "h", "url": "https://api.test",
            "mappings": [{"path": "$.ok", "variable_name": "ok"}],
            "status_variable_name": "status"}));

        let (outcome, _) = execute_with(&settings, &gateways, &[], &request, &mut ctx).await;
        assert_eq!(outcome, Ok(BlockOutcome::Continue));
        assert_eq!(*http.calls.lock().expect("lock"), 2);
        assert_eq!(ctx.scopes().session.get("ok"), Some(&json!(true)));
        assert_eq!(ctx.scopes().session.get("status"), Some(&json!(200)));
    }

    #[tokio::test]
    async fn http_keeps_the_last_status_once_retries_run_out() {
        let http = Arc::new(ScriptedHttp {
            replies: vec![HttpReply { status: 429, body: "slow down".to_owned() }],
            calls: Mutex::new(0),
        });
        let gateways = Gateways::default().with_http(http.clone());
        let settings = retrying();
        let mut ctx = context("");
        let request = block(json!({"type": "http_request", "id": "h", "url": "https://api.test",
            "status_variable_name": "status"}));

        let (outcome, _) = execute_with(&settings, &gateways, &[], &request, &mut ctx).await;
        assert!(matches!(
            outcome,
            Err(EngineError::ExternalCall(ExternalCallError::Status { status: 429, .. }))
        ));
        assert_eq!(*http.calls.lock().expect("lock"), 3);
        assert_eq!(ctx.scopes().session.get("status"), Some(&json!(429)));
    }

    #[tokio::test]
    async fn http_client_errors_are_not_retried() {
        let http = Arc::new(ScriptedHttp {
            replies: vec![HttpReply { status: 404, body: "missing".to_owned() }],
            calls: Mutex::new(0),
        });
        let gateways = Gateways::default().with_http(http.clone());
        let settings = retrying();
        let mut ctx = context("");
        let request = block(json!({"type": "http_request", "id": "h", "url": "https://api.test"}));

        let (outcome, _) = execute_with(&settings, &gateways, &[], &request, &mut ctx).await;
        assert!(matches!(
            outcome,
            Err(EngineError::ExternalCall(ExternalCallError::Status { status: 404, .. }))
        ));
        assert_eq!(*http.calls.lock().expect("lock"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn http_calls_are_bounded_by_the_block_timeout() {
        let gateways = Gateways::default().with_http(Arc::new(SlowHttp));
        let mut ctx = context("");
        let request = block(json!({"type": "http_request", "id": "h", "url": "https://slow.test",
                                   "timeout_in_seconds": 2}));

        let (outcome, _) = execute(&gateways, &[], &request, &mut ctx).await;
        assert_eq!(
            outcome,
            Err(EngineError::ExternalCall(ExternalCallError::Timeout(Duration::from_secs(2))))
        );
    }

    #[tokio::test]
    async fn buttons_emit_choices_and_suspend() {
        let mut ctx = context("");
        let buttons = block(json!({"type": "buttons", "id": "b", "text": "Pick",
            "buttons": [{"title": "Yes", "target_node_id": "yes"},
                        {"title": "No", "target_node_id": "no"}],
            "invalid_node_id": "again"}));

        let (outcome, messages) = execute(&Gateways::default(), &[], &buttons, &mut ctx).await;
        match outcome {
            Ok(BlockOutcome::Suspend(AwaitedInput::Choice(set))) => {
                assert_eq!(set.options.len(), 2);
                assert_eq!(set.invalid_node_id.as_deref(), Some("again"));
                assert_eq!(set.select("no").and_then(|o| o.target_node_id.as_deref()), Some("no"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            messages,
            vec![OutboundMessage::Buttons {
                text: Some("Pick".to_owned()),
                buttons: vec!["Yes".to_owned(), "No".to_owned()]
            }]
        );
    }

    #[tokio::test]
    async fn dynamic_buttons_read_their_source_list() {
        let mut ctx = context("");
        ctx.set(
            WritableScope::Request,
            "slots",
            json!([{"title": "Monday", "value": "mon"}, "Tuesday"]),
        );
        let buttons = block(json!({"type": "dynamic_buttons", "id": "d",
            "source_variable_name": "request.slots", "result_variable_name": "slot",
            "target_node_id": "confirm"}));

        let (outcome, messages) = execute(&Gateways::default(), &[], &buttons, &mut ctx).await;
        match outcome {
            Ok(BlockOutcome::Suspend(AwaitedInput::Choice(set))) => {
                assert_eq!(set.result_variable_name.as_deref(), Some("slot"));
                assert_eq!(set.target_node_id.as_deref(), Some("confirm"));
                assert_eq!(set.select("monday").map(|o| o.value.clone()), Some(json!("mon")));
                assert_eq!(set.select("2").map(|o| o.value.clone()), Some(json!("Tuesday")));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(messages.len(), 1);

        let missing = block(json!({"type": "dynamic_buttons", "id": "d",
            "source_variable_name": "nothing", "result_variable_name": "slot"}));
        let (outcome, _) = execute(&Gateways::default(), &[], &missing, &mut ctx).await;
        assert!(matches!(outcome, Err(EngineError::ExpressionEvaluation(_))));
    }

    #[tokio::test]
    async fn extend_targets_resolve_entry_nodes() {
        let mut ctx = context("");
        let gateways = Gateways::default();

        let explicit = block(json!({"type": "extend", "id": "e", "scenario_id": "refunds",
                                    "node_id": "ask", "return_back": true}));
        assert_eq!(
            execute(&gateways, &[], &explicit, &mut ctx).await.0,
            Ok(BlockOutcome::Extend {
                scenario_slug: "refunds".to_owned(),
                node_id: "ask".to_owned(),
                return_back: true
            })
        );

        let manual = block(json!({"type": "extend", "id": "e", "scenario_id": "faq"}));
        assert_eq!(
            execute(&gateways, &[], &manual, &mut ctx).await.0,
            Ok(BlockOutcome::Extend {
                scenario_slug: "faq".to_owned(),
                node_id: "answers".to_owned(),
                return_back: false
            })
        );

        let dangling = block(json!({"type": "extend", "id": "e", "scenario_id": "nope"}));
        assert!(matches!(
            execute(&gateways, &[], &dangling, &mut ctx).await.0,
            Err(EngineError::ConfigReference(_))
        ));
    }

    #[tokio::test]
    async fn match_extend_continues_when_nothing_matches() {
        let gateways = Gateways::default();
        let match_extend = block(json!({"type": "match_extend", "id": "m",
                                        "scenario_ids": ["refunds", "faq"], "return_back": true}));

        let mut ctx = context("I need a refund");
        match execute(&gateways, &[], &match_extend, &mut ctx).await.0 {
            Ok(BlockOutcome::Extend { scenario_slug, node_id, return_back }) => {
                assert_eq!((scenario_slug.as_str(), node_id.as_str()), ("refunds", "ask"));
                assert!(return_back);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let mut ctx = context("weather?");
        assert_eq!(
            execute(&gateways, &[], &match_extend, &mut ctx).await.0,
            Ok(BlockOutcome::Continue)
        );
    }

    #[tokio::test]
    async fn llm_blocks_use_history_and_store_results() {
        let llm = Arc::new(EchoLlm { seen: Mutex::new(Vec::new()) });
        let gateways = Gateways::default().with_llm(llm.clone());
        let history = vec![
            HistoryEntry { role: HistoryRole::User, text: "old question".to_owned() },
            HistoryEntry { role: HistoryRole::Bot, text: "old answer".to_owned() },
            HistoryEntry { role: HistoryRole::User, text: "recent question".to_owned() },
        ];
        let mut ctx = context("what now?");
        let llm_block = block(json!({"type": "llm", "id": "l", "system_message": "be brief",
            "user_message": "{{ system.last_user_message }}", "history_depth": 2,
            "model": {"model_name": "small", "temperature": 0.2},
            "result_variable_name": "reply", "emit_answer": true}));

        let (outcome, messages) = execute(&gateways, &history, &llm_block, &mut ctx).await;
        assert_eq!(outcome, Ok(BlockOutcome::Continue));
        assert_eq!(messages, vec![OutboundMessage::text("echo: what now?")]);
        assert_eq!(ctx.scopes().session.get("reply"), Some(&json!("echo: what now?")));

        let seen = llm.seen.lock().expect("lock");
        let contents: Vec<&str> = seen[0].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["be brief", "old answer", "recent question", "what now?"]);
        assert_eq!(seen[0].model.as_deref(), Some("small"));
    }

    #[tokio::test]
    async fn llm_calls_follow_the_engine_retry_policy() {
        let llm = Arc::new(OverloadedLlm { calls: Mutex::new(0) });
        let gateways = Gateways::default().with_llm(llm.clone());
        let mut ctx = context("hi");
        let llm_block = block(json!({"type": "llm", "id": "l", "system_message": "x"}));

        let (outcome, _) = execute_with(&retrying(), &gateways, &[], &llm_block, &mut ctx).await;
        assert!(matches!(
            outcome,
            Err(EngineError::ExternalCall(ExternalCallError::Status { status: 503, .. }))
        ));
        assert_eq!(*llm.calls.lock().expect("lock"), 3);
    }

    #[tokio::test]
    async fn llm_without_configured_client_fails() {
        let mut ctx = context("hi");
        let llm_block = block(json!({"type": "llm", "id": "l", "system_message": "x"}));
        let (outcome, _) = execute(&Gateways::default(), &[], &llm_block, &mut ctx).await;
        assert!(matches!(
            outcome,
            Err(EngineError::ExternalCall(ExternalCallError::NotConfigured(_)))
        ));
    }

    #[tokio::test]
    async fn close_and_operator_are_terminal() {
        let mut ctx = context("");
        let gateways = Gateways::default();
        assert_eq!(
            execute(&gateways, &[], &block(json!({"type": "close", "id": "c"})), &mut ctx).await.0,
            Ok(BlockOutcome::Close)
        );

        let operator =
            block(json!({"type": "go_operator", "id": "o", "metadata": {"queue": "vip"}}));
        let (outcome, messages) = execute(&gateways, &[], &operator, &mut ctx).await;
        assert!(matches!(outcome, Ok(BlockOutcome::Handoff(_))));
        assert!(matches!(messages[0], OutboundMessage::OperatorHandoff { .. }));
    }
}
