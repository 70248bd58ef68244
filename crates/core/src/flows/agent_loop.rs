use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ExternalCallError;
use crate::flows::gateway::{ChatMessage, ChatRequest, ChatRole, LlmClient, ToolProvider};
use crate::flows::retry::RetryPolicy;

/// Inputs of one think → call tool → observe loop.
pub struct AgentRun<'a> {
    pub llm: &'a dyn LlmClient,
    pub tools: &'a dyn ToolProvider,
    pub request: ChatRequest,
    pub allowlist: &'a [String],
    pub servers: &'a [String],
    pub max_steps: u32,
    pub retry: RetryPolicy,
    pub deadline: Instant,
}

impl AgentRun<'_> {
    /// Runs until the model answers without tool calls, or the step budget is spent.
    pub async fn run(self) -> Result<String, ExternalCallError> {
        let mut request = self.request;
        request.tools = self.tools.list_tools(self.allowlist, self.servers).await?;
        let known: Vec<String> = request.tools.iter().map(|tool| tool.name.clone()).collect();

        for step in 1..=self.max_steps {
            let response = self
                .retry
                .run(self.deadline, "agent", || self.llm.complete(request.clone()))
                .await?;

            if response.tool_calls.is_empty() {
                debug!(event_name = "engine.agent.finished", step, "agent produced a final answer");
                return Ok(response.content.unwrap_or_default());
            }

            let mut assistant =
                ChatMessage::new(ChatRole::Assistant, response.content.unwrap_or_default());
            assistant.tool_calls = response.tool_calls.clone();
            request.messages.push(assistant);

            for call in response.tool_calls {
                let observation = if !known.contains(&call.name) {
                    format!("error: tool `{}` is not available", call.name)
                } else {
                    match self.tools.call_tool(&call.name, call.arguments.clone()).await {
                        Ok(output) => output,
                        Err(error) => {
                            warn!(
                                event_name = "engine.agent.tool_failed",
                                tool = %call.name,
                                error = %error,
                                "tool call failed; reporting error to the model"
                            );
                            format!("error: {error}")
                        }
                    }
                };
                request.messages.push(ChatMessage::tool_result(call.id, observation));
            }
        }

        Err(ExternalCallError::StepBudgetExhausted(self.max_steps))
    }
}
