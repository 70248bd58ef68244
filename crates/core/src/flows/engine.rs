use tracing::{debug, warn};

use crate::context::VariableContext;
use crate::domain::block::{Block, WritableScope};
use crate::domain::session::{AwaitedInput, ScenarioFrame, SuspendedPosition};
use crate::domain::solution::{Node, Scenario};
use crate::domain::turn::{OutboundMessage, TraceStep, TurnFailure};
use crate::errors::EngineError;
use crate::flows::executor::{BlockExecutor, ExecutionEnv};
use crate::flows::states::{BlockOutcome, ExecutionState, Position};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Dialog,
    /// Runs the preprocessing scenario: suspending blocks are rejected and `close` keeps scopes.
    Preprocessing,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Suspended(SuspendedPosition),
    Closed,
    Failed(EngineError),
}

/// Result of walking the graph until a suspension or a terminal state.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub stack: Vec<ScenarioFrame>,
    /// Scenario the run stopped in: the suspension holder, or the one that closed the dialog.
    /// `None` after a failure.
    pub active_scenario: Option<String>,
    pub errors: Vec<TurnFailure>,
    pub trace: Vec<TraceStep>,
}

impl RunResult {
    pub fn is_suspended(&self) -> bool {
        matches!(self.outcome, RunOutcome::Suspended(_))
    }
}

/// Walks nodes block by block, following branches, `next_node_id` links and scenario frames.
pub struct Interpreter<'a> {
    env: &'a ExecutionEnv<'a>,
    mode: RunMode,
    trace: bool,
}

impl<'a> Interpreter<'a> {
    pub fn new(env: &'a ExecutionEnv<'a>) -> Self {
        Self { env, mode: RunMode::Dialog, trace: false }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Validates a stored suspension against the solution and picks the block to continue from.
    ///
    /// A choice reply is matched here; the selected value is written before execution resumes.
    pub fn resume_point(
        &self,
        suspended: &SuspendedPosition,
        stack: &[ScenarioFrame],
        reply: &str,
        context: &mut VariableContext,
    ) -> Result<Position, EngineError> {
        let (scenario, node) = self
            .locate(&suspended.scenario_slug, &suspended.node_id)
            .map_err(|error| EngineError::SuspensionMismatch(error.to_string()))?;
        let block = node.blocks.get(suspended.block_index).ok_or_else(|| {
            EngineError::SuspensionMismatch(format!(
                "node `{}` has no block at index {}",
                node.id, suspended.block_index
            ))
        })?;
        if block.id() != suspended.block_id {
            return Err(EngineError::SuspensionMismatch(format!(
                "block at `{}`[{}] is `{}`, expected `{}`",
                node.id,
                suspended.block_index,
                block.id(),
                suspended.block_id
            )));
        }
        let kind_matches = matches!(
            (&suspended.awaiting, block),
            (AwaitedInput::Message, Block::WaitForUser(_))
                | (AwaitedInput::Choice(_), Block::Buttons(_) | Block::DynamicButtons(_))
        );
        if !kind_matches {
            return Err(EngineError::SuspensionMismatch(format!(
                "block `{}` is now a `{}` block",
                block.id(),
                block.kind()
            )));
        }
        for frame in stack {
            let (_, frame_node) = self
                .locate(&frame.scenario_slug, &frame.node_id)
                .map_err(|error| EngineError::SuspensionMismatch(error.to_string()))?;
            if frame.block_index > frame_node.blocks.len() {
                return Err(EngineError::SuspensionMismatch(format!(
                    "return point `{}`[{}] is past the end of the node",
                    frame.node_id, frame.block_index
                )));
            }
        }

        let next = Position::new(scenario.slug.clone(), node.id.clone(), suspended.block_index + 1);
        let branch =
            |node_id: &String| Position::node_start(scenario.slug.clone(), node_id.clone());
        let AwaitedInput::Choice(choices) = &suspended.awaiting else {
            return Ok(next);
        };
        match choices.select(reply) {
            Some(option) => {
                if let Some(variable) = &choices.result_variable_name {
                    context.set(WritableScope::Session, variable.clone(), option.value.clone());
                }
                Ok(option
                    .target_node_id
                    .as_ref()
                    .or(choices.target_node_id.as_ref())
                    .map_or(next, branch))
            }
            None => {
                debug!(
                    event_name = "engine.choice.unmatched",
                    block_id = %suspended.block_id,
                    "reply did not match any offered choice"
                );
                Ok(choices.invalid_node_id.as_ref().map_or(next, branch))
            }
        }
    }

    /// Runs from `from` until a suspending block, a terminal block, or the end of the graph.
    pub async fn run(
        &self,
        from: Position,
        mut stack: Vec<ScenarioFrame>,
        context: &mut VariableContext,
        messages: &mut Vec<OutboundMessage>,
    ) -> RunResult {
        let executor = BlockExecutor::new(self.env);
        let mut position = from;
        let mut transitions = 0u32;
        let mut errors = Vec::new();
        let mut trace = Vec::new();

        loop {
            let (scenario, node) = match self.locate(&position.scenario_slug, &position.node_id) {
                Ok(found) => found,
                Err(error) => {
                    errors.push(failure(&error, &position, None, false));
                    return self.failed(error, errors, trace);
                }
            };

            let Some(block) = node.blocks.get(position.block_index) else {
                let next = match &node.next_node_id {
                    Some(next_node) => {
                        Position::node_start(scenario.slug.clone(), next_node.clone())
                    }
                    None => match stack.pop() {
                        Some(frame) => {
                            debug!(
                                event_name = "engine.scenario.returned",
                                scenario = %frame.scenario_slug,
                                node_id = %frame.node_id,
                                block_index = frame.block_index,
                                "returning to calling scenario"
                            );
                            Position::from(frame)
                        }
                        None => return self.closed(&scenario.slug, context, errors, trace),
                    },
                };
                if let Err(error) = self.charge(&mut transitions) {
                    errors.push(failure(&error, &position, None, false));
                    return self.failed(error, errors, trace);
                }
                position = next;
                continue;
            };

            let outcome = match self.execute(&executor, block, context, messages).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    let recover_to = block.error_target();
                    warn!(
                        event_name = "engine.block.failed",
                        scenario = %scenario.slug,
                        node_id = %node.id,
                        block_id = %block.id(),
                        error_class = error.class(),
                        recovered = recover_to.is_some(),
                        error = %error,
                        "block evaluation failed"
                    );
                    errors.push(failure(&error, &position, Some(block), recover_to.is_some()));
                    match recover_to {
                        Some(target) => BlockOutcome::Branch(target.to_owned()),
                        None => {
                            self.record(&mut trace, &position, block, ExecutionState::Closed);
                            return self.failed(error, errors, trace);
                        }
                    }
                }
            };
            self.record(&mut trace, &position, block, outcome.state());

            match outcome {
                BlockOutcome::Continue => position.block_index += 1,
                BlockOutcome::Branch(node_id) => {
                    if let Err(error) = self.charge(&mut transitions) {
                        errors.push(failure(&error, &position, Some(block), false));
                        return self.failed(error, errors, trace);
                    }
                    position = Position::node_start(scenario.slug.clone(), node_id);
                }
                BlockOutcome::Suspend(awaiting) => {
                    debug!(
                        event_name = "engine.dialog.suspended",
                        scenario = %scenario.slug,
                        node_id = %node.id,
                        block_index = position.block_index,
                        "waiting for user input"
                    );
                    return RunResult {
                        outcome: RunOutcome::Suspended(SuspendedPosition {
                            scenario_slug: position.scenario_slug,
                            node_id: position.node_id,
                            block_index: position.block_index,
                            block_id: block.id().to_owned(),
                            awaiting,
                        }),
                        stack,
                        active_scenario: Some(scenario.slug.clone()),
                        errors,
                        trace,
                    };
                }
                BlockOutcome::Extend { scenario_slug, node_id, return_back } => {
                    if let Err(error) = self.charge(&mut transitions) {
                        errors.push(failure(&error, &position, Some(block), false));
                        return self.failed(error, errors, trace);
                    }
                    debug!(
                        event_name = "engine.scenario.extended",
                        from = %scenario.slug,
                        to = %scenario_slug,
                        node_id = %node_id,
                        return_back,
                        "entering scenario"
                    );
                    if return_back {
                        stack.push(ScenarioFrame {
                            scenario_slug: position.scenario_slug.clone(),
                            node_id: position.node_id.clone(),
                            block_index: position.block_index + 1,
                        });
                    }
                    position = Position::node_start(scenario_slug, node_id);
                }
                BlockOutcome::Close | BlockOutcome::Handoff(_) => {
                    return self.closed(&scenario.slug, context, errors, trace);
                }
            }
        }
    }

    async fn execute(
        &self,
        executor: &BlockExecutor<'_>,
        block: &Block,
        context: &mut VariableContext,
        messages: &mut Vec<OutboundMessage>,
    ) -> Result<BlockOutcome, EngineError> {
        if self.mode == RunMode::Preprocessing && block.suspends() {
            return Err(EngineError::ConfigReference(format!(
                "preprocessing cannot suspend on `{}` block `{}`",
                block.kind(),
                block.id()
            )));
        }
        executor.execute(block, context, messages).await
    }

    fn record(
        &self,
        trace: &mut Vec<TraceStep>,
        position: &Position,
        block: &Block,
        state: ExecutionState,
    ) {
        if self.trace {
            trace.push(TraceStep {
                scenario_slug: position.scenario_slug.clone(),
                node_id: position.node_id.clone(),
                block_id: block.id().to_owned(),
                block_type: block.kind().to_owned(),
                state,
            });
        }
    }

    fn locate(
        &self,
        scenario_slug: &str,
        node_id: &str,
    ) -> Result<(&'a Scenario, &'a Node), EngineError> {
        let scenario = self.env.solution.scenario_by_slug(scenario_slug).ok_or_else(|| {
            EngineError::ConfigReference(format!("scenario `{scenario_slug}` does not exist"))
        })?;
        let node = scenario.node(node_id).ok_or_else(|| {
            EngineError::ConfigReference(format!(
                "node `{node_id}` does not exist in scenario `{scenario_slug}`"
            ))
        })?;
        Ok((scenario, node))
    }

    fn charge(&self, transitions: &mut u32) -> Result<(), EngineError> {
        *transitions += 1;
        let budget = self.env.settings.max_transitions_per_turn;
        if *transitions > budget {
            return Err(EngineError::ConfigReference(format!(
                "transition budget of {budget} exceeded; check for next_node_id cycles"
            )));
        }
        Ok(())
    }

    fn closed(
        &self,
        scenario_slug: &str,
        context: &mut VariableContext,
        errors: Vec<TurnFailure>,
        trace: Vec<TraceStep>,
    ) -> RunResult {
        if self.mode == RunMode::Dialog {
            context.clear_transient();
        }
        RunResult {
            outcome: RunOutcome::Closed,
            stack: Vec::new(),
            active_scenario: Some(scenario_slug.to_owned()),
            errors,
            trace,
        }
    }

    fn failed(
        &self,
        error: EngineError,
        errors: Vec<TurnFailure>,
        trace: Vec<TraceStep>,
    ) -> RunResult {
        RunResult {
            outcome: RunOutcome::Failed(error),
            stack: Vec::new(),
            active_scenario: None,
            errors,
            trace,
        }
    }
}

fn failure(
    error: &EngineError,
    position: &Position,
    block: Option<&Block>,
    recovered: bool,
) -> TurnFailure {
    TurnFailure {
        kind: error.kind(),
        message: error.to_string(),
        scenario_slug: Some(position.scenario_slug.clone()),
        node_id: Some(position.node_id.clone()),
        block_id: block.map(|block| block.id().to_owned()),
        recovered,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map, Value};
    use tokio::time::Instant;

    use super::{Interpreter, RunMode, RunOutcome, RunResult};
    use crate::config::EngineConfig;
    use crate::context::VariableContext;
    use crate::domain::block::WritableScope;
    use crate::domain::session::{AwaitedInput, ScenarioFrame, Scopes, SuspendedPosition};
    use crate::domain::solution::Solution;
    use crate::domain::turn::{ExecutionState, FailureKind, NluResult, OutboundMessage};
    use crate::errors::EngineError;
    use crate::flows::executor::ExecutionEnv;
    use crate::flows::gateway::Gateways;
    use crate::flows::states::Position;

    fn solution(value: Value) -> Solution {
        serde_json::from_value(value).expect("solution deserializes")
    }

    fn context(message: &str) -> VariableContext {
        let mut system = Map::new();
        system.insert("last_user_message".to_owned(), json!(message));
        VariableContext::new(system, Scopes::default())
    }

    fn settings() -> EngineConfig {
        EngineConfig { max_retries: 0, max_transitions_per_turn: 8, ..EngineConfig::default() }
    }

    async fn run_from(
        solution: &Solution,
        from: Position,
        stack: Vec<ScenarioFrame>,
        context: &mut VariableContext,
        mode: RunMode,
    ) -> (RunResult, Vec<OutboundMessage>) {
        let gateways = Gateways::default();
        let settings = settings();
        let nlu = NluResult::default();
        let env = ExecutionEnv {
            solution,
            gateways: &gateways,
            settings: &settings,
            nlu: &nlu,
            history: &[],
            deadline: Instant::now() + Duration::from_secs(30),
        };
        let mut messages = Vec::new();
        let result = Interpreter::new(&env)
            .with_mode(mode)
            .with_trace(true)
            .run(from, stack, context, &mut messages)
            .await;
        (result, messages)
    }

    async fn run_node(
        solution: &Solution,
        node_id: &str,
        context: &mut VariableContext,
    ) -> (RunResult, Vec<OutboundMessage>) {
        let from = Position::node_start("main", node_id);
        run_from(solution, from, Vec::new(), context, RunMode::Dialog).await
    }

    fn texts(messages: &[OutboundMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|message| match message {
                OutboundMessage::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn linear() -> Solution {
        solution(json!({
            "bot_name": "linear",
            "scenarios": [{"slug": "main", "nodes": [
                {"id": "welcome", "next_node_id": "ask", "blocks": [
                    {"type": "answer", "id": "hi", "text": "hi"}
                ]},
                {"id": "ask", "blocks": [
                    {"type": "answer", "id": "q", "text": "name?"},
                    {"type": "wait_for_user", "id": "wait"},
                    {"type": "answer", "id": "thanks", "text": "thanks {{ system.last_user_message }}"}
                ]}
            ]}]
        }))
    }

    #[tokio::test]
    async fn next_node_links_run_until_suspension() {
        let solution = linear();
        let mut ctx = context("");
        let (result, messages) = run_node(&solution, "welcome", &mut ctx).await;

        assert_eq!(texts(&messages), vec!["hi", "name?"]);
        match &result.outcome {
            RunOutcome::Suspended(position) => {
                assert_eq!((position.node_id.as_str(), position.block_index), ("ask", 1));
                assert_eq!(position.block_id, "wait");
                assert_eq!(position.awaiting, AwaitedInput::Message);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(result.active_scenario.as_deref(), Some("main"));
        assert_eq!(result.trace.len(), 3);
    }

    #[tokio::test]
    async fn resume_continues_after_the_suspending_block() {
        let solution = linear();
        let suspended = SuspendedPosition {
            scenario_slug: "main".to_owned(),
            node_id: "ask".to_owned(),
            block_index: 1,
            block_id: "wait".to_owned(),
            awaiting: AwaitedInput::Message,
        };
        let mut ctx = context("Ada");
        let gateways = Gateways::default();
        let settings = settings();
        let nlu = NluResult::default();
        let env = ExecutionEnv {
            solution: &solution,
            gateways: &gateways,
            settings: &settings,
            nlu: &nlu,
            history: &[],
            deadline: Instant::now() + Duration::from_secs(30),
        };
        let interpreter = Interpreter::new(&env);

        let from = interpreter.resume_point(&suspended, &[], "Ada", &mut ctx).expect("valid");
        assert_eq!(from, Position::new("main", "ask", 2));

        let mut messages = Vec::new();
        let result = interpreter.run(from, Vec::new(), &mut ctx, &mut messages).await;
        assert_eq!(result.outcome, RunOutcome::Closed);
        assert_eq!(texts(&messages), vec!["thanks Ada"]);

        let drifted = SuspendedPosition { block_id: "renamed".to_owned(), ..suspended.clone() };
        assert!(matches!(
            interpreter.resume_point(&drifted, &[], "Ada", &mut ctx),
            Err(EngineError::SuspensionMismatch(_))
        ));
        let gone = SuspendedPosition { node_id: "vanished".to_owned(), ..suspended };
        assert!(matches!(
            interpreter.resume_point(&gone, &[], "Ada", &mut ctx),
            Err(EngineError::SuspensionMismatch(_))
        ));
    }

    #[tokio::test]
    async fn extend_with_return_resumes_the_parent_at_the_saved_index() {
        let solution = solution(json!({
            "bot_name": "nested",
            "scenarios": [
                {"slug": "main", "nodes": [{"id": "start", "blocks": [
                    {"type": "answer", "id": "a1", "text": "before"},
                    {"type": "extend", "id": "x", "scenario_id": "child", "return_back": true},
                    {"type": "answer", "id": "a2", "text": "after"}
                ]}]},
                {"slug": "child", "nodes": [{"id": "c1", "blocks": [
                    {"type": "answer", "id": "c", "text": "inside"}
                ]}]}
            ]
        }));
        let mut ctx = context("");
        let (result, messages) = run_node(&solution, "start", &mut ctx).await;

        assert_eq!(texts(&messages), vec!["before", "inside", "after"]);
        assert_eq!(result.outcome, RunOutcome::Closed);
        assert!(result.stack.is_empty());
        assert_eq!(result.active_scenario.as_deref(), Some("main"));

        let states: Vec<(&str, ExecutionState)> =
            result.trace.iter().map(|step| (step.block_id.as_str(), step.state)).collect();
        assert_eq!(
            states,
            vec![
                ("a1", ExecutionState::Running),
                ("x", ExecutionState::Extending),
                ("c", ExecutionState::Running),
                ("a2", ExecutionState::Running),
            ]
        );
    }

    #[tokio::test]
    async fn extend_without_return_closes_in_the_child_scenario() {
        let solution = solution(json!({
            "bot_name": "handover",
            "scenarios": [
                {"slug": "main", "nodes": [{"id": "start", "blocks": [
                    {"type": "extend", "id": "x", "scenario_id": "child"},
                    {"type": "answer", "id": "never", "text": "skipped"}
                ]}]},
                {"slug": "child", "nodes": [{"id": "c1", "blocks": [
                    {"type": "answer", "id": "c", "text": "inside"},
                    {"type": "close", "id": "bye"}
                ]}]}
            ]
        }));
        let mut ctx = context("");
        let (result, messages) = run_node(&solution, "start", &mut ctx).await;

        assert_eq!(texts(&messages), vec!["inside"]);
        assert_eq!(result.outcome, RunOutcome::Closed);
        assert_eq!(result.active_scenario.as_deref(), Some("child"));
        assert_eq!(result.trace.last().map(|step| step.state), Some(ExecutionState::Closed));
    }

    #[tokio::test]
    async fn plain_nodes_give_identical_results_from_identical_contexts() {
        let solution = solution(json!({
            "bot_name": "pure",
            "scenarios": [{"slug": "main", "nodes": [
                {"id": "calc", "blocks": [
                    {"type": "variables", "id": "v1", "name": "total", "value": "session.n * 2",
                     "variable_type": "python"},
                    {"type": "variables", "id": "v2", "name": "label", "value": "big",
                     "variable_type": "constant", "scope": "request"},
                    {"type": "answer", "id": "a1", "text": "total {{ session.total }}"},
                    {"type": "single_if", "id": "i", "expression": "session.total > 5",
                     "target_node_id": "large"}
                ]},
                {"id": "large", "blocks": [
                    {"type": "answer", "id": "a2", "text": "that is {{ request.label }}"}
                ]}
            ]}]
        }));
        let seeded = || {
            let mut ctx = context("same input");
            ctx.set(WritableScope::Session, "n", json!(4));
            ctx
        };

        let mut first_ctx = seeded();
        let (first, first_messages) = run_node(&solution, "calc", &mut first_ctx).await;
        let mut second_ctx = seeded();
        let (second, second_messages) = run_node(&solution, "calc", &mut second_ctx).await;

        assert_eq!(texts(&first_messages), vec!["total 8", "that is big"]);
        assert_eq!(first_messages, second_messages);
        assert_eq!(first, second);
        assert_eq!(first_ctx.scopes(), second_ctx.scopes());
        assert_eq!(first_ctx.scopes().session.get("total"), Some(&json!(8)));
    }

    #[tokio::test]
    async fn suspension_inside_a_child_keeps_the_return_frame() {
        let solution = solution(json!({
            "bot_name": "nested",
            "scenarios": [
                {"slug": "main", "nodes": [{"id": "start", "blocks": [
                    {"type": "extend", "id": "x", "scenario_id": "child", "return_back": true},
                    {"type": "answer", "id": "a2", "text": "after"}
                ]}]},
                {"slug": "child", "nodes": [{"id": "c1", "blocks": [
                    {"type": "wait_for_user", "id": "w"}
                ]}]}
            ]
        }));
        let mut ctx = context("");
        let (result, _) = run_node(&solution, "start", &mut ctx).await;

        assert!(result.is_suspended());
        assert_eq!(result.active_scenario.as_deref(), Some("child"));
        assert_eq!(
            result.stack,
            vec![ScenarioFrame {
                scenario_slug: "main".to_owned(),
                node_id: "start".to_owned(),
                block_index: 1
            }]
        );
    }

    #[tokio::test]
    async fn false_single_if_falls_through_to_close() {
        let solution = solution(json!({
            "bot_name": "if",
            "scenarios": [{"slug": "main", "nodes": [
                {"id": "n1", "blocks": [
                    {"type": "single_if", "id": "never", "expression": "1 == 2", "target_node_id": "n2"}
                ]},
                {"id": "n2", "blocks": [{"type": "answer", "id": "a", "text": "visited"}]}
            ]}]
        }));
        let mut ctx = context("");
        let (result, messages) = run_node(&solution, "n1", &mut ctx).await;

        assert_eq!(result.outcome, RunOutcome::Closed);
        assert!(messages.is_empty());
        assert!(result.trace.iter().all(|step| step.node_id == "n1"));
    }

    #[tokio::test]
    async fn node_cycles_exhaust_the_transition_budget() {
        let solution = solution(json!({
            "bot_name": "loop",
            "scenarios": [{"slug": "main", "nodes": [
                {"id": "a", "next_node_id": "b", "blocks": []},
                {"id": "b", "next_node_id": "a", "blocks": []}
            ]}]
        }));
        let mut ctx = context("");
        let (result, _) = run_node(&solution, "a", &mut ctx).await;

        assert!(matches!(result.outcome, RunOutcome::Failed(EngineError::ConfigReference(_))));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, FailureKind::ConfigReference);
    }

    #[tokio::test]
    async fn block_errors_branch_to_declared_error_targets() {
        let solution = solution(json!({
            "bot_name": "errors",
            "scenarios": [{"slug": "main", "nodes": [
                {"id": "call", "blocks": [
                    {"type": "http_request", "id": "h", "url": "https://api.test",
                     "error_target_node_id": "sorry"},
                    {"type": "answer", "id": "ok", "text": "ok"}
                ]},
                {"id": "sorry", "blocks": [{"type": "answer", "id": "s", "text": "service down"}]},
                {"id": "broken", "blocks": [
                    {"type": "answer", "id": "b", "text": "{{ session.missing }}"}
                ]}
            ]}]
        }));

        let mut ctx = context("");
        let (result, messages) = run_node(&solution, "call", &mut ctx).await;
        assert_eq!(result.outcome, RunOutcome::Closed);
        assert_eq!(texts(&messages), vec!["service down"]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].recovered);
        assert_eq!(result.errors[0].block_id.as_deref(), Some("h"));

        let (result, _) = run_node(&solution, "broken", &mut ctx).await;
        assert!(matches!(result.outcome, RunOutcome::Failed(EngineError::ExpressionEvaluation(_))));
        assert!(!result.errors[0].recovered);
    }

    #[tokio::test]
    async fn close_discards_transient_scopes_and_remaining_blocks() {
        let solution = solution(json!({
            "bot_name": "close",
            "scenarios": [{"slug": "main", "nodes": [{"id": "n", "blocks": [
                {"type": "variables", "id": "v", "name": "tmp", "value": 1,
                 "variable_type": "constant", "scope": "request"},
                {"type": "close", "id": "c"},
                {"type": "answer", "id": "a", "text": "unreachable"}
            ]}]}]
        }));
        let mut ctx = context("");
        let (result, messages) = run_node(&solution, "n", &mut ctx).await;

        assert_eq!(result.outcome, RunOutcome::Closed);
        assert!(messages.is_empty());
        assert!(ctx.scopes().request.is_empty());
    }

    #[tokio::test]
    async fn choice_replies_write_values_and_branch() {
        let solution = solution(json!({
            "bot_name": "choice",
            "scenarios": [{"slug": "main", "nodes": [
                {"id": "menu", "blocks": [
                    {"type": "dynamic_buttons", "id": "pick", "source_variable_name": "slots",
                     "result_variable_name": "slot", "target_node_id": "confirm",
                     "invalid_node_id": "menu"}
                ]},
                {"id": "confirm", "blocks": [
                    {"type": "answer", "id": "c", "text": "booked {{ session.slot }}"}
                ]}
            ]}]
        }));
        let mut ctx = context("");
        ctx.set(WritableScope::Session, "slots", json!(["9am", "noon"]));
        let (first, _) = run_node(&solution, "menu", &mut ctx).await;
        let RunOutcome::Suspended(suspended) = first.outcome else {
            panic!("expected suspension");
        };

        let gateways = Gateways::default();
        let settings = settings();
        let nlu = NluResult::default();
        let env = ExecutionEnv {
            solution: &solution,
            gateways: &gateways,
            settings: &settings,
            nlu: &nlu,
            history: &[],
            deadline: Instant::now() + Duration::from_secs(30),
        };
        let interpreter = Interpreter::new(&env);

        let from = interpreter.resume_point(&suspended, &[], "NOON", &mut ctx).expect("valid");
        assert_eq!(from, Position::node_start("main", "confirm"));
        assert_eq!(ctx.scopes().session.get("slot"), Some(&json!("noon")));

        let retry = interpreter.resume_point(&suspended, &[], "midnight", &mut ctx).expect("valid");
        assert_eq!(retry, Position::node_start("main", "menu"));
    }

    #[tokio::test]
    async fn preprocessing_rejects_suspending_blocks() {
        let solution = solution(json!({
            "bot_name": "prep",
            "scenarios": [{"slug": "prep", "nodes": [{"id": "p", "blocks": [
                {"type": "variables", "id": "v", "name": "seen", "value": true,
                 "variable_type": "constant", "scope": "request"},
                {"type": "wait_for_user", "id": "w"}
            ]}]}]
        }));
        let mut ctx = context("");
        let (result, _) = run_from(
            &solution,
            Position::node_start("prep", "p"),
            Vec::new(),
            &mut ctx,
            RunMode::Preprocessing,
        )
        .await;

        assert!(matches!(result.outcome, RunOutcome::Failed(EngineError::ConfigReference(_))));
        assert_eq!(ctx.scopes().request.get("seen"), Some(&json!(true)));
    }
}
