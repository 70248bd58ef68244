//! The turn pipeline: lock, load, preprocess, activate or resume, interpret, save.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::activation::{ActivationResolver, Resolution, Signal};
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, NoopAuditSink};
use crate::config::EngineConfig;
use crate::context::VariableContext;
use crate::domain::session::{HistoryRole, SessionState, SuspendedPosition};
use crate::domain::solution::{PreprocessingMode, Solution};
use crate::domain::turn::{
    ActivationTrace, DialogStatus, FailureKind, InboundTurn, NluResult, OutboundMessage,
    ScoredLabel, TraceStep, TurnFailure, TurnInput, TurnOutput,
};
use crate::errors::{EngineError, RuntimeError};
use crate::flows::engine::{Interpreter, RunMode, RunOutcome, RunResult};
use crate::flows::executor::ExecutionEnv;
use crate::flows::gateway::Gateways;
use crate::flows::states::Position;
use crate::session::{SessionLocks, SessionStore};

const AUDIT_ACTOR: &str = "convoflow-runtime";

/// Accumulates everything a turn emits before it is turned into a `TurnOutput`.
#[derive(Default)]
struct TurnLog {
    messages: Vec<OutboundMessage>,
    errors: Vec<TurnFailure>,
    trace: Vec<TraceStep>,
    activation: Option<ActivationTrace>,
}

impl TurnLog {
    fn absorb(&mut self, run: &mut RunResult) {
        self.errors.append(&mut run.errors);
        self.trace.append(&mut run.trace);
    }
}

/// How a turn ended, before persistence.
enum Settled {
    /// Save the updated state.
    Persist,
    /// Leave the stored session exactly as it was.
    Discard(DialogStatus),
}

pub struct DialogRuntime {
    solution: Arc<Solution>,
    store: Arc<dyn SessionStore>,
    gateways: Gateways,
    settings: EngineConfig,
    audit: Arc<dyn AuditSink>,
    locks: SessionLocks,
}

impl DialogRuntime {
    pub fn new(solution: Solution, store: Arc<dyn SessionStore>) -> Self {
        Self {
            solution: Arc::new(solution),
            store,
            gateways: Gateways::default(),
            settings: EngineConfig::default(),
            audit: Arc::new(NoopAuditSink),
            locks: SessionLocks::new(),
        }
    }

    pub fn with_gateways(mut self, gateways: Gateways) -> Self {
        self.gateways = gateways;
        self
    }

    pub fn with_settings(mut self, settings: EngineConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn solution(&self) -> &Solution {
        &self.solution
    }

    /// Processes one inbound turn. Turns for the same session never overlap: a turn arriving
    /// while another is in flight fails with `SessionBusy`.
    pub async fn handle_turn(&self, turn: InboundTurn) -> Result<TurnOutput, RuntimeError> {
        let correlation_id = Uuid::new_v4().to_string();
        let _guard = self.locks.try_acquire(&turn.session_id)?;
        let audit = AuditContext::new(
            turn.session_id.clone(),
            turn.channel_id.clone(),
            correlation_id.clone(),
            AUDIT_ACTOR,
        );

        let budget = Duration::from_secs(self.solution.request_ttl_in_seconds);
        let deadline = Instant::now() + budget;
        match timeout(budget, self.process(&turn, &audit, deadline)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event_name = "engine.turn.budget_exceeded",
                    session_id = %turn.session_id,
                    correlation_id = %correlation_id,
                    budget_secs = budget.as_secs(),
                    "turn exceeded its time budget; stored session left untouched"
                );
                self.audit.emit(
                    audit
                        .event("turn.failed", AuditCategory::Turn, AuditOutcome::Failed)
                        .with_metadata("failure_kind", "budget_exceeded"),
                );
                Ok(self.budget_exceeded(&turn, correlation_id, budget))
            }
        }
    }

    async fn process(
        &self,
        turn: &InboundTurn,
        audit: &AuditContext,
        deadline: Instant,
    ) -> Result<TurnOutput, RuntimeError> {
        let mut state = self.store.load(&turn.session_id).await?.unwrap_or_default();
        let mut context = VariableContext::for_turn(&self.solution, turn, &state);
        let nlu = self.nlu_for(turn).await;
        context.set_nlu(nlu_scope(&nlu, &[]));

        let history = state.history.clone();
        let env = ExecutionEnv {
            solution: &self.solution,
            gateways: &self.gateways,
            settings: &self.settings,
            nlu: &nlu,
            history: &history,
            deadline,
        };
        let mut log = TurnLog::default();

        let settled = if self.preprocess(&env, turn, &mut context, &mut log).await {
            self.dispatch(&env, turn, &mut state, &mut context, &mut log, audit).await
        } else {
            self.push_stub(&mut log.messages);
            Settled::Discard(DialogStatus::Closed)
        };

        let status = match settled {
            Settled::Persist => {
                context.end_cycle();
                state.scopes = context.into_scopes();
                state.messages_number += 1;
                self.record_history(turn, &log.messages, &mut state);
                self.store.save(&turn.session_id, &state).await?;
                if state.is_suspended() {
                    DialogStatus::Suspended
                } else {
                    DialogStatus::Closed
                }
            }
            Settled::Discard(status) => status,
        };

        self.emit_turn_audit(audit, status, &log.errors);
        info!(
            event_name = "engine.turn.completed",
            session_id = %turn.session_id,
            correlation_id = %audit.correlation_id,
            status = ?status,
            messages = log.messages.len(),
            errors = log.errors.len(),
            "turn processed"
        );

        Ok(TurnOutput {
            session_id: turn.session_id.clone(),
            correlation_id: audit.correlation_id.clone(),
            messages: log.messages,
            status,
            activation: log.activation,
            errors: log.errors,
            trace: log.trace,
        })
    }

    /// Runs the preprocessing scenario. Returns `false` when the turn must stop here.
    async fn preprocess(
        &self,
        env: &ExecutionEnv<'_>,
        turn: &InboundTurn,
        context: &mut VariableContext,
        log: &mut TurnLog,
    ) -> bool {
        let optional = self.solution.preprocessing_mode == PreprocessingMode::Optional;
        let start = self.solution.preprocessing().and_then(|scenario| match scenario {
            None => Ok(None),
            Some(scenario) => scenario
                .entry_node_id()
                .map(|node_id| Some(Position::node_start(scenario.slug.clone(), node_id)))
                .ok_or_else(|| {
                    EngineError::ConfigReference(format!(
                        "preprocessing scenario `{}` has no nodes",
                        scenario.slug
                    ))
                }),
        });
        let from = match start {
            Ok(Some(from)) => from,
            Ok(None) => return true,
            Err(error) => {
                log.errors.push(TurnFailure {
                    kind: error.kind(),
                    message: error.to_string(),
                    scenario_slug: self.solution.preprocessing_scenario.clone(),
                    node_id: None,
                    block_id: None,
                    recovered: optional,
                });
                return preprocessing_failed(turn, &error, optional);
            }
        };

        let mut result = Interpreter::new(env)
            .with_mode(RunMode::Preprocessing)
            .with_trace(turn.debug)
            .run(from, Vec::new(), context, &mut log.messages)
            .await;

        if optional {
            for failure in &mut result.errors {
                failure.recovered = true;
            }
        }
        log.absorb(&mut result);

        match result.outcome {
            RunOutcome::Failed(error) => preprocessing_failed(turn, &error, optional),
            RunOutcome::Suspended(_) | RunOutcome::Closed => true,
        }
    }

    /// Resumes a suspended dialog or activates a new entry point, then applies the run result.
    async fn dispatch(
        &self,
        env: &ExecutionEnv<'_>,
        turn: &InboundTurn,
        state: &mut SessionState,
        context: &mut VariableContext,
        log: &mut TurnLog,
        audit: &AuditContext,
    ) -> Settled {
        let interpreter = Interpreter::new(env).with_trace(turn.debug);

        if let (Some(suspended), TurnInput::Message(reply)) =
            (state.suspended_position.clone(), &turn.input)
        {
            let resumed =
                interpreter.resume_point(&suspended, &state.scenario_stack, reply, context);
            return match resumed {
                Ok(from) => {
                    log.activation = Some(ActivationTrace {
                        scenario_slug: Some(from.scenario_slug.clone()),
                        node_id: Some(from.node_id.clone()),
                        edge_id: None,
                        score: 1.0,
                        no_match: false,
                        resumed: true,
                    });
                    let stack = std::mem::take(&mut state.scenario_stack);
                    let run = interpreter.run(from, stack, context, &mut log.messages).await;
                    self.apply(run, state, log, audit);
                    Settled::Persist
                }
                Err(error) => {
                    self.suspension_mismatch(error, &suspended, state, log, audit);
                    Settled::Persist
                }
            };
        }

        let signal = Signal::for_turn(turn, state, &self.solution);
        let resolution = ActivationResolver::new(&self.solution).resolve(
            &signal,
            env.nlu,
            state.active_scenario.as_deref(),
        );
        log.activation = Some(resolution.trace());

        let entry = match resolution {
            Resolution::Matched(entry) => entry,
            Resolution::NoMatch(_) if state.is_suspended() => {
                info!(
                    event_name = "engine.event.ignored",
                    session_id = %turn.session_id,
                    event = turn.event_name().unwrap_or(""),
                    "event matched no entry edge; suspended dialog left in place"
                );
                return Settled::Discard(DialogStatus::Suspended);
            }
            Resolution::NoMatch(Some(entry)) => entry,
            Resolution::NoMatch(None) => {
                self.push_stub(&mut log.messages);
                clear_position(state);
                return Settled::Persist;
            }
        };

        context.set_nlu(nlu_scope(env.nlu, &entry.captures));
        clear_position(state);
        let from = Position::node_start(entry.scenario_slug, entry.node_id);
        let run = interpreter.run(from, Vec::new(), context, &mut log.messages).await;
        self.apply(run, state, log, audit);
        Settled::Persist
    }

    fn apply(
        &self,
        mut run: RunResult,
        state: &mut SessionState,
        log: &mut TurnLog,
        audit: &AuditContext,
    ) {
        for failure in &run.errors {
            let outcome =
                if failure.recovered { AuditOutcome::Recovered } else { AuditOutcome::Failed };
            self.audit.emit(
                audit
                    .event("block.failed", AuditCategory::Block, outcome)
                    .with_metadata("failure_kind", format!("{:?}", failure.kind))
                    .with_metadata("block_id", failure.block_id.clone().unwrap_or_default())
                    .with_metadata("message", failure.message.clone()),
            );
        }
        log.absorb(&mut run);

        match run.outcome {
            RunOutcome::Suspended(position) => {
                state.suspended_position = Some(position);
                state.scenario_stack = run.stack;
                state.active_scenario = run.active_scenario;
            }
            RunOutcome::Closed => {
                clear_position(state);
                state.active_scenario = run.active_scenario;
            }
            RunOutcome::Failed(_) => {
                self.push_stub(&mut log.messages);
                clear_position(state);
            }
        }
    }

    fn suspension_mismatch(
        &self,
        error: EngineError,
        suspended: &SuspendedPosition,
        state: &mut SessionState,
        log: &mut TurnLog,
        audit: &AuditContext,
    ) {
        warn!(
            event_name = "engine.session.suspension_mismatch",
            session_id = %audit.session_id,
            correlation_id = %audit.correlation_id,
            scenario = %suspended.scenario_slug,
            node_id = %suspended.node_id,
            block_id = %suspended.block_id,
            error = %error,
            "stored suspension no longer matches the solution; closing dialog"
        );
        self.audit.emit(
            audit
                .event("session.suspension_mismatch", AuditCategory::Session, AuditOutcome::Failed)
                .with_metadata("scenario", suspended.scenario_slug.clone())
                .with_metadata("node_id", suspended.node_id.clone())
                .with_metadata("block_id", suspended.block_id.clone()),
        );
        log.errors.push(TurnFailure {
            kind: error.kind(),
            message: error.to_string(),
            scenario_slug: Some(suspended.scenario_slug.clone()),
            node_id: Some(suspended.node_id.clone()),
            block_id: Some(suspended.block_id.clone()),
            recovered: false,
        });
        self.push_stub(&mut log.messages);
        clear_position(state);
    }

    async fn nlu_for(&self, turn: &InboundTurn) -> NluResult {
        if let Some(nlu) = &turn.nlu {
            return nlu.clone();
        }
        let Some(text) = turn.message_text().filter(|text| !text.trim().is_empty()) else {
            return NluResult::default();
        };
        match self.gateways.nlu.classify(text).await {
            Ok(nlu) => nlu,
            Err(error) => {
                warn!(
                    event_name = "engine.nlu.failed",
                    session_id = %turn.session_id,
                    error = %error,
                    "classifier failed; continuing without intents"
                );
                NluResult::default()
            }
        }
    }

    fn record_history(
        &self,
        turn: &InboundTurn,
        messages: &[OutboundMessage],
        state: &mut SessionState,
    ) {
        let limit = self.settings.history_limit;
        if let Some(text) = turn.message_text() {
            state.push_history(HistoryRole::User, text, limit);
        }
        for message in messages {
            match message {
                OutboundMessage::Text { text, .. } => {
                    state.push_history(HistoryRole::Bot, text.clone(), limit);
                }
                OutboundMessage::Buttons { text: Some(text), .. } => {
                    state.push_history(HistoryRole::Bot, text.clone(), limit);
                }
                _ => {}
            }
        }
    }

    fn push_stub(&self, messages: &mut Vec<OutboundMessage>) {
        let stub = self.solution.no_match_stub_answer.trim();
        if !stub.is_empty() {
            messages.push(OutboundMessage::text(stub));
        }
    }

    fn emit_turn_audit(&self, audit: &AuditContext, status: DialogStatus, errors: &[TurnFailure]) {
        let (event_type, outcome) = if errors.iter().any(|failure| !failure.recovered) {
            ("turn.failed", AuditOutcome::Failed)
        } else if errors.is_empty() {
            ("turn.completed", AuditOutcome::Success)
        } else {
            ("turn.completed", AuditOutcome::Recovered)
        };
        self.audit.emit(
            audit
                .event(event_type, AuditCategory::Turn, outcome)
                .with_metadata("status", format!("{status:?}").to_lowercase())
                .with_metadata("errors", errors.len().to_string()),
        );
    }

    fn budget_exceeded(
        &self,
        turn: &InboundTurn,
        correlation_id: String,
        budget: Duration,
    ) -> TurnOutput {
        let mut messages = Vec::new();
        self.push_stub(&mut messages);
        TurnOutput {
            session_id: turn.session_id.clone(),
            correlation_id,
            messages,
            status: DialogStatus::Closed,
            activation: None,
            errors: vec![TurnFailure {
                kind: FailureKind::BudgetExceeded,
                message: format!("turn exceeded its budget of {}s", budget.as_secs()),
                scenario_slug: None,
                node_id: None,
                block_id: None,
                recovered: false,
            }],
            trace: Vec::new(),
        }
    }
}

/// Logs a preprocessing failure. The turn goes on only in optional mode.
fn preprocessing_failed(turn: &InboundTurn, error: &EngineError, optional: bool) -> bool {
    warn!(
        event_name = "engine.preprocessing.failed",
        session_id = %turn.session_id,
        optional,
        error_class = error.class(),
        error = %error,
        "preprocessing scenario failed"
    );
    optional
}

/// Drops the suspension and return frames. The active scenario stays for nesting precedence.
fn clear_position(state: &mut SessionState) {
    state.suspended_position = None;
    state.scenario_stack.clear();
}

/// Read-only `nlu` scope: classifier output plus capture groups of the winning `match` edge.
fn nlu_scope(nlu: &NluResult, captures: &[String]) -> Map<String, Value> {
    let labels = |labels: &[ScoredLabel]| {
        labels
            .iter()
            .map(|label| json!({"name": label.name, "confidence": label.confidence}))
            .collect::<Vec<_>>()
    };
    let mut scope = Map::new();
    scope.insert("intents".to_owned(), Value::Array(labels(&nlu.intents)));
    scope.insert("rules".to_owned(), Value::Array(labels(&nlu.rules)));
    scope.insert(
        "intent".to_owned(),
        nlu.intents
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map_or(Value::Null, |top| json!(top.name)),
    );
    scope.insert("matches".to_owned(), json!(captures));
    scope
}
