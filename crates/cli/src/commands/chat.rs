use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use convoflow_agent::{build_gateways, ToolRegistry};
use convoflow_core::config::{AppConfig, LoadOptions};
use convoflow_core::session::SessionStore;
use convoflow_core::{
    CoverageTracker, DialogRuntime, DialogStatus, InboundTurn, OutboundMessage, Solution,
};
use convoflow_db::{connect_from_config, migrations, InMemorySessionStore, SqlSessionStore};
use tracing::warn;

use crate::commands::validate::load_failure;
use crate::commands::CommandResult;

const CHANNEL_ID: &str = "cli";

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub solution: PathBuf,
    pub session: Option<String>,
    pub persist: bool,
    pub load: LoadOptions,
}

pub fn run(options: ChatOptions) -> CommandResult {
    let config = match AppConfig::load(options.load.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    let solution = match Solution::load_checked(&options.solution) {
        Ok(solution) => solution,
        Err(error) => return load_failure("chat", &error),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let session_id =
        options.session.clone().unwrap_or_else(|| format!("cli-{}", std::process::id()));

    let result = runtime.block_on(async {
        let store: Arc<dyn SessionStore> = if options.persist {
            let pool = connect_from_config(&config.database)
                .await
                .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
            migrations::run_pending(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
            Arc::new(SqlSessionStore::new(pool))
        } else {
            Arc::new(InMemorySessionStore::new())
        };
        let gateways = build_gateways(&config, ToolRegistry::default())
            .map_err(|error| ("gateway_init", error.to_string(), 6u8))?;
        let dialog = DialogRuntime::new(solution, store)
            .with_gateways(gateways)
            .with_settings(config.engine.clone());

        let stdin = io::stdin();
        let stdout = io::stdout();
        let turns = converse(&dialog, &session_id, stdin.lock(), &mut stdout.lock())
            .await
            .map_err(|error| ("chat_io", format!("{error:#}"), 7u8))?;
        Ok::<usize, (&'static str, String, u8)>(turns)
    });

    match result {
        Ok(_) => CommandResult::streamed(0),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chat", error_class, message, exit_code)
        }
    }
}

/// Feeds input lines to the runtime as turns and writes the bot replies.
///
/// `/event NAME` sends an event instead of a message, `/debug` toggles the visited-path trace,
/// `/coverage` prints which blocks the conversation has reached so far, and `/quit` ends it.
/// Returns the number of turns processed.
pub async fn converse<R, W>(
    runtime: &DialogRuntime,
    session_id: &str,
    input: R,
    output: &mut W,
) -> Result<usize>
where
    R: BufRead,
    W: Write,
{
    let mut turns = 0;
    let mut debug = false;
    let mut coverage = CoverageTracker::new();

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        if line == "/debug" {
            debug = !debug;
            writeln!(output, "-- debug trace {}", if debug { "on" } else { "off" })?;
            continue;
        }
        if line == "/coverage" {
            let report = coverage.report(runtime.solution());
            writeln!(
                output,
                "-- coverage: {}/{} blocks ({}%), {}/{} nodes",
                report.visited_blocks,
                report.total_blocks,
                report.coverage_percent,
                report.visited_nodes,
                report.total_nodes
            )?;
            if !report.unvisited_blocks.is_empty() {
                writeln!(output, "-- unvisited: {}", report.unvisited_blocks.join(", "))?;
            }
            continue;
        }

        // Traces are always collected for coverage; `/debug` only controls printing them.
        let turn = match line.strip_prefix("/event ") {
            Some(name) => InboundTurn::event(session_id, CHANNEL_ID, name.trim()),
            None => InboundTurn::message(session_id, CHANNEL_ID, line),
        }
        .with_debug();

        let reply = match runtime.handle_turn(turn).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(
                    event_name = "cli.chat.turn_failed",
                    session_id,
                    error = %error,
                    "turn failed"
                );
                writeln!(output, "!! {error}")?;
                continue;
            }
        };
        turns += 1;
        coverage.record(&reply.trace);

        for message in &reply.messages {
            match message {
                OutboundMessage::Text { text, .. } => writeln!(output, "bot> {text}")?,
                OutboundMessage::Buttons { text, buttons } => {
                    if let Some(text) = text {
                        writeln!(output, "bot> {text}")?;
                    }
                    let rendered =
                        buttons.iter().map(|title| format!("[{title}]")).collect::<Vec<_>>();
                    writeln!(output, "     {}", rendered.join(" "))?;
                }
                OutboundMessage::OperatorHandoff { .. } => {
                    writeln!(output, "bot> (conversation handed over to an operator)")?
                }
            }
        }
        for failure in &reply.errors {
            writeln!(output, "!! {:?}: {}", failure.kind, failure.message)?;
        }
        if debug && !reply.trace.is_empty() {
            let path = reply
                .trace
                .iter()
                .map(|step| format!("{}/{}:{}", step.scenario_slug, step.node_id, step.block_id))
                .collect::<Vec<_>>();
            writeln!(output, "-- trace: {}", path.join(" -> "))?;
        }
        if reply.status == DialogStatus::Closed {
            writeln!(output, "-- dialog closed")?;
        }
    }

    output.flush()?;
    Ok(turns)
}
