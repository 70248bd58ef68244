pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use convoflow_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

use crate::commands::chat::ChatOptions;

#[derive(Debug, Parser)]
#[command(
    name = "convoflow",
    about = "Convoflow dialog engine CLI",
    long_about = "Validate and inspect scenario solutions, apply session-store migrations, and talk to a solution locally.",
    after_help = "Examples:\n  convoflow validate bot.json\n  convoflow summary bot.json\n  convoflow chat bot.json --persist"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file to load instead of convoflow.toml")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Load a solution and check that every reference resolves")]
    Validate { solution: PathBuf },
    #[command(about = "Print scenario, node, block and edge statistics for a solution")]
    Summary { solution: PathBuf },
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Apply pending session-store migrations")]
    Migrate,
    #[command(about = "Talk to a solution from the terminal, one line per turn")]
    Chat {
        solution: PathBuf,
        #[arg(long, help = "Session id to use (resumes a persisted dialog)")]
        session: Option<String>,
        #[arg(long, help = "Store session state in the configured SQLite database")]
        persist: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = load_options(cli.config);
    if let Ok(config) = AppConfig::load(options.clone()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Validate { solution } => commands::validate::run(&solution),
        Command::Summary { solution } => commands::summary::run(&solution),
        Command::Config => commands::config::run(options),
        Command::Migrate => commands::migrate::run(options),
        Command::Chat { solution, session, persist } => {
            commands::chat::run(ChatOptions { solution, session, persist, load: options })
        }
    };

    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    ExitCode::from(result.exit_code)
}

fn load_options(config_path: Option<PathBuf>) -> LoadOptions {
    let require_file = config_path.is_some();
    LoadOptions { config_path, require_file, ..LoadOptions::default() }
}

/// Logs go to stderr so command payloads on stdout stay machine-readable.
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
