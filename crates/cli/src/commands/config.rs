use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use convoflow_core::config::{AppConfig, LoadOptions};
use serde_json::{json, Value as JsonValue};
use toml::Value;

use crate::commands::CommandResult;

pub fn run(options: LoadOptions) -> CommandResult {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str| {
        field_source(key_path, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let servers = config
        .mcp
        .servers
        .iter()
        .map(|server| format!("{}={}", server.name, server.url))
        .collect::<Vec<_>>()
        .join(", ");

    let fields: Vec<(&str, String)> = vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("llm.provider", format!("{:?}", config.llm.provider)),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("llm.api_key", llm_api_key.to_string()),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("engine.http_timeout_secs", config.engine.http_timeout_secs.to_string()),
        ("engine.max_transitions_per_turn", config.engine.max_transitions_per_turn.to_string()),
        ("engine.history_limit", config.engine.history_limit.to_string()),
        ("engine.agent_max_steps", config.engine.agent_max_steps.to_string()),
        ("engine.max_retries", config.engine.max_retries.to_string()),
        ("engine.retry_backoff_ms", config.engine.retry_backoff_ms.to_string()),
        ("mcp.servers", if servers.is_empty() { "<none>".to_string() } else { servers }),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ];

    let rendered = fields
        .into_iter()
        .map(|(key, value)| json!({"key": key, "value": value, "source": source(key)}))
        .collect::<Vec<JsonValue>>();

    CommandResult::success_with_details(
        "config",
        "effective config (source precedence: env > file > default)",
        Some(json!({ "fields": rendered })),
    )
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("convoflow.toml"), PathBuf::from("config/convoflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

/// `database.url` maps to `CONVOFLOW_DATABASE_URL`; `mcp.servers` has no env override.
fn env_key(key_path: &str) -> Option<String> {
    if key_path.starts_with("mcp.") {
        return None;
    }
    Some(format!("CONVOFLOW_{}", key_path.replace('.', "_").to_ascii_uppercase()))
}

fn field_source(
    key_path: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key(key_path) {
        if env::var_os(&env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
