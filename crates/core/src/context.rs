use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::domain::block::WritableScope;
use crate::domain::session::{Scopes, SessionState};
use crate::domain::solution::Solution;
use crate::domain::turn::InboundTurn;
use crate::errors::EngineError;

/// Every namespace visible to expressions and templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeName {
    System,
    Session,
    Request,
    Temp,
    Nlu,
}

impl ScopeName {
    pub fn writable(self) -> Option<WritableScope> {
        match self {
            Self::Session => Some(WritableScope::Session),
            Self::Request => Some(WritableScope::Request),
            Self::Temp => Some(WritableScope::Temp),
            Self::System | Self::Nlu => None,
        }
    }
}

impl FromStr for ScopeName {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            "request" => Ok(Self::Request),
            "temp" => Ok(Self::Temp),
            "nlu" => Ok(Self::Nlu),
            other => Err(EngineError::ExpressionEvaluation(format!("unknown scope `{other}`"))),
        }
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::Session => "session",
            Self::Request => "request",
            Self::Temp => "temp",
            Self::Nlu => "nlu",
        };
        f.write_str(name)
    }
}

/// Per-turn variable store handed by `&mut` into every block evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableContext {
    system: Map<String, Value>,
    nlu: Map<String, Value>,
    scopes: Scopes,
}

impl VariableContext {
    pub fn new(system: Map<String, Value>, scopes: Scopes) -> Self {
        Self { system, nlu: Map::new(), scopes }
    }

    /// Builds the turn context: `system` is rebuilt and `request` starts empty.
    pub fn for_turn(solution: &Solution, turn: &InboundTurn, state: &SessionState) -> Self {
        let mut system = Map::new();
        system.insert("session_id".to_owned(), json!(turn.session_id));
        system.insert("channel_id".to_owned(), json!(turn.channel_id));
        system.insert("bot_name".to_owned(), json!(solution.bot_name));
        system.insert("last_user_message".to_owned(), json!(turn.message_text().unwrap_or("")));
        system.insert("event_name".to_owned(), json!(turn.event_name()));
        system.insert("timestamp".to_owned(), json!(turn.timestamp.to_rfc3339()));
        system.insert("messages_number".to_owned(), json!(state.messages_number + 1));
        system.insert("is_first_turn".to_owned(), json!(state.is_fresh()));

        let mut context = Self::new(system, state.scopes.clone());
        context.scopes.request.clear();
        context
    }

    pub fn system(&self, name: &str) -> Option<&Value> {
        self.system.get(name)
    }

    pub fn last_user_message(&self) -> &str {
        self.system.get("last_user_message").and_then(Value::as_str).unwrap_or("")
    }

    pub fn get(&self, scope: ScopeName, name: &str) -> Option<&Value> {
        match scope {
            ScopeName::System => self.system.get(name),
            ScopeName::Nlu => self.nlu.get(name),
            ScopeName::Session => self.scopes.session.get(name),
            ScopeName::Request => self.scopes.request.get(name),
            ScopeName::Temp => self.scopes.temp.get(name),
        }
    }

    /// Looks up a dotted `scope.name` reference. Bare names search temp, then request, then
    /// session.
    pub fn lookup(&self, reference: &str) -> Option<&Value> {
        match reference.split_once('.') {
            Some((scope, name)) => {
                let scope = scope.parse::<ScopeName>().ok()?;
                self.get(scope, name)
            }
            None => self
                .scopes
                .temp
                .get(reference)
                .or_else(|| self.scopes.request.get(reference))
                .or_else(|| self.scopes.session.get(reference)),
        }
    }

    pub fn set(&mut self, scope: WritableScope, name: impl Into<String>, value: Value) {
        self.scopes.scope_mut(scope).insert(name.into(), value);
    }

    pub fn remove(&mut self, scope: WritableScope, name: &str) -> Option<Value> {
        self.scopes.scope_mut(scope).remove(name)
    }

    pub fn set_nlu(&mut self, nlu: Map<String, Value>) {
        self.nlu = nlu;
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// Drops per-cycle values.
    pub fn end_cycle(&mut self) {
        self.scopes.temp.clear();
    }

    /// Drops everything shorter-lived than `session`.
    pub fn clear_transient(&mut self) {
        self.scopes.request.clear();
        self.scopes.temp.clear();
    }

    pub fn into_scopes(self) -> Scopes {
        self.scopes
    }

    /// JSON object exposed to expressions and templates.
    pub fn to_value(&self) -> Value {
        json!({
            "system": self.system,
            "session": self.scopes.session,
            "request": self.scopes.request,
            "temp": self.scopes.temp,
            "nlu": self.nlu,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{ScopeName, VariableContext};
    use crate::domain::block::WritableScope;
    use crate::domain::session::{Scopes, SessionState};
    use crate::domain::solution::Solution;
    use crate::domain::turn::InboundTurn;

    fn solution() -> Solution {
        serde_json::from_value(json!({"bot_name": "ctx bot", "scenarios": []}))
            .expect("solution deserializes")
    }

    #[test]
    fn turn_context_rebuilds_system_and_clears_request() {
        let mut state = SessionState::default();
        state.messages_number = 2;
        state.scopes.session.insert("name".to_owned(), json!("Ada"));
        state.scopes.request.insert("stale".to_owned(), json!(true));

        let turn = InboundTurn::message("s-1", "web", "hello there");
        let context = VariableContext::for_turn(&solution(), &turn, &state);

        assert_eq!(context.last_user_message(), "hello there");
        assert_eq!(context.system("messages_number"), Some(&json!(3)));
        assert_eq!(context.system("is_first_turn"), Some(&json!(false)));
        assert_eq!(context.lookup("session.name"), Some(&json!("Ada")));
        assert!(context.get(ScopeName::Request, "stale").is_none());
    }

    #[test]
    fn bare_lookup_prefers_shortest_lived_scope() {
        let mut context = VariableContext::new(Map::new(), Scopes::default());
        context.set(WritableScope::Session, "x", json!(1));
        context.set(WritableScope::Request, "x", json!(2));
        assert_eq!(context.lookup("x"), Some(&json!(2)));
        context.set(WritableScope::Temp, "x", json!(3));
        assert_eq!(context.lookup("x"), Some(&json!(3)));

        context.end_cycle();
        assert_eq!(context.lookup("x"), Some(&json!(2)));
        context.clear_transient();
        assert_eq!(context.lookup("x"), Some(&json!(1)));
    }

    #[test]
    fn expression_view_exposes_all_namespaces() {
        let mut context = VariableContext::new(Map::new(), Scopes::default());
        let mut nlu = Map::new();
        nlu.insert("intents".to_owned(), json!([]));
        context.set_nlu(nlu);
        let value = context.to_value();
        for key in ["system", "session", "request", "temp", "nlu"] {
            assert!(value.get(key).is_some(), "missing namespace {key}");
        }
    }
}
