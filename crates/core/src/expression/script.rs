use std::sync::OnceLock;

use regex::Regex;

use crate::context::{ScopeName, VariableContext};
use crate::domain::block::WritableScope;
use crate::errors::EngineError;
use crate::expression::evaluate;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptStatement {
    Assign { scope: WritableScope, name: String, expression: String },
    Unset { scope: WritableScope, name: String },
}

/// Parsed body of a `script` block: `scope.name = <expr>` and `unset scope.name` statements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptProgram {
    pub statements: Vec<ScriptStatement>,
}

fn assignment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*=(.*)$")
            .expect("assignment regex must compile")
    })
}

fn unset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*unset\s+([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*$")
            .expect("unset regex must compile")
    })
}

impl ScriptProgram {
    pub fn parse(code: &str) -> Result<Self, EngineError> {
        let mut statements = Vec::new();

        for (line_number, raw_line) in code.lines().enumerate() {
            for raw in split_statements(raw_line) {
                let statement = raw.trim();
                if statement.is_empty() || statement.starts_with('#') || statement.starts_with("//")
                {
                    continue;
                }
                statements.push(parse_statement(statement, line_number + 1)?);
            }
        }

        Ok(Self { statements })
    }

    /// Runs statements in order; each assignment sees the writes before it.
    pub fn run(&self, context: &mut VariableContext) -> Result<usize, EngineError> {
        for statement in &self.statements {
            match statement {
                ScriptStatement::Assign { scope, name, expression } => {
                    let value = evaluate(expression, context)?;
                    context.set(*scope, name.clone(), value);
                }
                ScriptStatement::Unset { scope, name } => {
                    context.remove(*scope, name);
                }
            }
        }
        Ok(self.statements.len())
    }
}

/// Splits a line on `;` outside of quoted string literals.
fn split_statements(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (index, ch) in line.char_indices() {
        match (quote, ch) {
            (Some(open), _) if ch == open => quote = None,
            (None, '\'' | '"') => quote = Some(ch),
            (None, ';') => {
                parts.push(&line[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

fn parse_statement(statement: &str, line: usize) -> Result<ScriptStatement, EngineError> {
    if let Some(captures) = unset_pattern().captures(statement) {
        let scope = writable_scope(&captures[1], line)?;
        return Ok(ScriptStatement::Unset { scope, name: captures[2].to_owned() });
    }

    let captures = assignment_pattern().captures(statement).ok_or_else(|| {
        EngineError::ExpressionEvaluation(format!(
            "line {line}: expected `scope.name = expression`, found `{statement}`"
        ))
    })?;

    let expression = captures[3].trim();
    if expression.starts_with('=') {
        return Err(EngineError::ExpressionEvaluation(format!(
            "line {line}: comparison used where an assignment was expected"
        )));
    }
    if expression.is_empty() {
        return Err(EngineError::ExpressionEvaluation(format!(
            "line {line}: assignment to `{}.{}` has no value",
            &captures[1], &captures[2]
        )));
    }

    Ok(ScriptStatement::Assign {
        scope: writable_scope(&captures[1], line)?,
        name: captures[2].to_owned(),
        expression: expression.to_owned(),
    })
}

fn writable_scope(name: &str, line: usize) -> Result<WritableScope, EngineError> {
    let scope = name.parse::<ScopeName>()?;
    scope.writable().ok_or_else(|| {
        EngineError::ExpressionEvaluation(format!("line {line}: scope `{scope}` is read-only"))
    })
}
