//! Pure evaluation of embedded expressions and text templates.
//!
//! Expressions use JEXL (`jexl-eval`); templates use `tera` with `{{ scope.name }}` placeholders.
//! Neither has filesystem or network access. The variable context is always passed in as data,
//! never spliced into expression source.

pub mod json_path;
pub mod script;

use std::error::Error as _;

use regex::RegexBuilder;
use serde_json::{json, Number, Value};

use crate::context::VariableContext;
use crate::errors::EngineError;

pub use script::{ScriptProgram, ScriptStatement};

/// Builds a fresh evaluator with the standard transforms registered.
///
/// `jexl_eval::Evaluator` holds boxed closures that are neither `Send` nor `Sync`, so one is built
/// per evaluation instead of being shared across tasks.
fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            Ok(json!(args.first().and_then(Value::as_str).unwrap_or("").to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            Ok(json!(args.first().and_then(Value::as_str).unwrap_or("").to_uppercase()))
        })
        .with_transform("trim", |args: &[Value]| {
            Ok(json!(args.first().and_then(Value::as_str).unwrap_or("").trim()))
        })
        .with_transform("split", |args: &[Value]| {
            let subject = args.first().and_then(Value::as_str).unwrap_or("");
            let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
            Ok(json!(subject.split(delimiter).map(str::trim).collect::<Vec<_>>()))
        })
        .with_transform("contains", |args: &[Value]| {
            let found = match (args.first(), args.get(1)) {
                (Some(Value::String(subject)), Some(Value::String(search))) => {
                    subject.contains(search.as_str())
                }
                (Some(Value::Array(items)), Some(needle)) => {
                    items.iter().any(|item| item == needle)
                }
                _ => false,
            };
            Ok(json!(found))
        })
        .with_transform("startsWith", |args: &[Value]| {
            let subject = args.first().and_then(Value::as_str).unwrap_or("");
            let prefix = args.get(1).and_then(Value::as_str).unwrap_or("");
            Ok(json!(subject.starts_with(prefix)))
        })
        .with_transform("endsWith", |args: &[Value]| {
            let subject = args.first().and_then(Value::as_str).unwrap_or("");
            let suffix = args.get(1).and_then(Value::as_str).unwrap_or("");
            Ok(json!(subject.ends_with(suffix)))
        })
        .with_transform("length", |args: &[Value]| {
            let length = match args.first() {
                Some(Value::String(text)) => text.chars().count(),
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(fields)) => fields.len(),
                _ => 0,
            };
            Ok(json!(length as f64))
        })
        .with_transform("number", |args: &[Value]| {
            let number = match args.first() {
                Some(Value::Number(number)) => number.as_f64(),
                Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
                Some(Value::Bool(flag)) => Some(if *flag { 1.0 } else { 0.0 }),
                _ => None,
            };
            Ok(number.map_or(Value::Null, |number| json!(number)))
        })
        .with_transform("string", |args: &[Value]| {
            Ok(json!(args.first().map(display_value).unwrap_or_default()))
        })
        .with_transform("default", |args: &[Value]| {
            let value = args.first().cloned().unwrap_or(Value::Null);
            Ok(if value.is_null() { args.get(1).cloned().unwrap_or(Value::Null) } else { value })
        })
}

/// Evaluates one JEXL expression against the variable context.
pub fn evaluate(expression: &str, context: &VariableContext) -> Result<Value, EngineError> {
    let source = expression.trim();
    if source.is_empty() {
        return Err(EngineError::ExpressionEvaluation("empty expression".to_owned()));
    }

    let scope = to_jexl_numbers(context.to_value());
    evaluator()
        .eval_in_context(source, &scope)
        .map(from_jexl_numbers)
        .map_err(|error| EngineError::ExpressionEvaluation(format!("`{source}`: {error}")))
}

/// Evaluates an expression and coerces the result with JavaScript-like truthiness.
pub fn evaluate_bool(expression: &str, context: &VariableContext) -> Result<bool, EngineError> {
    evaluate(expression, context).map(|value| value_to_bool(&value))
}

pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Null => false,
        Value::Number(number) => number.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Renders a text template; a reference to a missing variable is an error.
pub fn render(template: &str, context: &VariableContext) -> Result<String, EngineError> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_owned());
    }

    let tera_context = tera::Context::from_value(context.to_value())
        .map_err(|error| EngineError::ExpressionEvaluation(describe_tera_error(&error)))?;
    tera::Tera::one_off(template, &tera_context, false)
        .map_err(|error| EngineError::ExpressionEvaluation(describe_tera_error(&error)))
}

/// First capture group (or the whole match) of `pattern` in `text`, matched case-insensitively.
pub fn extract_match(pattern: &str, text: &str) -> Result<Option<String>, EngineError> {
    let regex = RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|error| {
        EngineError::ExpressionEvaluation(format!("invalid pattern `{pattern}`: {error}"))
    })?;

    Ok(regex.captures(text).and_then(|captures| {
        captures.get(1).or_else(|| captures.get(0)).map(|found| found.as_str().to_owned())
    }))
}

/// Text form of a value as it would appear in a message.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn describe_tera_error(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// JEXL works on `f64` only; integers are widened so equality with literals holds.
fn to_jexl_numbers(value: Value) -> Value {
    match value {
        Value::Number(number) if !number.is_f64() => {
            number.as_f64().and_then(Number::from_f64).map_or(Value::Number(number), Value::Number)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(to_jexl_numbers).collect()),
        Value::Object(fields) => Value::Object(
            fields.into_iter().map(|(key, value)| (key, to_jexl_numbers(value))).collect(),
        ),
        other => other,
    }
}

/// Narrows integral floats back to integers so stored values stay stable across evaluations.
fn from_jexl_numbers(value: Value) -> Value {
    match value {
        Value::Number(number) => match number.as_f64() {
            Some(float)
                if number.is_f64()
                    && float.fract() == 0.0
                    && float.abs() < 9_007_199_254_740_992.0 =>
            {
                Value::Number(Number::from(float as i64))
            }
            _ => Value::Number(number),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(from_jexl_numbers).collect()),
        Value::Object(fields) => Value::Object(
            fields.into_iter().map(|(key, value)| (key, from_jexl_numbers(value))).collect(),
        ),
        other => other,
    }
}
