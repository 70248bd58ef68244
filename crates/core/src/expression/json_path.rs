use serde_json::Value;

use crate::errors::EngineError;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
}

/// Resolves a restricted JSONPath (`$.a.b[0]`, `$['key']`, `$.items[-1]`) against `document`.
///
/// Returns `Ok(None)` when the path is well formed but nothing lives there.
pub fn select<'a>(document: &'a Value, path: &str) -> Result<Option<&'a Value>, EngineError> {
    let segments = parse(path)?;
    let mut cursor = document;
    for segment in &segments {
        let next = match (segment, cursor) {
            (Segment::Key(key), Value::Object(fields)) => fields.get(key),
            (Segment::Index(index), Value::Array(items)) => {
                let resolved = if *index < 0 { items.len() as i64 + index } else { *index };
                usize::try_from(resolved).ok().and_then(|position| items.get(position))
            }
            _ => None,
        };
        match next {
            Some(value) => cursor = value,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

fn parse(path: &str) -> Result<Vec<Segment>, EngineError> {
    let invalid = |reason: &str| {
        EngineError::ExpressionEvaluation(format!("invalid json path `{path}`: {reason}"))
    };

    let trimmed = path.trim();
    let rest = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut position = 0;

    while position < chars.len() {
        match chars[position] {
            '.' => {
                position += 1;
                let start = position;
                while position < chars.len() && chars[position] != '.' && chars[position] != '[' {
                    position += 1;
                }
                if start == position {
                    return Err(invalid("empty key"));
                }
                segments.push(Segment::Key(chars[start..position].iter().collect()));
            }
            '[' => {
                let close = chars[position..]
                    .iter()
                    .position(|ch| *ch == ']')
                    .map(|offset| position + offset)
                    .ok_or_else(|| invalid("unclosed bracket"))?;
                let inner: String = chars[position + 1..close].iter().collect();
                let inner = inner.trim();
                let quoted = (inner.starts_with('\'') && inner.ends_with('\''))
                    || (inner.starts_with('"') && inner.ends_with('"'));
                if quoted && inner.len() >= 2 {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_owned()));
                } else {
                    let index = inner.parse::<i64>().map_err(|_| invalid("bad index"))?;
                    segments.push(Segment::Index(index));
                }
                position = close + 1;
            }
            _ if segments.is_empty() && position == 0 => {
                // Bare `key.sub` without the `$.` prefix.
                let start = position;
                while position < chars.len() && chars[position] != '.' && chars[position] != '[' {
                    position += 1;
                }
                segments.push(Segment::Key(chars[start..position].iter().collect()));
            }
            other => return Err(invalid(&format!("unexpected `{other}`"))),
        }
    }

    Ok(segments)
}
