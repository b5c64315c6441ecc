//! Coercion of loosely-typed agent arguments into canonical identifiers.
//!
//! Agents pass the same logical argument in several shapes: a bare string,
//! a quoted string, an object wrapping the value under one of a few keys,
//! or a list of any of those. The accepted shapes are enumerated here so
//! handlers never inspect raw JSON types themselves.

use serde_json::Value;

/// Result of parsing an identifier argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdArg {
    Scalar(String),
    List(Vec<String>),
    Invalid(String),
}

/// Trim and drop one pair of matching surrounding quotes.
pub fn strip_quotes(raw: &str) -> &str {
    let s = raw.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].trim();
    }
    s
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => strip_quotes(s).to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Accept a string, a number, or an object carrying one of `aliases`.
pub fn coerce_scalar(value: &Value, aliases: &[&str]) -> Option<String> {
    match value {
        Value::Object(map) => aliases
            .iter()
            .find_map(|key| map.get(*key).and_then(scalar_text)),
        other => scalar_text(other),
    }
}

/// Parse a scalar-or-list identifier argument.
pub fn parse_ids(value: &Value, aliases: &[&str]) -> IdArg {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return IdArg::Invalid("list must not be empty".to_string());
            }
            let mut out: Vec<String> = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let Some(id) = coerce_scalar(item, aliases) else {
                    return IdArg::Invalid(format!("item {index} is not an identifier"));
                };
                if !out.contains(&id) {
                    out.push(id);
                }
            }
            IdArg::List(out)
        }
        Value::Null => IdArg::Invalid("value is null".to_string()),
        other => match coerce_scalar(other, aliases) {
            Some(id) => IdArg::Scalar(id),
            None => IdArg::Invalid("expected a string, an object or a list".to_string()),
        },
    }
}
