use cram_core::{ToolFailure, coerce_scalar};
use serde_json::{Map, Value};

/// Scalar argument under `key`, also accepting a wrapping object or, when
/// `key` is absent, any alias at the top level of the arguments.
pub fn optional_scalar(args: &Map<String, Value>, key: &str, aliases: &[&str]) -> Option<String> {
    match args.get(key) {
        Some(value) if !value.is_null() => coerce_scalar(value, aliases),
        _ => aliases
            .iter()
            .find_map(|alias| args.get(*alias).and_then(|v| coerce_scalar(v, &[]))),
    }
}

pub fn required_scalar(
    args: &Map<String, Value>,
    key: &str,
    aliases: &[&str],
) -> Result<String, ToolFailure> {
    optional_scalar(args, key, aliases)
        .ok_or_else(|| ToolFailure::bad_field(key, format!("{key} is required")))
}

pub fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            _ => Err(ToolFailure::bad_field(key, format!("'{key}' must be a boolean"))),
        },
        Some(_) => Err(ToolFailure::bad_field(key, format!("'{key}' must be a boolean"))),
    }
}

/// Unsigned integer given as a JSON number or a numeric string.
pub fn arg_optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolFailure> {
    let invalid = || ToolFailure::bad_field(key, format!("'{key}' must be an unsigned integer"));
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(invalid),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse::<u64>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

pub fn arg_optional_object<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(ToolFailure::bad_field(key, format!("'{key}' must be an object"))),
    }
}

pub fn arg_optional_array<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Vec<Value>>, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(ToolFailure::bad_field(key, format!("'{key}' must be an array"))),
    }
}

/// Number given as a JSON number or a numeric string; `null` and "" mean no value.
pub fn number_or_null(value: &Value, field: &str) -> Result<Value, ToolFailure> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(int) = s.parse::<i64>() {
                return Ok(Value::from(int));
            }
            s.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ToolFailure::bad_field(field, format!("'{field}' must be a number")))
        }
        _ => Err(ToolFailure::bad_field(field, format!("'{field}' must be a number"))),
    }
}

pub fn confirm_token(args: &Map<String, Value>) -> Option<String> {
    optional_scalar(args, "confirm_token", &["confirm_token", "token"])
}

/// Scalar values compare by their text, so `3` and `"3"` are not a change.
pub fn values_differ(before: &Value, after: &Value) -> bool {
    fn text(value: &Value) -> Option<String> {
        match value {
            Value::Null => Some(String::new()),
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
    match (text(before), text(after)) {
        (Some(a), Some(b)) => a != b,
        _ => before != after,
    }
}

/// Limit parameter shared by list-style reads.
pub fn limit_param(args: &Map<String, Value>) -> Result<Vec<(String, String)>, ToolFailure> {
    Ok(arg_optional_u64(args, "limit")?
        .filter(|limit| *limit > 0)
        .map(|limit| vec![("limit".to_string(), limit.to_string())])
        .unwrap_or_default())
}
