use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{ErrorCode, ToolFailure};

/// The `{ok, op, data|error}` shape every tool call returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub ok: bool,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Envelope {
    pub fn success(op: impl Into<String>, data: Value) -> Self {
        Self {
            ok: true,
            op: op.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(op: impl Into<String>, failure: &ToolFailure) -> Self {
        Self {
            ok: false,
            op: op.into(),
            data: None,
            error: Some(failure.to_value()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            json!({
                "ok": false,
                "op": self.op,
                "error": { "code": ErrorCode::BadJson, "message": "envelope serialization failed" }
            })
        })
    }
}

/// One line of a proposal diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Effect {
    pub location: String,
    pub before: Value,
    pub after: Value,
}

impl Effect {
    pub fn new(location: impl Into<String>, before: Value, after: Value) -> Self {
        Self {
            location: location.into(),
            before,
            after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_omits_error() {
        let value = Envelope::success("books.get", json!({"book": {"id": "gMB001"}})).to_value();
        assert_eq!(value["ok"], true);
        assert_eq!(value["op"], "books.get");
        assert_eq!(value["data"]["book"]["id"], "gMB001");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn failure_envelope_carries_code_and_message() {
        let failure = ToolFailure::bad_input("query is required");
        let value = Envelope::failure("books.find", &failure).to_value();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "BAD_INPUT");
        assert_eq!(value["error"]["message"], "query is required");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn effect_serializes_location_before_after() {
        let effect = Effect::new("title", json!("Old Title"), json!("New Title"));
        assert_eq!(
            serde_json::to_value(&effect).unwrap(),
            json!({"location": "title", "before": "Old Title", "after": "New Title"})
        );
    }
}
