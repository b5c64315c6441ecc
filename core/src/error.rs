use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// Machine-readable failure codes surfaced to the calling agent.
///
/// These are stable strings, not exception types: an agent branches on
/// `error.code`, never on the shape of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Argument missing, unparseable or naming a row/field that does not exist.
    /// Missing and unparseable arguments are caught before any network call.
    BadInput,
    /// Transport failure, timeout or non-2xx status on a GET.
    HttpGetError,
    /// Transport failure, timeout or non-2xx status on a POST.
    HttpPostError,
    /// Upstream answered with a body that is not a JSON envelope.
    BadJson,
    /// Upstream answered `ok: false`; its own error is relayed in `details.upstream`.
    UpstreamError,
    /// Confirm token unknown, already consumed, or issued before a restart.
    ConfirmExpired,
    /// One child of a bulk confirm was already consumed.
    ChildExpired,
    /// Confirm token belongs to a different operation than the tool called.
    ConfirmMismatch,
    /// Target cell already holds a value and overwrite was not requested.
    AlreadyExists,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadInput => "BAD_INPUT",
            ErrorCode::HttpGetError => "HTTP_GET_ERROR",
            ErrorCode::HttpPostError => "HTTP_POST_ERROR",
            ErrorCode::BadJson => "BAD_JSON",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::ConfirmExpired => "CONFIRM_EXPIRED",
            ErrorCode::ChildExpired => "CHILD_EXPIRED",
            ErrorCode::ConfirmMismatch => "CONFIRM_MISMATCH",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Structured failure returned by every handler and backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolFailure {
    pub code: ErrorCode,
    pub message: String,
    /// Optional diagnostics (field name, truncated upstream body, relayed upstream error)
    pub details: Option<Value>,
}

impl ToolFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadInput, message)
    }

    /// `BAD_INPUT` tagged with the offending argument name.
    pub fn bad_field(field: &str, message: impl Into<String>) -> Self {
        Self::bad_input(message).with_details(json!({ "field": field }))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}
