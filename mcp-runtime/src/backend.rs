use std::time::Duration;

use async_trait::async_trait;
use cram_core::{ErrorCode, ToolFailure};
use serde_json::{Value, json};

const BAD_JSON_BODY_PREVIEW_CHARS: usize = 500;
const MAX_REDIRECTS: usize = 10;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// The single upstream execution endpoint.
///
/// Both calls return the parsed upstream document; interpreting its
/// `ok`/`data`/`error` fields is left to [`expect_ok`].
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, op: &str, params: &[(String, String)]) -> Result<Value, ToolFailure>;
    async fn post(&self, body: Value) -> Result<Value, ToolFailure>;
}

/// Upstream payload of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamData {
    pub data: Value,
    /// The full envelope as received, for verbatim passthrough.
    pub raw: Value,
}

/// Interpret an upstream envelope: `ok: true` yields its data, `ok: false`
/// becomes `UPSTREAM_ERROR` with the backend's error relayed.
pub fn expect_ok(op: &str, raw: Value) -> Result<UpstreamData, ToolFailure> {
    let Some(obj) = raw.as_object() else {
        return Err(ToolFailure::new(
            ErrorCode::BadJson,
            format!("{op}: upstream response is not a JSON object"),
        )
        .with_details(json!({ "body": truncate_body(&raw.to_string()) })));
    };
    match obj.get("ok").and_then(Value::as_bool) {
        Some(true) => Ok(UpstreamData {
            data: obj.get("data").cloned().unwrap_or(Value::Null),
            raw,
        }),
        Some(false) => {
            let upstream = obj.get("error").cloned().unwrap_or(Value::Null);
            let message = upstream
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream reported failure")
                .to_string();
            Err(ToolFailure::new(ErrorCode::UpstreamError, message)
                .with_details(json!({ "op": op, "upstream": upstream })))
        }
        None => Err(ToolFailure::new(
            ErrorCode::BadJson,
            format!("{op}: upstream response has no boolean 'ok' field"),
        )
        .with_details(json!({ "body": truncate_body(&raw.to_string()) }))),
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= BAD_JSON_BODY_PREVIEW_CHARS {
        return body.to_string();
    }
    let mut out: String = body.chars().take(BAD_JSON_BODY_PREVIEW_CHARS).collect();
    out.push('…');
    out
}

/// reqwest-backed client for the execution endpoint.
pub struct HttpBackend {
    exec_url: reqwest::Url,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(exec_url: reqwest::Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { exec_url, http })
    }

    async fn read_json(
        &self,
        response: reqwest::Response,
        code: ErrorCode,
        op: &str,
    ) -> Result<Value, ToolFailure> {
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(op, status = status.as_u16(), "upstream returned non-success status");
            return Err(ToolFailure::new(
                code,
                format!("{op}: upstream returned HTTP {status}"),
            )
            .with_details(json!({ "status": status.as_u16() })));
        }
        let bytes = response.bytes().await.map_err(|e| {
            ToolFailure::new(code, format!("{op}: failed to read upstream body: {e}"))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!(op, error = %e, "upstream body is not JSON");
            ToolFailure::new(ErrorCode::BadJson, format!("{op}: upstream body is not JSON: {e}"))
                .with_details(json!({
                    "body": truncate_body(&String::from_utf8_lossy(&bytes))
                }))
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get(&self, op: &str, params: &[(String, String)]) -> Result<Value, ToolFailure> {
        let mut url = self.exec_url.clone();
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("op", op);
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        tracing::debug!(op, method = "GET", "upstream request");

        let response = self.http.get(url).send().await.map_err(|e| {
            tracing::warn!(op, error = %e, "upstream GET failed");
            ToolFailure::new(ErrorCode::HttpGetError, format!("{op}: {e}"))
        })?;
        self.read_json(response, ErrorCode::HttpGetError, op).await
    }

    async fn post(&self, body: Value) -> Result<Value, ToolFailure> {
        let op = body
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        tracing::debug!(op = %op, method = "POST", "upstream request");

        let response = self
            .http
            .post(self.exec_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(op = %op, error = %e, "upstream POST failed");
                ToolFailure::new(ErrorCode::HttpPostError, format!("{op}: {e}"))
            })?;
        self.read_json(response, ErrorCode::HttpPostError, &op).await
    }
}
