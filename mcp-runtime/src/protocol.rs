//! Propose/confirm policy shared by every mutating tool.
//!
//! Propose performs reads only and parks the intended write in the
//! [`ConfirmCache`]. Confirm trusts nothing but the token: the cached
//! request is what gets forwarded, whatever else the caller passes.

use cram_core::{Effect, ErrorCode, ToolFailure};
use serde_json::{Map, Value, json};

use crate::backend::{Backend, expect_ok};
use crate::confirm::{BulkRequest, ConfirmCache, MutationRequest, PendingMutation};

/// A fully validated mutation plus its human-readable diff.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub request: MutationRequest,
    pub effects: Vec<Effect>,
    /// Extra handler-specific fields merged into the propose response.
    pub preview: Map<String, Value>,
}

impl Proposal {
    pub fn new(request: MutationRequest, effects: Vec<Effect>) -> Self {
        Self {
            request,
            effects,
            preview: Map::new(),
        }
    }

    pub fn with_preview(mut self, key: &str, value: Value) -> Self {
        self.preview.insert(key.to_string(), value);
        self
    }
}

/// What a tool hands back to the MCP boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Wrapped into `{ok: true, op, data}`.
    Data(Value),
    /// Already an envelope; returned as-is.
    Verbatim(Value),
}

/// Park a single proposal and describe it to the caller.
pub fn propose(cache: &ConfirmCache, proposal: Proposal) -> Value {
    let op = proposal.request.op.clone();
    let token = cache.put(PendingMutation::Direct(proposal.request));
    tracing::info!(op = %op, token = %token, effects = proposal.effects.len(), "mutation proposed");

    let mut data = proposal.preview;
    data.insert("requires_confirmation".to_string(), Value::Bool(true));
    data.insert("confirm_token".to_string(), Value::String(token));
    data.insert("effects".to_string(), json!(proposal.effects));
    Value::Object(data)
}

/// Park every child proposal, then a parent that references them.
///
/// Children are confirmable on their own; the parent resolves them all.
pub fn propose_bulk(cache: &ConfirmCache, op: &str, proposals: Vec<Proposal>) -> Value {
    let mut children = Vec::with_capacity(proposals.len());
    let mut child_views = Vec::with_capacity(proposals.len());
    let mut effects = Vec::new();

    for proposal in proposals {
        let token = cache.put(PendingMutation::Direct(proposal.request));
        child_views.push(json!({
            "confirm_token": token,
            "effects": proposal.effects,
        }));
        effects.extend(proposal.effects);
        children.push(token);
    }

    let total = children.len();
    let token = cache.put(PendingMutation::Bulk(BulkRequest {
        op: op.to_string(),
        children,
    }));
    tracing::info!(op, token = %token, children = total, "bulk mutation proposed");

    json!({
        "requires_confirmation": true,
        "confirm_token": token,
        "effects": effects,
        "children": child_views,
        "count": total,
    })
}

/// Consume `token` and execute whatever it was issued for.
///
/// A token issued for another operation is rejected without being consumed.
pub async fn confirm(
    cache: &ConfirmCache,
    backend: &dyn Backend,
    token: &str,
    expected_op: &str,
) -> Result<ToolOutput, ToolFailure> {
    if let Some(pending) = cache.get(token) {
        if pending.op() != expected_op {
            return Err(ToolFailure::new(
                ErrorCode::ConfirmMismatch,
                format!(
                    "confirm_token was issued for '{}', not '{expected_op}'",
                    pending.op()
                ),
            )
            .with_details(json!({ "token_op": pending.op() })));
        }
    }

    let Some(pending) = cache.pop(token) else {
        tracing::info!(op = expected_op, token, "confirm token expired or unknown");
        return Err(ToolFailure::new(
            ErrorCode::ConfirmExpired,
            "confirm_token is invalid, already used, or expired",
        ));
    };

    match pending {
        PendingMutation::Direct(request) => {
            tracing::info!(op = %request.op, token, "mutation confirmed");
            let raw = backend.post(request.to_body()).await?;
            let reply = expect_ok(&request.op, raw)?;
            Ok(ToolOutput::Verbatim(with_op(reply.raw, &request.op)))
        }
        PendingMutation::Bulk(bulk) => {
            tracing::info!(op = %bulk.op, token, children = bulk.children.len(), "bulk mutation confirmed");
            Ok(ToolOutput::Data(confirm_children(cache, backend, &bulk).await))
        }
    }
}

async fn confirm_children(cache: &ConfirmCache, backend: &dyn Backend, bulk: &BulkRequest) -> Value {
    let mut results = Vec::with_capacity(bulk.children.len());
    let mut confirmed = 0usize;

    for child in &bulk.children {
        let outcome = match cache.pop(child) {
            None => Err(ToolFailure::new(
                ErrorCode::ChildExpired,
                "child confirm_token was already used or expired",
            )),
            Some(PendingMutation::Bulk(_)) => Err(ToolFailure::new(
                ErrorCode::ConfirmMismatch,
                "nested bulk tokens are not supported",
            )),
            Some(PendingMutation::Direct(request)) => match backend.post(request.to_body()).await {
                Ok(raw) => expect_ok(&request.op, raw).map(|reply| reply.data),
                Err(failure) => Err(failure),
            },
        };
        match outcome {
            Ok(data) => {
                confirmed += 1;
                results.push(json!({ "confirm_token": child, "ok": true, "data": data }));
            }
            Err(failure) => {
                tracing::warn!(op = %bulk.op, token = %child, code = %failure.code, "bulk child failed");
                results.push(json!({
                    "confirm_token": child,
                    "ok": false,
                    "error": failure.to_value(),
                }));
            }
        }
    }

    json!({
        "confirmed": confirmed,
        "total": bulk.children.len(),
        "results": results,
    })
}

pub(crate) fn with_op(mut raw: Value, op: &str) -> Value {
    if let Some(obj) = raw.as_object_mut() {
        obj.entry("op").or_insert_with(|| Value::String(op.to_string()));
    }
    raw
}
