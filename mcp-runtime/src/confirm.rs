//! In-process store of proposed mutations awaiting confirmation.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};
use uuid::Uuid;

/// A single upstream write, exactly as it will be POSTed on confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub op: String,
    pub fields: Map<String, Value>,
}

impl MutationRequest {
    pub fn new(op: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            op: op.into(),
            fields,
        }
    }

    /// Request body: `{op, ...fields}`.
    pub fn to_body(&self) -> Value {
        let mut body = Map::with_capacity(self.fields.len() + 1);
        body.insert("op".to_string(), Value::String(self.op.clone()));
        for (k, v) in &self.fields {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }
}

/// A parent proposal whose confirmation resolves several child tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub op: String,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingMutation {
    Direct(MutationRequest),
    Bulk(BulkRequest),
}

impl PendingMutation {
    pub fn op(&self) -> &str {
        match self {
            PendingMutation::Direct(request) => &request.op,
            PendingMutation::Bulk(bulk) => &bulk.op,
        }
    }
}

/// Token -> pending mutation table.
///
/// Entries live until popped or until the process exits; nothing expires them.
#[derive(Debug, Default)]
pub struct ConfirmCache {
    entries: Mutex<HashMap<String, PendingMutation>>,
}

impl ConfirmCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, payload: PendingMutation) -> String {
        let token = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(token.clone(), payload);
        tracing::debug!(pending = entries.len(), "confirm token issued");
        token
    }

    pub fn get(&self, token: &str) -> Option<PendingMutation> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(token).cloned()
    }

    /// Remove and return the entry in one step under the lock.
    pub fn pop(&self, token: &str) -> Option<PendingMutation> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let popped = entries.remove(token);
        tracing::debug!(
            pending = entries.len(),
            found = popped.is_some(),
            "confirm token consumed"
        );
        popped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
