//! Scripted in-memory backend for handler tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cram_core::{ErrorCode, ToolFailure};
use serde_json::Value;

use crate::backend::Backend;

#[derive(Default)]
pub(crate) struct FakeBackend {
    scripted: Mutex<HashMap<String, Result<Value, ToolFailure>>>,
    gets: Mutex<Vec<(String, Vec<(String, String)>)>>,
    posts: Mutex<Vec<Value>>,
}

fn key(method: &str, op: &str) -> String {
    format!("{method} {op}")
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_get(&self, op: &str, response: Value) {
        self.scripted.lock().unwrap().insert(key("GET", op), Ok(response));
    }

    pub(crate) fn on_post(&self, op: &str, response: Value) {
        self.scripted.lock().unwrap().insert(key("POST", op), Ok(response));
    }

    pub(crate) fn fail_get(&self, op: &str, failure: ToolFailure) {
        self.scripted.lock().unwrap().insert(key("GET", op), Err(failure));
    }

    pub(crate) fn gets(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.gets.lock().unwrap().clone()
    }

    pub(crate) fn posts(&self) -> Vec<Value> {
        self.posts.lock().unwrap().clone()
    }

    fn respond(&self, method: &str, op: &str) -> Result<Value, ToolFailure> {
        let code = if method == "GET" {
            ErrorCode::HttpGetError
        } else {
            ErrorCode::HttpPostError
        };
        self.scripted
            .lock()
            .unwrap()
            .get(&key(method, op))
            .cloned()
            .unwrap_or_else(|| Err(ToolFailure::new(code, format!("no scripted response for {method} {op}"))))
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn get(&self, op: &str, params: &[(String, String)]) -> Result<Value, ToolFailure> {
        self.gets.lock().unwrap().push((op.to_string(), params.to_vec()));
        self.respond("GET", op)
    }

    async fn post(&self, body: Value) -> Result<Value, ToolFailure> {
        let op = body.get("op").and_then(Value::as_str).unwrap_or_default().to_string();
        self.posts.lock().unwrap().push(body);
        self.respond("POST", &op)
    }
}
