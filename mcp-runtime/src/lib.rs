use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Subcommand;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub mod backend;
pub mod confirm;
pub mod protocol;
#[cfg(test)]
mod testing;
pub mod tools;

pub use backend::{Backend, DEFAULT_TIMEOUT_SECS, HttpBackend, expect_ok};
pub use confirm::ConfirmCache;
pub use tools::ToolRouter;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "cram-mcp";

#[derive(Subcommand, Clone, Debug)]
pub enum McpCommands {
    /// Run the cram-books MCP server over stdio
    Serve,
    /// Check that the execution endpoint answers `ping`
    Diagnose,
}

#[derive(Clone, Debug)]
pub struct McpRuntimeConfig {
    pub exec_url: reqwest::Url,
    pub timeout: Duration,
}

pub async fn run(config: McpRuntimeConfig, command: McpCommands) -> i32 {
    let backend = match HttpBackend::new(config.exec_url.clone(), config.timeout) {
        Ok(backend) => backend,
        Err(err) => {
            let payload = json!({
                "error": "http_client_error",
                "message": err.to_string(),
            });
            eprintln!("{}", to_pretty_json(&payload));
            return 1;
        }
    };

    match command {
        McpCommands::Serve => {
            tracing::info!(
                exec_url = %redacted_url(&config.exec_url),
                timeout_secs = config.timeout.as_secs(),
                "starting MCP server on stdio"
            );
            let server = Arc::new(McpServer::new(Arc::new(backend)));
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Diagnose => {
            let mut report = diagnose(&backend).await;
            report["exec_url"] = Value::String(redacted_url(&config.exec_url));
            println!("{}", to_pretty_json(&report));
            if report.get("status").and_then(Value::as_str) == Some("ready") {
                0
            } else {
                2
            }
        }
    }
}

/// The deployment id lives in the path; query strings may carry keys.
fn redacted_url(url: &reqwest::Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

/// GET `ping` against the execution endpoint.
pub async fn diagnose(backend: &dyn Backend) -> Value {
    let started = Instant::now();
    let result = match backend.get("ping", &[]).await {
        Ok(raw) => expect_ok("ping", raw),
        Err(failure) => Err(failure),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(reply) => json!({
            "status": "ready",
            "elapsed_ms": elapsed_ms,
            "upstream": reply.data,
        }),
        Err(failure) => {
            tracing::warn!(code = %failure.code, message = %failure.message, "diagnose ping failed");
            json!({
                "status": "unreachable",
                "elapsed_ms": elapsed_ms,
                "error": failure.to_value(),
            })
        }
    }
}

pub struct McpServer {
    router: ToolRouter,
}

impl McpServer {
    /// The confirm cache lives exactly as long as this server.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            router: ToolRouter::new(backend, Arc::new(ConfirmCache::new())),
        }
    }

    pub async fn serve_stdio(self: Arc<Self>) -> Result<(), String> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Read messages until EOF; each one is handled on its own task and
    /// replies are written by a single writer in completion order.
    async fn serve<R, W>(self: Arc<Self>, input: R, output: W) -> Result<(), String>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Framing, Value)>();
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some((framing, response)) = rx.recv().await {
                write_message(&mut output, framing, &response).await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut reader = BufReader::new(input);
        let read_result = loop {
            let incoming = match read_message(&mut reader).await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => break Ok(()),
                Err(err) => break Err(format!("Failed to read MCP message: {err}")),
            };
            let server = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = match incoming.payload {
                    Ok(message) => server.handle_incoming_message(message).await,
                    Err(err) => Some(error_response(Value::Null, RpcError::parse_error(err.to_string()))),
                };
                if let Some(response) = response {
                    if tx.send((incoming.framing, response)).is_err() {
                        tracing::warn!("response dropped: writer has stopped");
                    }
                }
            });
        };
        drop(tx);

        let write_result = writer
            .await
            .map_err(|e| format!("MCP writer task failed: {e}"))?
            .map_err(|e| format!("Failed to write MCP response: {e}"));
        read_result.and(write_result)
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Option<Value> {
        let batch = match incoming {
            Value::Array(batch) => batch,
            single => return self.handle_single_message(single).await,
        };
        if batch.is_empty() {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Batch request must not be empty"),
            ));
        }
        let mut responses = Vec::with_capacity(batch.len());
        for item in batch {
            if let Some(response) = self.handle_single_message(item).await {
                responses.push(response);
            }
        }
        (!responses.is_empty()).then_some(Value::Array(responses))
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never issues requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        match obj.get("id").cloned() {
            Some(id) => Some(match self.handle_request(method, params).await {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            }),
            None => {
                tracing::debug!(method, "notification ignored");
                None
            }
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let started = Instant::now();
        let envelope = self.router.call(name, &args).await;
        let is_error = envelope.get("ok").and_then(Value::as_bool) != Some(true);
        tracing::info!(
            tool = name,
            ok = !is_error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call finished"
        );
        Ok(build_tool_call_response(envelope, is_error))
    }
}

fn initialize_payload() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "listChanged": false },
            "prompts": { "listChanged": false }
        },
        "serverInfo": {
            "name": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "instructions": "Reference books, students and weekly planners of a cram school. Mutating tools answer with a preview (effects + confirm_token) and change nothing; show the effects, then call the same tool (or its *_confirm tool) with only confirm_token. Tokens work once. Call tools_help for the full workflow."
    })
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tools::tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    // Agents read the text block; structuredContent carries the same envelope.
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: format!("Parse error: {}", message.into()),
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    })
}

/// How a message arrived; the reply goes back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    ContentLength,
    Newline,
}

#[derive(Debug)]
struct Incoming {
    framing: Framing,
    payload: Result<Value, serde_json::Error>,
}

/// `Ok(None)` on clean EOF between messages.
async fn read_message<R>(reader: &mut R) -> Result<Option<Incoming>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if !saw_header {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        let trimmed = line.trim();
        if !saw_header && !trimmed.is_empty() && !looks_like_header(trimmed) {
            return Ok(Some(Incoming {
                framing: Framing::Newline,
                payload: serde_json::from_str(trimmed),
            }));
        }
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }

        saw_header = true;
        if let Some((name, raw_len)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let parsed = raw_len.trim().parse::<usize>().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "Invalid Content-Length header",
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Incoming {
        framing: Framing::ContentLength,
        payload: serde_json::from_slice(&payload),
    }))
}

fn looks_like_header(line: &str) -> bool {
    line.split_once(':').is_some_and(|(name, _)| {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

async fn write_message<W>(writer: &mut W, framing: Framing, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    match framing {
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
        Framing::Newline => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
