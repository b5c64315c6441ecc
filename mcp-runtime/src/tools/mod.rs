use std::sync::Arc;

use cram_core::{Envelope, ToolFailure};
use serde_json::{Map, Value, json};

use crate::backend::{Backend, expect_ok};
use crate::confirm::ConfirmCache;
use crate::protocol::{ToolOutput, with_op};

pub mod args;
pub mod books;
pub mod planner;
pub mod students;

#[derive(Debug)]
pub struct ToolDefinition {
    pub name: &'static str,
    /// Upstream operation named in the envelope.
    pub op: &'static str,
    pub description: &'static str,
    /// Propose/confirm tool: without `confirm_token` it only previews.
    pub two_phase: bool,
    pub input_schema: Value,
}

fn target_properties() -> Value {
    json!({
        "student_id": { "type": "string", "description": "Student whose planner is targeted" },
        "spreadsheet_id": { "type": "string", "description": "Planner spreadsheet id (overrides student lookup)" }
    })
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn with_target(mut properties: Value) -> Value {
    if let (Some(props), Some(target)) = (properties.as_object_mut(), target_properties().as_object()) {
        for (k, v) in target {
            props.insert(k.clone(), v.clone());
        }
    }
    properties
}

fn confirm_token_property() -> Value {
    json!({ "type": "string", "description": "Token returned by the preview call; when present every other argument is ignored" })
}

fn id_or_ids(single: &str, many: &str) -> Value {
    json!({
        single: { "description": "Identifier (string or object with the id)" },
        many: { "type": "array", "items": {}, "description": "Several identifiers" }
    })
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    let plan_item = json!({
        "type": "object",
        "properties": {
            "week_index": { "type": "integer", "minimum": 1, "maximum": 5 },
            "row": { "type": "integer", "minimum": 4, "maximum": 30 },
            "book_id": { "type": "string" },
            "plan_text": { "type": "string", "maxLength": planner::PLAN_TEXT_MAX },
            "overwrite": { "type": "boolean", "default": false }
        },
        "required": ["week_index", "plan_text"]
    });

    vec![
        ToolDefinition {
            name: "books_find",
            op: "books.find",
            description: "Fuzzy search reference books by title or alias.",
            two_phase: false,
            input_schema: schema(
                json!({ "query": { "description": "Search text (string or {query|q|text})" }, "limit": { "type": "integer" } }),
                &["query"],
            ),
        },
        ToolDefinition {
            name: "books_get",
            op: "books.get",
            description: "Get details (chapters, monthly goal, unit load) for one or more book ids.",
            two_phase: false,
            input_schema: schema(id_or_ids("book_id", "book_ids"), &[]),
        },
        ToolDefinition {
            name: "books_filter",
            op: "books.filter",
            description: "Filter books by exact (where) or partial (contains) column matches.",
            two_phase: false,
            input_schema: schema(
                json!({
                    "where": { "type": "object" },
                    "contains": { "type": "object" },
                    "limit": { "type": "integer" }
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "books_list",
            op: "books.list",
            description: "List books as {id, title, subject}.",
            two_phase: false,
            input_schema: schema(json!({ "limit": { "type": "integer" } }), &[]),
        },
        ToolDefinition {
            name: "books_create",
            op: "books.create",
            description: "Preview creating a book (the backend assigns the id); confirm with confirm_token.",
            two_phase: true,
            input_schema: schema(
                json!({
                    "title": { "type": "string" },
                    "subject": { "type": "string" },
                    "unit_load": { "type": ["number", "string", "null"] },
                    "monthly_goal": { "type": "string" },
                    "chapters": { "type": "array", "items": { "type": "object" } },
                    "id_prefix": { "type": "string" },
                    "confirm_token": confirm_token_property()
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "books_update",
            op: "books.update",
            description: "Preview field updates for a book as a before/after diff; confirm with confirm_token.",
            two_phase: true,
            input_schema: schema(
                json!({
                    "book_id": { "type": "string" },
                    "updates": { "type": "object", "description": "title, subject, monthly_goal, unit_load, chapters (header aliases accepted)" },
                    "confirm_token": confirm_token_property()
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "books_delete",
            op: "books.delete",
            description: "Preview deleting a book and its chapter rows; confirm with confirm_token.",
            two_phase: true,
            input_schema: schema(
                json!({ "book_id": { "type": "string" }, "confirm_token": confirm_token_property() }),
                &[],
            ),
        },
        ToolDefinition {
            name: "students_list",
            op: "students.list",
            description: "List students.",
            two_phase: false,
            input_schema: schema(
                json!({ "limit": { "type": "integer" }, "include_all": { "type": "boolean", "default": false } }),
                &[],
            ),
        },
        ToolDefinition {
            name: "students_find",
            op: "students.find",
            description: "Find students by name or id.",
            two_phase: false,
            input_schema: schema(
                json!({ "query": { "description": "Search text" }, "limit": { "type": "integer" } }),
                &["query"],
            ),
        },
        ToolDefinition {
            name: "students_get",
            op: "students.get",
            description: "Get one or more students by id.",
            two_phase: false,
            input_schema: schema(id_or_ids("student_id", "student_ids"), &[]),
        },
        ToolDefinition {
            name: "students_filter",
            op: "students.filter",
            description: "Filter students by exact (where) or partial (contains) column matches.",
            two_phase: false,
            input_schema: schema(
                json!({
                    "where": { "type": "object" },
                    "contains": { "type": "object" },
                    "limit": { "type": "integer" }
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "students_create",
            op: "students.create",
            description: "Preview adding a student row; confirm with confirm_token.",
            two_phase: true,
            input_schema: schema(
                json!({
                    "record": { "type": "object", "description": "Header -> value" },
                    "name": { "type": "string" },
                    "grade": { "type": "string" },
                    "planner_sheet_id": { "type": "string" },
                    "meeting_doc_id": { "type": "string" },
                    "tags": { "type": "string" },
                    "id_prefix": { "type": "string" },
                    "confirm_token": confirm_token_property()
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "students_update",
            op: "students.update",
            description: "Preview column updates for a student as a before/after diff; confirm with confirm_token.",
            two_phase: true,
            input_schema: schema(
                json!({
                    "student_id": { "type": "string" },
                    "updates": { "type": "object" },
                    "confirm_token": confirm_token_property()
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "students_delete",
            op: "students.delete",
            description: "Preview deleting a student row; confirm with confirm_token.",
            two_phase: true,
            input_schema: schema(
                json!({ "student_id": { "type": "string" }, "confirm_token": confirm_token_property() }),
                &[],
            ),
        },
        ToolDefinition {
            name: "planner_ids_list",
            op: "planner.ids_list",
            description: "List planner rows 4-30 (month code, book id, subject, title, guideline).",
            two_phase: false,
            input_schema: schema(with_target(json!({})), &[]),
        },
        ToolDefinition {
            name: "planner_dates_get",
            op: "planner.dates.get",
            description: "Read the five week start dates (D1/L1/T1/AB1/AJ1).",
            two_phase: false,
            input_schema: schema(with_target(json!({})), &[]),
        },
        ToolDefinition {
            name: "planner_dates_propose",
            op: "planner.dates.set",
            description: "Preview setting the first week start date (D1).",
            two_phase: true,
            input_schema: schema(
                with_target(json!({ "start_date": { "type": "string", "format": "date" } })),
                &["start_date"],
            ),
        },
        ToolDefinition {
            name: "planner_dates_confirm",
            op: "planner.dates.set",
            description: "Write a previewed start date.",
            two_phase: true,
            input_schema: schema(json!({ "confirm_token": confirm_token_property() }), &["confirm_token"]),
        },
        ToolDefinition {
            name: "planner_metrics_get",
            op: "planner.metrics.get",
            description: "Read weekly minutes, unit load and guideline amounts per week.",
            two_phase: false,
            input_schema: schema(with_target(json!({})), &[]),
        },
        ToolDefinition {
            name: "planner_plan_get",
            op: "planner.plan.get",
            description: "Read plan cells (H/P/X/AF/AN, rows 4-30).",
            two_phase: false,
            input_schema: schema(with_target(json!({})), &[]),
        },
        ToolDefinition {
            name: "planner_plan_targets",
            op: "planner.plan.targets",
            description: "List empty plan cells whose row has a book and whose week has weekly minutes.",
            two_phase: false,
            input_schema: schema(with_target(json!({})), &[]),
        },
        ToolDefinition {
            name: "planner_plan_propose",
            op: "planner.plan.set",
            description: "Preview writing plan text into one cell, or several via items.",
            two_phase: true,
            input_schema: schema(
                with_target(json!({
                    "week_index": { "type": "integer", "minimum": 1, "maximum": 5 },
                    "row": { "type": "integer", "minimum": 4, "maximum": 30 },
                    "book_id": { "type": "string" },
                    "plan_text": { "type": "string", "maxLength": planner::PLAN_TEXT_MAX },
                    "overwrite": { "type": "boolean", "default": false },
                    "items": { "type": "array", "items": plan_item.clone() }
                })),
                &[],
            ),
        },
        ToolDefinition {
            name: "planner_plan_confirm",
            op: "planner.plan.set",
            description: "Write previewed plan cells (single or bulk token).",
            two_phase: true,
            input_schema: schema(json!({ "confirm_token": confirm_token_property() }), &["confirm_token"]),
        },
        ToolDefinition {
            name: "planner_plan_propose_bulk",
            op: "planner.plan.set",
            description: "Preview writing several plan cells; returns one parent token.",
            two_phase: true,
            input_schema: schema(
                with_target(json!({ "items": { "type": "array", "items": plan_item } })),
                &["items"],
            ),
        },
        ToolDefinition {
            name: "planner_plan_confirm_bulk",
            op: "planner.plan.set",
            description: "Write every cell of a bulk preview; reports per-cell results.",
            two_phase: true,
            input_schema: schema(json!({ "confirm_token": confirm_token_property() }), &["confirm_token"]),
        },
        ToolDefinition {
            name: "planner_monthly_filter",
            op: "planner.monthly.filter",
            description: "Read monthly sheet rows for a year (2 or 4 digits) and month.",
            two_phase: false,
            input_schema: schema(
                with_target(json!({
                    "year": { "type": ["integer", "string"] },
                    "month": { "type": ["integer", "string"], "minimum": 1, "maximum": 12 }
                })),
                &["year", "month"],
            ),
        },
        ToolDefinition {
            name: "tools_help",
            op: "tools.help",
            description: "Describe available tools and the preview/confirm workflow.",
            two_phase: false,
            input_schema: schema(json!({}), &[]),
        },
    ]
}

pub fn tool_op(name: &str) -> Option<&'static str> {
    tool_definitions()
        .into_iter()
        .find(|tool| tool.name == name)
        .map(|tool| tool.op)
}

/// GET read passed through as the upstream envelope.
pub(crate) async fn read_get(
    backend: &dyn Backend,
    op: &str,
    params: &[(String, String)],
) -> Result<ToolOutput, ToolFailure> {
    let raw = backend.get(op, params).await?;
    let reply = expect_ok(op, raw)?;
    Ok(ToolOutput::Verbatim(with_op(reply.raw, op)))
}

/// POST read (predicates that do not fit a query string).
pub(crate) async fn read_post(
    backend: &dyn Backend,
    op: &str,
    mut body: Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    body.insert("op".to_string(), Value::String(op.to_string()));
    let raw = backend.post(Value::Object(body)).await?;
    let reply = expect_ok(op, raw)?;
    Ok(ToolOutput::Verbatim(with_op(reply.raw, op)))
}

fn tools_help() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "op": tool.op,
                "description": tool.description,
                "two_phase": tool.two_phase,
            })
        })
        .collect();
    json!({
        "tools": tools,
        "workflow": [
            "Mutating tools first return a preview: {requires_confirmation, confirm_token, effects}.",
            "Show the effects to the user, then call the same tool (or its *_confirm tool) with only confirm_token.",
            "A confirm_token works once; reusing it returns CONFIRM_EXPIRED.",
            "Planner tools need student_id or spreadsheet_id."
        ]
    })
}

/// Dispatches `tools/call` to handlers and converts every outcome into an envelope.
#[derive(Clone)]
pub struct ToolRouter {
    backend: Arc<dyn Backend>,
    cache: Arc<ConfirmCache>,
}

impl ToolRouter {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<ConfirmCache>) -> Self {
        Self { backend, cache }
    }

    pub fn cache(&self) -> &ConfirmCache {
        &self.cache
    }

    pub async fn call(&self, name: &str, args: &Map<String, Value>) -> Value {
        let op = tool_op(name).unwrap_or(name);
        match self.execute(name, args).await {
            Ok(ToolOutput::Data(data)) => Envelope::success(op, data).to_value(),
            Ok(ToolOutput::Verbatim(envelope)) => envelope,
            Err(failure) => {
                tracing::warn!(tool = name, code = %failure.code, message = %failure.message, "tool call failed");
                Envelope::failure(op, &failure).to_value()
            }
        }
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        let backend = self.backend.as_ref();
        let cache = self.cache.as_ref();
        match name {
            "books_find" => books::find(backend, args).await,
            "books_get" => books::get(backend, args).await,
            "books_filter" => books::filter(backend, args).await,
            "books_list" => books::list(backend, args).await,
            "books_create" => books::create(backend, cache, args).await,
            "books_update" => books::update(backend, cache, args).await,
            "books_delete" => books::delete(backend, cache, args).await,
            "students_list" => students::list(backend, args).await,
            "students_find" => students::find(backend, args).await,
            "students_get" => students::get(backend, args).await,
            "students_filter" => students::filter(backend, args).await,
            "students_create" => students::create(backend, cache, args).await,
            "students_update" => students::update(backend, cache, args).await,
            "students_delete" => students::delete(backend, cache, args).await,
            "planner_ids_list" => planner::read(backend, "planner.ids_list", args).await,
            "planner_dates_get" => planner::read(backend, "planner.dates.get", args).await,
            "planner_metrics_get" => planner::read(backend, "planner.metrics.get", args).await,
            "planner_plan_get" => planner::read(backend, "planner.plan.get", args).await,
            "planner_dates_propose" => planner::dates_propose(backend, cache, args).await,
            "planner_dates_confirm" => planner::confirm_dates(backend, cache, args).await,
            "planner_plan_targets" => planner::plan_targets(backend, args).await,
            "planner_plan_propose" => planner::plan_propose(backend, cache, args).await,
            "planner_plan_propose_bulk" => planner::plan_propose_bulk(backend, cache, args).await,
            "planner_plan_confirm" | "planner_plan_confirm_bulk" => {
                planner::confirm_plan(backend, cache, args).await
            }
            "planner_monthly_filter" => planner::monthly_filter(backend, args).await,
            "tools_help" => Ok(ToolOutput::Data(tools_help())),
            _ => Err(ToolFailure::bad_field("name", format!("Unknown tool '{name}'"))),
        }
    }
}
