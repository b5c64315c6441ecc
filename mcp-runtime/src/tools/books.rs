use cram_core::{BOOK_FIELDS, Effect, ErrorCode, IdArg, ToolFailure, parse_ids};
use serde_json::{Map, Value, json};

use super::args::{
    arg_optional_array, arg_optional_object, arg_optional_u64, confirm_token, limit_param,
    number_or_null, optional_scalar, required_scalar, values_differ,
};
use super::{read_get, read_post};
use crate::backend::{Backend, expect_ok};
use crate::confirm::{ConfirmCache, MutationRequest};
use crate::protocol::{Proposal, ToolOutput, confirm, propose};

const CREATE_OP: &str = "books.create";
const UPDATE_OP: &str = "books.update";
const DELETE_OP: &str = "books.delete";

const QUERY_ALIASES: &[&str] = &["query", "q", "text"];
const BOOK_ID_ALIASES: &[&str] = &["book_id", "id"];

pub async fn find(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let query = required_scalar(args, "query", QUERY_ALIASES)?;
    let mut params = vec![("query".to_string(), query)];
    params.extend(limit_param(args)?);
    read_get(backend, "books.find", &params).await
}

pub async fn get(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let raw = args
        .get("book_ids")
        .filter(|v| !v.is_null())
        .or_else(|| args.get("book_id"))
        .ok_or_else(|| ToolFailure::bad_field("book_id", "book_id or book_ids is required"))?;

    let params: Vec<(String, String)> = match parse_ids(raw, BOOK_ID_ALIASES) {
        IdArg::Scalar(id) => vec![("book_id".to_string(), id)],
        IdArg::List(ids) if ids.len() == 1 => vec![("book_id".to_string(), ids[0].clone())],
        IdArg::List(ids) => ids.into_iter().map(|id| ("book_ids".to_string(), id)).collect(),
        IdArg::Invalid(reason) => return Err(ToolFailure::bad_field("book_id", reason)),
    };
    read_get(backend, "books.get", &params).await
}

/// Predicate body shared with `students_filter`: keys are sent as given.
pub(crate) fn filter_body(args: &Map<String, Value>) -> Result<Map<String, Value>, ToolFailure> {
    let mut body = Map::new();
    for key in ["where", "contains"] {
        if let Some(predicate) = arg_optional_object(args, key)? {
            body.insert(key.to_string(), Value::Object(predicate.clone()));
        }
    }
    if let Some(limit) = arg_optional_u64(args, "limit")?.filter(|limit| *limit > 0) {
        body.insert("limit".to_string(), json!(limit));
    }
    Ok(body)
}

pub async fn filter(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    read_post(backend, "books.filter", filter_body(args)?).await
}

/// Unfiltered `books.filter` projected down to `{id, title, subject}`.
pub async fn list(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let mut body = filter_body(args)?;
    body.retain(|key, _| key == "limit");
    body.insert("op".to_string(), json!("books.filter"));
    let raw = backend.post(Value::Object(body)).await?;
    let reply = expect_ok("books.filter", raw)?;

    let books: Vec<Value> = reply
        .data
        .get("books")
        .and_then(Value::as_array)
        .map(|books| {
            books
                .iter()
                .map(|book| {
                    json!({
                        "id": book.get("id").cloned().unwrap_or(Value::Null),
                        "title": book.get("title").cloned().unwrap_or(Value::Null),
                        "subject": book.get("subject").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let count = books.len();
    Ok(ToolOutput::Data(json!({ "books": books, "count": count })))
}

/// Validate one book field value and convert it to the shape the backend stores.
fn book_value(field: &str, value: &Value) -> Result<Value, ToolFailure> {
    match field {
        "title" | "subject" => match value {
            Value::String(s) if !s.trim().is_empty() => Ok(Value::String(s.trim().to_string())),
            _ => Err(ToolFailure::bad_field(field, format!("'{field}' must be a non-empty string"))),
        },
        "unit_load" => number_or_null(value, field),
        "monthly_goal" => match value {
            Value::Null | Value::String(_) => Ok(value.clone()),
            Value::Object(goal) => Ok(goal.get("text").cloned().unwrap_or(Value::Null)),
            _ => Err(ToolFailure::bad_field(field, "'monthly_goal' must be a string")),
        },
        "chapters" => match value {
            Value::Array(items) if items.iter().all(Value::is_object) => Ok(value.clone()),
            _ => Err(ToolFailure::bad_field(field, "'chapters' must be an array of objects")),
        },
        _ => Ok(value.clone()),
    }
}

/// Current value of `field` in a `books.get` record.
fn current_value(book: &Value, field: &str) -> Value {
    let value = match field {
        "monthly_goal" => book.pointer("/monthly_goal/text"),
        "chapters" => book.pointer("/structure/chapters"),
        other => book.get(other),
    };
    value.cloned().unwrap_or(Value::Null)
}

async fn fetch_book(backend: &dyn Backend, book_id: &str) -> Result<Value, ToolFailure> {
    let raw = backend
        .get("books.get", &[("book_id".to_string(), book_id.to_string())])
        .await?;
    let reply = expect_ok("books.get", raw)?;
    reply
        .data
        .get("book")
        .filter(|book| book.is_object())
        .cloned()
        .ok_or_else(|| {
            ToolFailure::new(ErrorCode::BadJson, "books.get reply has no book record")
                .with_details(json!({ "book_id": book_id }))
        })
}

pub async fn create(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    if let Some(token) = confirm_token(args) {
        return confirm(cache, backend, &token, CREATE_OP).await;
    }

    let mut fields = Map::new();
    for field in ["title", "subject"] {
        let value = args
            .get(field)
            .ok_or_else(|| ToolFailure::bad_field(field, format!("{field} is required")))?;
        fields.insert(field.to_string(), book_value(field, value)?);
    }
    for field in ["unit_load", "monthly_goal"] {
        if let Some(value) = args.get(field) {
            fields.insert(field.to_string(), book_value(field, value)?);
        }
    }
    if let Some(chapters) = arg_optional_array(args, "chapters")? {
        fields.insert(
            "chapters".to_string(),
            book_value("chapters", &Value::Array(chapters.clone()))?,
        );
    }
    if let Some(prefix) = optional_scalar(args, "id_prefix", &[]) {
        fields.insert("id_prefix".to_string(), Value::String(prefix));
    }

    let effects = fields
        .iter()
        .filter(|(field, _)| field.as_str() != "id_prefix")
        .map(|(field, value)| Effect::new(field.clone(), Value::Null, value.clone()))
        .collect();
    let preview = Value::Object(fields.clone());
    let proposal = Proposal::new(MutationRequest::new(CREATE_OP, fields), effects)
        .with_preview("book", preview);
    Ok(ToolOutput::Data(propose(cache, proposal)))
}

pub async fn update(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    if let Some(token) = confirm_token(args) {
        return confirm(cache, backend, &token, UPDATE_OP).await;
    }

    let book_id = required_scalar(args, "book_id", BOOK_ID_ALIASES)?;
    let updates = arg_optional_object(args, "updates")?
        .filter(|updates| !updates.is_empty())
        .ok_or_else(|| ToolFailure::bad_field("updates", "updates must be a non-empty object"))?;
    let canonical = BOOK_FIELDS.canonicalize(updates)?;
    let mut fields = Map::new();
    for (field, value) in &canonical {
        fields.insert(field.clone(), book_value(field, value)?);
    }

    let book = fetch_book(backend, &book_id).await?;
    let effects: Vec<Effect> = fields
        .iter()
        .map(|(field, after)| (field, current_value(&book, field), after))
        .filter(|(_, before, after)| values_differ(before, after))
        .map(|(field, before, after)| Effect::new(field.clone(), before, after.clone()))
        .collect();

    if effects.is_empty() {
        return Ok(ToolOutput::Data(json!({
            "requires_confirmation": false,
            "book_id": book_id,
            "effects": [],
            "message": "no field would change",
        })));
    }

    let mut payload = Map::new();
    payload.insert("book_id".to_string(), Value::String(book_id.clone()));
    for effect in &effects {
        if let Some(value) = fields.get(&effect.location) {
            payload.insert(effect.location.clone(), value.clone());
        }
    }
    let proposal = Proposal::new(MutationRequest::new(UPDATE_OP, payload), effects)
        .with_preview("book_id", Value::String(book_id));
    Ok(ToolOutput::Data(propose(cache, proposal)))
}

pub async fn delete(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    if let Some(token) = confirm_token(args) {
        return confirm(cache, backend, &token, DELETE_OP).await;
    }

    let book_id = required_scalar(args, "book_id", BOOK_ID_ALIASES)?;
    let book = fetch_book(backend, &book_id).await?;
    let chapter_rows = book
        .pointer("/structure/chapters")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let summary = json!({
        "id": book.get("id").cloned().unwrap_or_else(|| Value::String(book_id.clone())),
        "title": current_value(&book, "title"),
        "subject": current_value(&book, "subject"),
    });

    let mut payload = Map::new();
    payload.insert("book_id".to_string(), Value::String(book_id.clone()));
    let proposal = Proposal::new(
        MutationRequest::new(DELETE_OP, payload),
        vec![Effect::new(format!("book:{book_id}"), summary, Value::Null)],
    )
    .with_preview("book_id", Value::String(book_id))
    .with_preview("chapter_rows", json!(chapter_rows));
    Ok(ToolOutput::Data(propose(cache, proposal)))
}
