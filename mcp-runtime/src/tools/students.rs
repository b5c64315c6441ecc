use cram_core::{
    Effect, ErrorCode, IdArg, STUDENT_FIELDS, ToolFailure, coerce_scalar, header_key, parse_ids,
};
use serde_json::{Map, Value, json};

use super::args::{
    arg_bool, arg_optional_object, confirm_token, limit_param, optional_scalar, required_scalar,
    values_differ,
};
use super::books::filter_body;
use super::{read_get, read_post};
use crate::backend::{Backend, expect_ok};
use crate::confirm::{ConfirmCache, MutationRequest};
use crate::protocol::{Proposal, ToolOutput, confirm, propose};

const CREATE_OP: &str = "students.create";
const UPDATE_OP: &str = "students.update";
const DELETE_OP: &str = "students.delete";

const STUDENT_ID_ALIASES: &[&str] = &["student_id", "id"];
const NAMED_FIELDS: [&str; 5] = ["name", "grade", "planner_sheet_id", "meeting_doc_id", "tags"];

pub async fn list(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let mut params = limit_param(args)?;
    if arg_bool(args, "include_all", false)? {
        params.push(("include_all".to_string(), "true".to_string()));
    }
    read_get(backend, "students.list", &params).await
}

pub async fn find(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let query = required_scalar(args, "query", &["query", "q", "text", "name"])?;
    let mut params = vec![("query".to_string(), query)];
    params.extend(limit_param(args)?);
    read_get(backend, "students.find", &params).await
}

pub async fn get(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let raw = args
        .get("student_ids")
        .filter(|v| !v.is_null())
        .or_else(|| args.get("student_id"))
        .ok_or_else(|| ToolFailure::bad_field("student_id", "student_id or student_ids is required"))?;

    let params: Vec<(String, String)> = match parse_ids(raw, STUDENT_ID_ALIASES) {
        IdArg::Scalar(id) => vec![("student_id".to_string(), id)],
        IdArg::List(ids) => ids.into_iter().map(|id| ("student_ids".to_string(), id)).collect(),
        IdArg::Invalid(reason) => return Err(ToolFailure::bad_field("student_id", reason)),
    };
    read_get(backend, "students.get", &params).await
}

pub async fn filter(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    read_post(backend, "students.filter", filter_body(args)?).await
}

async fn fetch_student(backend: &dyn Backend, student_id: &str) -> Result<Value, ToolFailure> {
    let raw = backend
        .get("students.get", &[("student_id".to_string(), student_id.to_string())])
        .await?;
    let reply = expect_ok("students.get", raw)?;
    reply
        .data
        .get("student")
        .filter(|student| student.is_object())
        .cloned()
        .ok_or_else(|| {
            ToolFailure::new(ErrorCode::BadJson, "students.get reply has no student record")
                .with_details(json!({ "student_id": student_id }))
        })
}

/// Sheet header an update key writes to, matched on the student's own row.
///
/// A key naming a header directly wins; otherwise a known field alias is
/// tried against every header of the row.
fn header_for(row: &Map<String, Value>, key: &str) -> Option<String> {
    let wanted = header_key(key);
    if let Some(header) = row.keys().find(|header| header_key(header) == wanted) {
        return Some(header.clone());
    }
    let canonical = STUDENT_FIELDS.canonical(key)?;
    let aliases: Vec<String> = STUDENT_FIELDS
        .aliases_of(canonical)
        .iter()
        .map(|alias| header_key(alias))
        .collect();
    row.keys()
        .find(|header| aliases.contains(&header_key(header)))
        .cloned()
}

/// Text of a named create argument; `tags` may also be given as a list.
fn named_field(args: &Map<String, Value>, field: &str) -> Result<Option<String>, ToolFailure> {
    let value = match args.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    if let (Value::Array(items), "tags") = (value, field) {
        let tags = items
            .iter()
            .map(|item| coerce_scalar(item, &[]))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ToolFailure::bad_field(field, "tags must be a string or a list of strings"))?;
        return Ok(Some(tags.join(",")));
    }
    coerce_scalar(value, &[])
        .map(Some)
        .ok_or_else(|| ToolFailure::bad_field(field, format!("{field} must be a string or number")))
}

pub async fn create(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    if let Some(token) = confirm_token(args) {
        return confirm(cache, backend, &token, CREATE_OP).await;
    }

    let mut record = arg_optional_object(args, "record")?.cloned().unwrap_or_default();
    for field in NAMED_FIELDS {
        let Some(value) = named_field(args, field)? else {
            continue;
        };
        let already_set = record
            .keys()
            .any(|key| STUDENT_FIELDS.canonical(key) == Some(field));
        if !already_set {
            record.insert(field.to_string(), Value::String(value));
        }
    }
    record.retain(|_, value| !matches!(value, Value::Null) && value.as_str() != Some(""));
    if record.is_empty() {
        return Err(ToolFailure::bad_field(
            "record",
            "record or at least one of name, grade, planner_sheet_id, meeting_doc_id, tags is required",
        ));
    }

    let effects = record
        .iter()
        .map(|(key, value)| Effect::new(key.clone(), Value::Null, value.clone()))
        .collect();
    let mut payload = Map::new();
    payload.insert("record".to_string(), Value::Object(record));
    if let Some(prefix) = optional_scalar(args, "id_prefix", &[]) {
        payload.insert("id_prefix".to_string(), Value::String(prefix));
    }
    let proposal = Proposal::new(MutationRequest::new(CREATE_OP, payload), effects);
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

    let student_id = required_scalar(args, "student_id", STUDENT_ID_ALIASES)?;
    let updates = arg_optional_object(args, "updates")?
        .filter(|updates| !updates.is_empty())
        .ok_or_else(|| ToolFailure::bad_field("updates", "updates must be a non-empty object"))?;
    // Routing keys are rejected here; the canonical names are resolved per row below.
    STUDENT_FIELDS.canonicalize(updates)?;

    let student = fetch_student(backend, &student_id).await?;
    let row = student.get("row").and_then(Value::as_object).cloned().unwrap_or_default();

    let mut payload = Map::new();
    payload.insert("student_id".to_string(), Value::String(student_id.clone()));
    let mut effects = Vec::new();
    let mut unmatched = Vec::new();
    for (key, after) in updates {
        let Some(header) = header_for(&row, key) else {
            unmatched.push(Value::String(key.clone()));
            continue;
        };
        let before = row.get(&header).cloned().unwrap_or(Value::Null);
        if values_differ(&before, after) {
            effects.push(Effect::new(header.clone(), before, after.clone()));
            payload.insert(header, after.clone());
        }
    }

    if effects.is_empty() {
        return Ok(ToolOutput::Data(json!({
            "requires_confirmation": false,
            "student_id": student_id,
            "effects": [],
            "unmatched": unmatched,
            "message": "no column would change",
        })));
    }

    let proposal = Proposal::new(MutationRequest::new(UPDATE_OP, payload), effects)
        .with_preview("student_id", Value::String(student_id))
        .with_preview("unmatched", Value::Array(unmatched));
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

    let student_id = required_scalar(args, "student_id", STUDENT_ID_ALIASES)?;
    let student = fetch_student(backend, &student_id).await?;
    let summary = json!({
        "id": student.get("id").cloned().unwrap_or_else(|| Value::String(student_id.clone())),
        "name": student.get("name").cloned().unwrap_or(Value::Null),
        "grade": student.get("grade").cloned().unwrap_or(Value::Null),
    });

    let mut payload = Map::new();
    payload.insert("student_id".to_string(), Value::String(student_id.clone()));
    let proposal = Proposal::new(
        MutationRequest::new(DELETE_OP, payload),
        vec![Effect::new(format!("student:{student_id}"), summary, Value::Null)],
    )
    .with_preview("student_id", Value::String(student_id));
    Ok(ToolOutput::Data(propose(cache, proposal)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::FakeBackend;
    use crate::tools::ToolRouter;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn router() -> (Arc<FakeBackend>, ToolRouter) {
        let backend = Arc::new(FakeBackend::new());
        let router = ToolRouter::new(backend.clone(), Arc::new(ConfirmCache::new()));
        (backend, router)
    }

    fn student_reply() -> Value {
        json!({"ok": true, "op": "students.get", "data": {"student": {
            "id": "s001",
            "name": "山田太郎",
            "grade": "高2",
            "planner_sheet_id": "1AbC",
            "meeting_doc_id": "",
            "tags": "",
            "row": {"生徒ID": "s001", "氏名": "山田太郎", "学年": "高2", "スピードプランナーID": "1AbC", "部活": "野球"}
        }}})
    }

    #[test]
    fn header_for_prefers_exact_headers_then_aliases() {
        let row = args(json!({"生徒ID": "s001", "氏名": "山田", "学年": "高2", "部活": ""}));
        assert_eq!(header_for(&row, "学年").as_deref(), Some("学年"));
        assert_eq!(header_for(&row, "grade").as_deref(), Some("学年"));
        assert_eq!(header_for(&row, "NAME").as_deref(), Some("氏名"));
        assert_eq!(header_for(&row, "部 活").as_deref(), Some("部活"));
        assert_eq!(header_for(&row, "tags"), None);
    }

    #[tokio::test]
    async fn update_writes_to_real_headers_and_reports_unmatched_keys() {
        let (backend, router) = router();
        backend.on_get("students.get", student_reply());
        backend.on_post("students.update", json!({"ok": true, "op": "students.update", "data": {"updated": true}}));

        let preview = router
            .call(
                "students_update",
                &args(json!({"student_id": "s001", "updates": {"grade": "高3", "氏名": "山田太郎", "色": "青"}})),
            )
            .await;
        assert_eq!(
            preview["data"]["effects"],
            json!([{"location": "学年", "before": "高2", "after": "高3"}])
        );
        assert_eq!(preview["data"]["unmatched"], json!(["色"]));
        let token = preview["data"]["confirm_token"].as_str().unwrap().to_string();

        let out = router.call("students_update", &args(json!({"confirm_token": token}))).await;
        assert_eq!(out["data"]["updated"], true);
        assert_eq!(
            backend.posts(),
            vec![json!({"op": "students.update", "student_id": "s001", "学年": "高3"})]
        );
    }

    #[tokio::test]
    async fn delete_round_trip_and_replay() {
        let (backend, router) = router();
        backend.on_get("students.get", student_reply());
        backend.on_post("students.delete", json!({"ok": true, "data": {"deleted": true}}));

        let preview = router.call("students_delete", &args(json!({"student_id": "'s001'"}))).await;
        assert_eq!(preview["data"]["effects"][0]["location"], "student:s001");
        assert_eq!(preview["data"]["effects"][0]["before"]["name"], "山田太郎");
        let token = preview["data"]["confirm_token"].as_str().unwrap().to_string();

        let first = router.call("students_delete", &args(json!({"confirm_token": token.clone()}))).await;
        assert_eq!(first["ok"], true);
        assert_eq!(first["op"], "students.delete");
        let replay = router.call("students_delete", &args(json!({"confirm_token": token}))).await;
        assert_eq!(replay["error"]["code"], "CONFIRM_EXPIRED");
        assert_eq!(backend.posts(), vec![json!({"op": "students.delete", "student_id": "s001"})]);
    }

    #[tokio::test]
    async fn token_from_another_tool_is_a_mismatch() {
        let (backend, router) = router();
        backend.on_get("students.get", student_reply());
        let preview = router.call("students_delete", &args(json!({"student_id": "s001"}))).await;
        let token = preview["data"]["confirm_token"].as_str().unwrap().to_string();

        let out = router.call("books_delete", &args(json!({"confirm_token": token.clone()}))).await;
        assert_eq!(out["error"]["code"], "CONFIRM_MISMATCH");
        assert_eq!(router.cache().len(), 1);
        assert!(backend.posts().is_empty());
    }

    #[tokio::test]
    async fn create_merges_named_fields_into_record() {
        let (backend, router) = router();
        backend.on_post("students.create", json!({"ok": true, "data": {"id": "s042", "created": true}}));

        let preview = router
            .call(
                "students_create",
                &args(json!({"record": {"氏名": "佐藤花子"}, "name": "ignored", "grade": "高1", "id_prefix": "s"})),
            )
            .await;
        assert_eq!(preview["data"]["requires_confirmation"], true);
        let token = preview["data"]["confirm_token"].as_str().unwrap().to_string();
        router.call("students_create", &args(json!({"confirm_token": token}))).await;

        assert_eq!(
            backend.posts(),
            vec![json!({
                "op": "students.create",
                "record": {"氏名": "佐藤花子", "grade": "高1"},
                "id_prefix": "s"
            })]
        );
    }

    #[tokio::test]
    async fn create_joins_list_tags_and_rejects_structured_fields() {
        let (backend, router) = router();
        let preview = router
            .call("students_create", &args(json!({"name": "山田", "tags": ["受験", "理系"]})))
            .await;
        assert_eq!(preview["ok"], true);
        let effects = preview["data"]["effects"].as_array().unwrap();
        assert!(
            effects
                .iter()
                .any(|effect| effect["location"] == "tags" && effect["after"] == "受験,理系")
        );

        let cached = router.cache().len();
        let out = router
            .call("students_create", &args(json!({"name": "山田", "grade": {"year": 2}})))
            .await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        assert_eq!(out["error"]["details"]["field"], "grade");
        let out = router
            .call("students_create", &args(json!({"name": "山田", "tags": [["受験"]]})))
            .await;
        assert_eq!(out["error"]["details"]["field"], "tags");
        assert_eq!(router.cache().len(), cached);
        assert!(backend.posts().is_empty());
    }

    #[tokio::test]
    async fn empty_create_and_missing_ids_fail_locally() {
        let (backend, router) = router();
        let out = router.call("students_create", &args(json!({"record": {"氏名": ""}}))).await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        let out = router.call("students_update", &args(json!({"updates": {"grade": "高3"}}))).await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        assert_eq!(out["error"]["details"]["field"], "student_id");
        let out = router.call("students_get", &args(json!({}))).await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        assert!(backend.gets().is_empty());
        assert!(backend.posts().is_empty());
    }

    #[tokio::test]
    async fn list_forwards_limit_and_include_all() {
        let (backend, router) = router();
        backend.on_get("students.list", json!({"ok": true, "op": "students.list", "data": {"students": [], "count": 0}}));
        let out = router
            .call("students_list", &args(json!({"limit": "5", "include_all": true})))
            .await;
        assert_eq!(out["ok"], true);
        assert_eq!(
            backend.gets()[0].1,
            vec![
                ("limit".to_string(), "5".to_string()),
                ("include_all".to_string(), "true".to_string()),
            ]
        );
    }
}
