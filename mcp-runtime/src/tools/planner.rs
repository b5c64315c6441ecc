//! Weekly planner sheet tools.
//!
//! The backend exposes raw cell reads and two writes (the first week start
//! date and one plan cell). Row resolution, precondition checks and the
//! overwrite policy live here, in the propose step.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use cram_core::{Effect, ErrorCode, ToolFailure};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use super::args::{arg_bool, arg_optional_array, arg_optional_u64, confirm_token, optional_scalar};
use super::read_get;
use crate::backend::{Backend, expect_ok};
use crate::confirm::{ConfirmCache, MutationRequest};
use crate::protocol::{Proposal, ToolOutput, confirm, propose, propose_bulk};

pub const PLAN_TEXT_MAX: usize = 52;

const PLAN_OP: &str = "planner.plan.set";
const DATES_OP: &str = "planner.dates.set";

const FIRST_ROW: u64 = 4;
const LAST_ROW: u64 = 30;
const WEEKS: u8 = 5;
/// Per week: plan text column and weekly minutes column.
const PLAN_COLUMNS: [&str; 5] = ["H", "P", "X", "AF", "AN"];
const MINUTES_COLUMNS: [&str; 5] = ["E", "M", "U", "AC", "AK"];

fn column(columns: &[&'static str; 5], week_index: u8) -> &'static str {
    // week_index is validated to 1..=5 before any lookup
    columns[usize::from(week_index.clamp(1, WEEKS)) - 1]
}

fn plan_cell(week_index: u8, row: u64) -> String {
    format!("{}{row}", column(&PLAN_COLUMNS, week_index))
}

/// `student_id` or `spreadsheet_id`; the spreadsheet id wins when both are given.
fn target(args: &Map<String, Value>) -> Result<Vec<(String, String)>, ToolFailure> {
    if let Some(id) = optional_scalar(args, "spreadsheet_id", &[]) {
        return Ok(vec![("spreadsheet_id".to_string(), id)]);
    }
    if let Some(id) = optional_scalar(args, "student_id", &[]) {
        return Ok(vec![("student_id".to_string(), id)]);
    }
    Err(ToolFailure::bad_field(
        "student_id",
        "student_id or spreadsheet_id is required",
    ))
}

fn target_fields(target: &[(String, String)]) -> Map<String, Value> {
    target
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

pub async fn read(backend: &dyn Backend, op: &str, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let target = target(args)?;
    read_get(backend, op, &target).await
}

async fn read_data<T: DeserializeOwned>(
    backend: &dyn Backend,
    op: &str,
    params: &[(String, String)],
) -> Result<T, ToolFailure> {
    let raw = backend.get(op, params).await?;
    let reply = expect_ok(op, raw)?;
    serde_json::from_value(reply.data).map_err(|err| {
        ToolFailure::new(ErrorCode::BadJson, format!("{op}: unexpected reply shape: {err}"))
    })
}

#[derive(Debug, Deserialize)]
struct IdsList {
    #[serde(default)]
    items: Vec<BookRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct BookRow {
    row: u64,
    #[serde(default)]
    book_id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct Weeks<T> {
    #[serde(default = "Vec::new")]
    weeks: Vec<Week<T>>,
}

#[derive(Debug, Deserialize)]
struct Week<T> {
    week_index: u8,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct MinutesCell {
    row: u64,
    weekly_minutes: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PlanText {
    row: u64,
    #[serde(default)]
    plan_text: String,
}

/// Rows, weekly minutes and plan texts of one planner, read together.
#[derive(Debug)]
struct PlannerSnapshot {
    rows: Vec<BookRow>,
    minutes: HashMap<(u8, u64), f64>,
    plans: HashMap<(u8, u64), String>,
}

impl PlannerSnapshot {
    async fn read(backend: &dyn Backend, target: &[(String, String)]) -> Result<Self, ToolFailure> {
        let ids: IdsList = read_data(backend, "planner.ids_list", target).await?;
        let metrics: Weeks<MinutesCell> = read_data(backend, "planner.metrics.get", target).await?;
        let plan: Weeks<PlanText> = read_data(backend, "planner.plan.get", target).await?;

        let minutes = metrics
            .weeks
            .into_iter()
            .flat_map(|week| {
                let index = week.week_index;
                week.items
                    .into_iter()
                    .filter_map(move |cell| cell.weekly_minutes.map(|m| ((index, cell.row), m)))
            })
            .collect();
        let plans = plan
            .weeks
            .into_iter()
            .flat_map(|week| {
                let index = week.week_index;
                week.items
                    .into_iter()
                    .map(move |cell| ((index, cell.row), cell.plan_text))
            })
            .collect();
        Ok(Self {
            rows: ids.items,
            minutes,
            plans,
        })
    }

    fn book_row(&self, row: u64) -> Option<&BookRow> {
        self.rows.iter().find(|r| r.row == row)
    }

    fn row_of_book(&self, book_id: &str) -> Option<&BookRow> {
        self.rows.iter().find(|r| r.book_id == book_id)
    }

    fn plan_text(&self, week_index: u8, row: u64) -> &str {
        self.plans
            .get(&(week_index, row))
            .map(|text| text.trim())
            .unwrap_or_default()
    }
}

/// One requested plan cell write, validated but not yet resolved to a row.
#[derive(Debug, Clone)]
struct PlanWrite {
    week_index: u8,
    row: Option<u64>,
    book_id: Option<String>,
    plan_text: String,
    overwrite: bool,
}

impl PlanWrite {
    fn parse(args: &Map<String, Value>) -> Result<Self, ToolFailure> {
        let week_index = arg_optional_u64(args, "week_index")?
            .ok_or_else(|| ToolFailure::bad_field("week_index", "week_index is required"))?;
        if !(1..=u64::from(WEEKS)).contains(&week_index) {
            return Err(ToolFailure::bad_field("week_index", "week_index must be 1..5"));
        }
        let row = arg_optional_u64(args, "row")?;
        if let Some(row) = row {
            if !(FIRST_ROW..=LAST_ROW).contains(&row) {
                return Err(ToolFailure::bad_field(
                    "row",
                    format!("row must be {FIRST_ROW}..{LAST_ROW}"),
                ));
            }
        }
        let book_id = optional_scalar(args, "book_id", &["book_id", "id"]);
        if row.is_none() && book_id.is_none() {
            return Err(ToolFailure::bad_field("row", "row or book_id is required"));
        }
        let plan_text = match args.get("plan_text") {
            Some(Value::String(text)) => text.trim().to_string(),
            _ => return Err(ToolFailure::bad_field("plan_text", "plan_text must be a string")),
        };
        if plan_text.chars().count() > PLAN_TEXT_MAX {
            return Err(ToolFailure::bad_field(
                "plan_text",
                format!("plan_text must be at most {PLAN_TEXT_MAX} characters"),
            ));
        }
        Ok(Self {
            week_index: week_index as u8,
            row,
            book_id,
            plan_text,
            overwrite: arg_bool(args, "overwrite", false)?,
        })
    }

    /// Resolve the row against the snapshot and check the write is allowed.
    fn resolve(&self, snapshot: &PlannerSnapshot) -> Result<(u64, String), ToolFailure> {
        let book_row = match (self.row, self.book_id.as_deref()) {
            (Some(row), _) => snapshot.book_row(row).ok_or_else(|| {
                ToolFailure::bad_field("row", format!("row {row} has no book in column A"))
            })?,
            (None, Some(book_id)) => snapshot.row_of_book(book_id).ok_or_else(|| {
                ToolFailure::bad_field("book_id", format!("book '{book_id}' is not on the planner"))
            })?,
            (None, None) => return Err(ToolFailure::bad_field("row", "row or book_id is required")),
        };
        let row = book_row.row;
        if !snapshot.minutes.contains_key(&(self.week_index, row)) {
            return Err(ToolFailure::bad_field(
                "week_index",
                format!(
                    "weekly minutes cell {}{row} is empty",
                    column(&MINUTES_COLUMNS, self.week_index)
                ),
            ));
        }
        let current = snapshot.plan_text(self.week_index, row).to_string();
        if !current.is_empty() && !self.overwrite {
            return Err(ToolFailure::new(
                ErrorCode::AlreadyExists,
                "cell already has text; set overwrite=true to replace",
            )
            .with_details(json!({
                "cell": plan_cell(self.week_index, row),
                "current": current,
            })));
        }
        Ok((row, current))
    }

    fn proposal(&self, target: &[(String, String)], row: u64, before: String) -> Proposal {
        let mut fields = target_fields(target);
        fields.insert("week_index".to_string(), json!(self.week_index));
        fields.insert("row".to_string(), json!(row));
        fields.insert("plan_text".to_string(), Value::String(self.plan_text.clone()));
        fields.insert("overwrite".to_string(), Value::Bool(self.overwrite));
        let cell = plan_cell(self.week_index, row);
        Proposal::new(
            MutationRequest::new(PLAN_OP, fields),
            vec![Effect::new(
                cell.clone(),
                Value::String(before),
                Value::String(self.plan_text.clone()),
            )],
        )
        .with_preview("cell", Value::String(cell))
    }
}

fn at_index(mut failure: ToolFailure, index: usize) -> ToolFailure {
    let mut details = match failure.details.take() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    details.insert("index".to_string(), json!(index));
    failure.details = Some(Value::Object(details));
    failure
}

pub async fn plan_propose(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    if args.get("items").is_some_and(|items| !items.is_null()) {
        return plan_propose_bulk(backend, cache, args).await;
    }
    let target = target(args)?;
    let write = PlanWrite::parse(args)?;
    let snapshot = PlannerSnapshot::read(backend, &target).await?;
    let (row, before) = write.resolve(&snapshot)?;
    Ok(ToolOutput::Data(propose(cache, write.proposal(&target, row, before))))
}

/// Every item must be writable or nothing is proposed.
pub async fn plan_propose_bulk(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    let target = target(args)?;
    let items = arg_optional_array(args, "items")?
        .filter(|items| !items.is_empty())
        .ok_or_else(|| ToolFailure::bad_field("items", "items must be a non-empty array"))?;
    let writes = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let item = item
                .as_object()
                .ok_or_else(|| ToolFailure::bad_field("items", "each item must be an object"))
                .map_err(|failure| at_index(failure, index))?;
            PlanWrite::parse(item).map_err(|failure| at_index(failure, index))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let snapshot = PlannerSnapshot::read(backend, &target).await?;
    let mut seen = HashSet::new();
    let mut proposals = Vec::with_capacity(writes.len());
    for (index, write) in writes.iter().enumerate() {
        let (row, before) = write.resolve(&snapshot).map_err(|failure| at_index(failure, index))?;
        if !seen.insert((write.week_index, row)) {
            return Err(at_index(
                ToolFailure::bad_field(
                    "items",
                    format!("cell {} appears more than once", plan_cell(write.week_index, row)),
                ),
                index,
            ));
        }
        proposals.push(write.proposal(&target, row, before));
    }
    Ok(ToolOutput::Data(propose_bulk(cache, PLAN_OP, proposals)))
}

async fn confirm_only(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
    op: &str,
) -> Result<ToolOutput, ToolFailure> {
    let token = confirm_token(args)
        .ok_or_else(|| ToolFailure::bad_field("confirm_token", "confirm_token is required"))?;
    confirm(cache, backend, &token, op).await
}

pub async fn confirm_plan(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    confirm_only(backend, cache, args, PLAN_OP).await
}

pub async fn confirm_dates(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    confirm_only(backend, cache, args, DATES_OP).await
}

pub async fn dates_propose(
    backend: &dyn Backend,
    cache: &ConfirmCache,
    args: &Map<String, Value>,
) -> Result<ToolOutput, ToolFailure> {
    let target = target(args)?;
    let raw_date = optional_scalar(args, "start_date", &["start_date", "date"])
        .ok_or_else(|| ToolFailure::bad_field("start_date", "start_date is required (YYYY-MM-DD)"))?;
    let start_date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d").map_err(|_| {
        ToolFailure::bad_field("start_date", format!("'{raw_date}' is not a YYYY-MM-DD date"))
    })?;

    #[derive(Deserialize)]
    struct WeekStarts {
        #[serde(default)]
        week_starts: Vec<Value>,
    }
    let current: WeekStarts = read_data(backend, "planner.dates.get", &target).await?;
    let before = current.week_starts.first().cloned().unwrap_or(Value::Null);

    let mut fields = target_fields(&target);
    let start_date = start_date.format("%Y-%m-%d").to_string();
    fields.insert("start_date".to_string(), Value::String(start_date.clone()));
    let proposal = Proposal::new(
        MutationRequest::new(DATES_OP, fields),
        vec![Effect::new("D1", before, Value::String(start_date))],
    )
    .with_preview("week_starts", Value::Array(current.week_starts));
    Ok(ToolOutput::Data(propose(cache, proposal)))
}

/// Empty plan cells that can be written: the row has a book and the week has minutes.
pub async fn plan_targets(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let target = target(args)?;
    let snapshot = PlannerSnapshot::read(backend, &target).await?;

    let mut targets = Vec::new();
    for book in snapshot.rows.iter().filter(|r| !r.book_id.trim().is_empty()) {
        for week_index in 1..=WEEKS {
            let Some(minutes) = snapshot.minutes.get(&(week_index, book.row)) else {
                continue;
            };
            if !snapshot.plan_text(week_index, book.row).is_empty() {
                continue;
            }
            targets.push(json!({
                "week_index": week_index,
                "row": book.row,
                "book_id": book.book_id,
                "title": book.title,
                "cell": plan_cell(week_index, book.row),
                "weekly_minutes": minutes,
            }));
        }
    }
    Ok(ToolOutput::Data(json!({ "count": targets.len(), "targets": targets })))
}

/// Two-digit year: 2025 and 25 both mean 25.
fn two_digit_year(value: &Value) -> Option<u64> {
    let year = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    match year {
        0..=99 => Some(year),
        2000..=2099 => Some(year - 2000),
        _ => None,
    }
}

pub async fn monthly_filter(backend: &dyn Backend, args: &Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
    let mut params = target(args)?;
    let year = args
        .get("year")
        .and_then(two_digit_year)
        .ok_or_else(|| ToolFailure::bad_field("year", "year must be 2 or 4 digits (e.g. 25 or 2025)"))?;
    let month = arg_optional_u64(args, "month")?
        .filter(|month| (1..=12).contains(month))
        .ok_or_else(|| ToolFailure::bad_field("month", "month must be 1..12"))?;
    params.push(("year".to_string(), year.to_string()));
    params.push(("month".to_string(), month.to_string()));
    read_get(backend, "planner.monthly.filter", &params).await
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

    #[test]
    fn week_replies_tolerate_missing_lists() {
        let metrics: Weeks<MinutesCell> =
            serde_json::from_value(json!({"weeks": [{"week_index": 1}]})).unwrap();
        assert_eq!(metrics.weeks[0].week_index, 1);
        assert!(metrics.weeks[0].items.is_empty());
        let plan: Weeks<PlanText> = serde_json::from_value(json!({})).unwrap();
        assert!(plan.weeks.is_empty());
    }

    #[tokio::test]
    async fn targets_read_sparse_planner_replies() {
        let backend = Arc::new(FakeBackend::new());
        backend.on_get(
            "planner.ids_list",
            json!({"ok": true, "data": {"items": [{"row": 4, "book_id": "gMB001", "title": "青チャート"}]}}),
        );
        backend.on_get(
            "planner.metrics.get",
            json!({"ok": true, "data": {"weeks": [{"week_index": 1, "items": [{"row": 4, "weekly_minutes": 30}]}, {"week_index": 2}]}}),
        );
        backend.on_get("planner.plan.get", json!({"ok": true, "data": {}}));
        let router = ToolRouter::new(backend.clone(), Arc::new(ConfirmCache::new()));

        let out = router
            .call("planner_plan_targets", &args(json!({"student_id": "s001"})))
            .await;
        assert_eq!(out["ok"], true);
        assert_eq!(out["data"]["count"], 1);
    }

    /// Rows 4 (gMB001) and 5 (gEC002); week 1 row 4 already planned, week 1 row 5 has no minutes.
    fn planner() -> (Arc<FakeBackend>, ToolRouter) {
        let backend = Arc::new(FakeBackend::new());
        backend.on_get(
            "planner.ids_list",
            json!({"ok": true, "data": {"count": 2, "items": [
                {"row": 4, "raw_code": "261gMB001", "month_code": 261, "book_id": "gMB001", "subject": "数学", "title": "青チャート"},
                {"row": 5, "raw_code": "261gEC002", "month_code": 261, "book_id": "gEC002", "subject": "英語", "title": "ターゲット1900"}
            ]}}),
        );
        backend.on_get(
            "planner.metrics.get",
            json!({"ok": true, "data": {"weeks": [
                {"week_index": 1, "column_time": "E", "items": [{"row": 4, "weekly_minutes": 120}, {"row": 5, "weekly_minutes": null}]},
                {"week_index": 2, "column_time": "M", "items": [{"row": 4, "weekly_minutes": 60}, {"row": 5, "weekly_minutes": 90}]}
            ]}}),
        );
        backend.on_get(
            "planner.plan.get",
            json!({"ok": true, "data": {"weeks": [
                {"week_index": 1, "column": "H", "items": [{"row": 4, "plan_text": "p.1-10"}, {"row": 5, "plan_text": ""}]},
                {"week_index": 2, "column": "P", "items": [{"row": 4, "plan_text": ""}, {"row": 5, "plan_text": ""}]}
            ]}}),
        );
        backend.on_post("planner.plan.set", json!({"ok": true, "data": {"updated": true}}));
        let router = ToolRouter::new(backend.clone(), Arc::new(ConfirmCache::new()));
        (backend, router)
    }

    #[tokio::test]
    async fn single_cell_propose_and_confirm() {
        let (backend, router) = planner();
        let preview = router
            .call(
                "planner_plan_propose",
                &args(json!({"student_id": "s001", "week_index": 2, "book_id": "gEC002", "plan_text": "No.1-200"})),
            )
            .await;
        assert_eq!(preview["op"], "planner.plan.set");
        assert_eq!(preview["data"]["cell"], "P5");
        assert_eq!(
            preview["data"]["effects"],
            json!([{"location": "P5", "before": "", "after": "No.1-200"}])
        );
        let token = preview["data"]["confirm_token"].as_str().unwrap().to_string();

        let out = router
            .call("planner_plan_confirm", &args(json!({"confirm_token": token, "plan_text": "changed"})))
            .await;
        assert_eq!(out["ok"], true);
        assert_eq!(
            backend.posts(),
            vec![json!({
                "op": "planner.plan.set",
                "student_id": "s001",
                "week_index": 2,
                "row": 5,
                "plan_text": "No.1-200",
                "overwrite": false
            })]
        );
    }

    #[tokio::test]
    async fn occupied_cell_needs_overwrite() {
        let (_, router) = planner();
        let base = json!({"spreadsheet_id": "1Sheet", "week_index": 1, "row": 4, "plan_text": "p.11-20"});
        let out = router.call("planner_plan_propose", &args(base.clone())).await;
        assert_eq!(out["error"]["code"], "ALREADY_EXISTS");
        assert_eq!(out["error"]["details"]["cell"], "H4");
        assert!(router.cache().is_empty());

        let mut with_overwrite = args(base);
        with_overwrite.insert("overwrite".to_string(), json!(true));
        let out = router.call("planner_plan_propose", &with_overwrite).await;
        assert_eq!(out["data"]["effects"][0]["before"], "p.1-10");
    }

    #[tokio::test]
    async fn cell_without_weekly_minutes_is_rejected() {
        let (_, router) = planner();
        let out = router
            .call(
                "planner_plan_propose",
                &args(json!({"student_id": "s001", "week_index": 1, "row": 5, "plan_text": "x"})),
            )
            .await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        assert!(out["error"]["message"].as_str().unwrap().contains("E5"));
    }

    #[tokio::test]
    async fn invalid_arguments_fail_before_reading_the_planner() {
        let (backend, router) = planner();
        let too_long = "あ".repeat(PLAN_TEXT_MAX + 1);
        let cases = [
            json!({"week_index": 1, "row": 4, "plan_text": "x"}),
            json!({"student_id": "s001", "week_index": 6, "row": 4, "plan_text": "x"}),
            json!({"student_id": "s001", "week_index": 1, "row": 31, "plan_text": "x"}),
            json!({"student_id": "s001", "week_index": 1, "plan_text": "x"}),
            json!({"student_id": "s001", "week_index": 1, "row": 4, "plan_text": too_long}),
        ];
        for case in cases {
            let out = router.call("planner_plan_propose", &args(case.clone())).await;
            assert_eq!(out["error"]["code"], "BAD_INPUT", "{case}");
        }
        assert!(backend.gets().is_empty());
    }

    #[tokio::test]
    async fn bulk_propose_is_all_or_nothing() {
        let (_, router) = planner();
        let out = router
            .call(
                "planner_plan_propose_bulk",
                &args(json!({"student_id": "s001", "items": [
                    {"week_index": 2, "row": 4, "plan_text": "a"},
                    {"week_index": 2, "book_id": "gMB001", "plan_text": "b"}
                ]})),
            )
            .await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        assert_eq!(out["error"]["details"]["index"], 1);
        assert!(router.cache().is_empty());
    }

    #[tokio::test]
    async fn bulk_confirm_reports_a_child_confirmed_on_its_own() {
        let (backend, router) = planner();
        let preview = router
            .call(
                "planner_plan_propose",
                &args(json!({"student_id": "s001", "items": [
                    {"week_index": 2, "row": 4, "plan_text": "p.11-20"},
                    {"week_index": 2, "row": 5, "plan_text": "No.1-100"}
                ]})),
            )
            .await;
        assert_eq!(preview["data"]["count"], 2);
        let parent = preview["data"]["confirm_token"].as_str().unwrap().to_string();
        let first_child = preview["data"]["children"][0]["confirm_token"]
            .as_str()
            .unwrap()
            .to_string();

        let single = router
            .call("planner_plan_confirm", &args(json!({"confirm_token": first_child})))
            .await;
        assert_eq!(single["ok"], true);

        let bulk = router
            .call("planner_plan_confirm_bulk", &args(json!({"confirm_token": parent})))
            .await;
        assert_eq!(bulk["ok"], true);
        assert_eq!(bulk["data"]["confirmed"], 1);
        assert_eq!(bulk["data"]["total"], 2);
        assert_eq!(bulk["data"]["results"][0]["error"]["code"], "CHILD_EXPIRED");
        assert_eq!(bulk["data"]["results"][1]["ok"], true);
        assert_eq!(backend.posts().len(), 2);
    }

    #[tokio::test]
    async fn targets_list_empty_cells_with_minutes() {
        let (_, router) = planner();
        let out = router
            .call("planner_plan_targets", &args(json!({"student_id": "s001"})))
            .await;
        assert_eq!(out["op"], "planner.plan.targets");
        assert_eq!(out["data"]["count"], 2);
        let cells: Vec<_> = out["data"]["targets"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["cell"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(cells, vec!["P4", "P5"]);
    }

    #[tokio::test]
    async fn dates_propose_validates_and_diffs_d1() {
        let (backend, router) = planner();
        backend.on_get(
            "planner.dates.get",
            json!({"ok": true, "data": {"week_starts": ["2025/09/01", "2025/09/08", "", "", ""]}}),
        );
        backend.on_post("planner.dates.set", json!({"ok": true, "data": {"updated": true}}));

        let bad = router
            .call("planner_dates_propose", &args(json!({"student_id": "s001", "start_date": "2025-02-30"})))
            .await;
        assert_eq!(bad["error"]["code"], "BAD_INPUT");

        let preview = router
            .call("planner_dates_propose", &args(json!({"student_id": "s001", "start_date": "2025-10-06"})))
            .await;
        assert_eq!(
            preview["data"]["effects"],
            json!([{"location": "D1", "before": "2025/09/01", "after": "2025-10-06"}])
        );
        let token = preview["data"]["confirm_token"].as_str().unwrap().to_string();

        let wrong_tool = router
            .call("planner_plan_confirm", &args(json!({"confirm_token": token.clone()})))
            .await;
        assert_eq!(wrong_tool["error"]["code"], "CONFIRM_MISMATCH");

        let out = router
            .call("planner_dates_confirm", &args(json!({"confirm_token": token})))
            .await;
        assert_eq!(out["ok"], true);
        assert_eq!(
            backend.posts(),
            vec![json!({"op": "planner.dates.set", "student_id": "s001", "start_date": "2025-10-06"})]
        );
    }

    #[tokio::test]
    async fn confirm_tools_require_a_token() {
        let (_, router) = planner();
        let out = router.call("planner_dates_confirm", &args(json!({"start_date": "2025-10-06"}))).await;
        assert_eq!(out["error"]["code"], "BAD_INPUT");
        assert_eq!(out["error"]["details"]["field"], "confirm_token");
    }

    #[test]
    fn two_digit_year_accepts_short_and_long_forms() {
        assert_eq!(two_digit_year(&json!(2025)), Some(25));
        assert_eq!(two_digit_year(&json!("25")), Some(25));
        assert_eq!(two_digit_year(&json!(1999)), None);
        assert_eq!(two_digit_year(&json!("next")), None);
    }

    #[tokio::test]
    async fn monthly_filter_sends_normalized_year() {
        let (backend, router) = planner();
        backend.on_get(
            "planner.monthly.filter",
            json!({"ok": true, "data": {"year": 25, "month": 9, "items": [], "count": 0}}),
        );
        let out = router
            .call("planner_monthly_filter", &args(json!({"student_id": "s001", "year": "2025", "month": 9})))
            .await;
        assert_eq!(out["ok"], true);
        let (op, params) = backend.gets().pop().unwrap();
        assert_eq!(op, "planner.monthly.filter");
        assert_eq!(
            params,
            vec![
                ("student_id".to_string(), "s001".to_string()),
                ("year".to_string(), "25".to_string()),
                ("month".to_string(), "9".to_string()),
            ]
        );
    }
}
