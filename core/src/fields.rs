use serde_json::{Map, Value};

use crate::error::ToolFailure;

/// Normalize a header or field name: full-width ASCII folded to half-width,
/// lowercased, all whitespace removed.
pub fn header_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Alias table for one entity: canonical backend field name and the header
/// spellings agents use for it.
#[derive(Debug)]
pub struct FieldAliases {
    pub id_field: &'static str,
    pub fields: &'static [(&'static str, &'static [&'static str])],
}

pub const BOOK_FIELDS: FieldAliases = FieldAliases {
    id_field: "book_id",
    fields: &[
        ("title", &["title", "参考書名", "タイトル", "書名"]),
        ("subject", &["subject", "教科", "科目"]),
        ("monthly_goal", &["monthly_goal", "月間目標", "goal"]),
        ("unit_load", &["unit_load", "単位当たり処理量", "単位処理量"]),
        ("chapters", &["chapters", "章", "章立て"]),
    ],
};

pub const STUDENT_FIELDS: FieldAliases = FieldAliases {
    id_field: "student_id",
    fields: &[
        ("name", &["name", "氏名", "名前", "生徒名"]),
        ("grade", &["grade", "学年"]),
        (
            "planner_sheet_id",
            &["planner_sheet_id", "スピードプランナーID", "PlannerSheetId", "プランナーID"],
        ),
        (
            "meeting_doc_id",
            &["meeting_doc_id", "面談メモID", "MeetingDocId", "面談ドキュメントID"],
        ),
        ("tags", &["tags", "タグ"]),
    ],
};

const RESERVED_KEYS: [&str; 3] = ["op", "confirm_token", "id"];

impl FieldAliases {
    /// Canonical name for `key`, or `None` when the key is not in the table.
    pub fn canonical(&self, key: &str) -> Option<&'static str> {
        let wanted = header_key(key);
        self.fields.iter().find_map(|(canonical, aliases)| {
            aliases
                .iter()
                .any(|alias| header_key(alias) == wanted)
                .then_some(*canonical)
        })
    }

    pub fn aliases_of(&self, canonical: &str) -> &'static [&'static str] {
        self.fields
            .iter()
            .find(|(name, _)| *name == canonical)
            .map(|(_, aliases)| *aliases)
            .unwrap_or(&[])
    }

    /// Canonical name when known, the trimmed key otherwise.
    pub fn resolve(&self, key: &str) -> String {
        self.canonical(key)
            .map(str::to_string)
            .unwrap_or_else(|| key.trim().to_string())
    }

    /// Rewrite alias keys of an update map to canonical names.
    ///
    /// Unknown keys pass through unchanged. Keys that would shadow the
    /// request's own routing fields are rejected.
    pub fn canonicalize(&self, updates: &Map<String, Value>) -> Result<Map<String, Value>, ToolFailure> {
        let mut out = Map::new();
        for (key, value) in updates {
            let resolved = self.resolve(key);
            if resolved.is_empty() {
                return Err(ToolFailure::bad_field("updates", "update keys must not be empty"));
            }
            let normalized = header_key(&resolved);
            if normalized == self.id_field || RESERVED_KEYS.contains(&normalized.as_str()) {
                return Err(ToolFailure::bad_field(
                    "updates",
                    format!("'{key}' cannot be changed through updates"),
                ));
            }
            if out.contains_key(&resolved) {
                return Err(ToolFailure::bad_field(
                    "updates",
                    format!("'{key}' duplicates another key for the same field"),
                ));
            }
            out.insert(resolved, value.clone());
        }
        Ok(out)
    }
}
