//! Normalization of backend response shapes.
//!
//! The backend is not consistent about field names or encodings: a recipe's
//! like counter shows up as `like_count`, `likes_count`, `likes`, or as an
//! aggregate `likes: [{ "count": 3 }]`; booleans arrive as `true`, `"t"` or
//! `1`; ids as strings or numbers. Everything is mapped onto the canonical
//! entity structs here, once, so no other module sees raw JSON.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    AgingState, CommentThread, Counts, EntityId, EntityKind, EntityValue, FollowEdge, MutationKind, PantryItem,
    Profile, Recipe, SyncError, ToggleOutcome,
};

/// How a field is encoded once normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Text,
    Count,
    Flag,
    Percent,
    Time,
    Preview,
}

/// Canonical field name plus the names the backend has used for it.
struct FieldSpec {
    name: &'static str,
    field: Field,
    aliases: &'static [&'static str],
    /// Identity fields are never overwritten by change events.
    identity: bool,
}

const fn field(name: &'static str, field: Field, aliases: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        name,
        field,
        aliases,
        identity: false,
    }
}

const fn identity(name: &'static str, aliases: &'static [&'static str]) -> FieldSpec {
    FieldSpec {
        name,
        field: Field::Id,
        aliases,
        identity: true,
    }
}

const RECIPE_FIELDS: &[FieldSpec] = &[
    identity("id", &["recipe_id"]),
    field("title", Field::Text, &["name"]),
    field("author_id", Field::Id, &["user_id", "created_by"]),
    field("like_count", Field::Count, &["likes_count", "likes", "total_likes"]),
    field("save_count", Field::Count, &["saves_count", "saves", "bookmark_count"]),
    field("comment_count", Field::Count, &["comments_count", "comments"]),
    field("liked", Field::Flag, &["is_liked", "user_has_liked", "has_liked"]),
    field("saved", Field::Flag, &["is_saved", "user_has_saved"]),
    field("pantry_match", Field::Percent, &["pantry_match_pct", "match_percentage"]),
];

const PROFILE_FIELDS: &[FieldSpec] = &[
    identity("id", &["user_id", "profile_id"]),
    field("username", Field::Text, &["handle"]),
    field("follower_count", Field::Count, &["followers_count", "followers"]),
    field("following_count", Field::Count, &["followings_count", "following"]),
    field("recipe_count", Field::Count, &["recipes_count", "posts_count"]),
    field("is_following", Field::Flag, &["following_status", "viewer_follows"]),
];

const FOLLOW_EDGE_FIELDS: &[FieldSpec] = &[
    identity("follower_id", &[]),
    identity("followee_id", &["following_id"]),
    field("active", Field::Flag, &["is_active"]),
];

const PANTRY_ITEM_FIELDS: &[FieldSpec] = &[
    identity("id", &["item_id"]),
    field("owner_id", Field::Id, &["user_id"]),
    field("name", Field::Text, &["item_name"]),
    field("added_at", Field::Time, &["created_at"]),
    field("expires_at", Field::Time, &["expiry_date", "expiration_date"]),
];

const COMMENT_THREAD_FIELDS: &[FieldSpec] = &[
    identity("recipe_id", &["id"]),
    field("comment_count", Field::Count, &["comments_count", "count"]),
    field("latest_preview", Field::Preview, &["latest_comment", "last_comment"]),
];

fn fields(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        EntityKind::Recipe => RECIPE_FIELDS,
        EntityKind::Profile => PROFILE_FIELDS,
        EntityKind::FollowEdge => FOLLOW_EDGE_FIELDS,
        EntityKind::PantryItem => PANTRY_ITEM_FIELDS,
        EntityKind::CommentThread => COMMENT_THREAD_FIELDS,
    }
}

/// Resolve a wire field name to its canonical field.
fn resolve(kind: EntityKind, wire_name: &str) -> Option<&'static FieldSpec> {
    let specs = fields(kind);
    specs
        .iter()
        .find(|s| s.name == wire_name)
        .or_else(|| specs.iter().find(|s| s.aliases.contains(&wire_name)))
}

// =============================================================================
// Scalar parsing
// =============================================================================

fn parse_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|n| n.min(u32::MAX as u64) as u32),
        Value::String(s) => s.trim().parse::<u64>().ok().map(|n| n.min(u32::MAX as u64) as u32),
        // Aggregate shapes: `[{ "count": n }]` and `{ "count": n }`.
        Value::Array(items) => match items.first() {
            Some(first) => parse_count(first),
            None => Some(0),
        },
        Value::Object(obj) => obj.get("count").and_then(parse_count),
        _ => None,
    }
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Some(true),
            "false" | "f" | "0" | "no" => Some(false),
            _ => None,
        },
        // `user_has_liked: [{ ... }]` is a filtered join: non-empty means yes.
        Value::Array(items) => Some(!items.is_empty()),
        _ => None,
    }
}

fn parse_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(EntityId::new(s.clone())),
        Value::Number(n) => Some(EntityId::new(n.to_string())),
        _ => None,
    }
}

fn parse_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_percent(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f.round().clamp(0.0, 100.0) as u8),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok().map(|f| f.round().clamp(0.0, 100.0) as u8),
        _ => None,
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|t| t.and_utc())
            }),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn parse_preview(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => ["body", "text", "content"]
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(parse_text),
        _ => None,
    }
}

fn parses_as(field: Field, value: &Value) -> bool {
    if value.is_null() {
        // Explicit nulls clear optional fields.
        return matches!(field, Field::Percent | Field::Time | Field::Preview);
    }
    match field {
        Field::Id => parse_id(value).is_some(),
        Field::Text => parse_text(value).is_some(),
        Field::Count => parse_count(value).is_some(),
        Field::Flag => parse_flag(value).is_some(),
        Field::Percent => parse_percent(value).is_some(),
        Field::Time => parse_time(value).is_some(),
        Field::Preview => parse_preview(value).is_some(),
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One backend object read through a kind's alias table.
struct Row<'a> {
    obj: &'a Map<String, Value>,
    kind: EntityKind,
}

impl<'a> Row<'a> {
    fn raw(&self, name: &str) -> Option<&'a Value> {
        let spec = fields(self.kind).iter().find(|s| s.name == name)?;
        std::iter::once(spec.name)
            .chain(spec.aliases.iter().copied())
            .filter_map(|n| self.obj.get(n))
            .find(|v| !v.is_null())
    }

    fn id(&self, name: &str) -> Option<EntityId> {
        self.raw(name).and_then(parse_id)
    }

    fn required_id(&self, name: &str) -> Result<EntityId, SyncError> {
        self.id(name)
            .ok_or_else(|| SyncError::InvalidResponse(format!("{} row without {}", self.kind, name)))
    }

    /// Missing counters are reported as zero.
    fn count(&self, name: &str) -> u32 {
        self.raw(name).and_then(parse_count).unwrap_or(0)
    }

    fn count_opt(&self, name: &str) -> Option<u32> {
        self.raw(name).and_then(parse_count)
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        self.raw(name).and_then(parse_flag).unwrap_or(default)
    }

    fn text(&self, name: &str) -> String {
        self.raw(name).and_then(parse_text).unwrap_or_default()
    }

    fn percent(&self, name: &str) -> Option<u8> {
        self.raw(name).and_then(parse_percent)
    }

    fn time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.raw(name).and_then(parse_time)
    }

    fn preview(&self, name: &str) -> Option<String> {
        self.raw(name).and_then(parse_preview)
    }
}

/// Normalize one backend object into an entity value of `kind`.
pub fn normalize_entity(kind: EntityKind, value: &Value, now: DateTime<Utc>) -> Result<EntityValue, SyncError> {
    let obj = value
        .as_object()
        .ok_or_else(|| SyncError::InvalidResponse(format!("expected {} object, got {}", kind, type_name(value))))?;
    let row = Row { obj, kind };

    let entity = match kind {
        EntityKind::Recipe => EntityValue::Recipe(Recipe {
            id: row.required_id("id")?,
            title: row.text("title"),
            author_id: row.id("author_id").unwrap_or_else(|| EntityId::new("")),
            like_count: row.count("like_count"),
            save_count: row.count("save_count"),
            comment_count: row.count("comment_count"),
            liked: row.flag("liked", false),
            saved: row.flag("saved", false),
            pantry_match: row.percent("pantry_match"),
        }),
        EntityKind::Profile => EntityValue::Profile(Profile {
            id: row.required_id("id")?,
            username: row.text("username"),
            follower_count: row.count("follower_count"),
            following_count: row.count("following_count"),
            recipe_count: row.count("recipe_count"),
            is_following: row.flag("is_following", false),
        }),
        EntityKind::FollowEdge => EntityValue::FollowEdge(FollowEdge {
            follower_id: row.required_id("follower_id")?,
            followee_id: row.required_id("followee_id")?,
            active: row.flag("active", true),
        }),
        EntityKind::PantryItem => {
            let expires_at = row.time("expires_at");
            EntityValue::PantryItem(PantryItem {
                id: row.required_id("id")?,
                owner_id: row.id("owner_id").unwrap_or_else(|| EntityId::new("")),
                name: row.text("name"),
                added_at: row.time("added_at"),
                expires_at,
                aging: AgingState::at(expires_at, now),
            })
        }
        EntityKind::CommentThread => EntityValue::CommentThread(CommentThread {
            recipe_id: row.required_id("recipe_id")?,
            comment_count: row.count("comment_count"),
            latest_preview: row.preview("latest_preview"),
        }),
    };
    Ok(entity)
}

/// Apply a change event's fields on top of `current`.
///
/// Unknown fields are ignored and identity fields are never changed. Fails
/// when no field is recognized or a recognized field has a value that does
/// not parse; the caller then invalidates instead of guessing.
pub fn merge_changes(
    current: &EntityValue,
    changed: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<EntityValue, SyncError> {
    let kind = current.kind();
    let mut merged = canonical_json(current)?;

    let mut recognized = 0;
    for (name, value) in changed {
        let Some(spec) = resolve(kind, name) else {
            continue;
        };
        if spec.identity {
            continue;
        }
        if !parses_as(spec.field, value) {
            return Err(SyncError::InvalidResponse(format!(
                "{} field {} has unusable value {}",
                kind, name, value
            )));
        }
        merged.insert(spec.name.to_string(), value.clone());
        recognized += 1;
    }

    if recognized == 0 {
        return Err(SyncError::InvalidResponse(format!("no recognized {} fields in change", kind)));
    }
    normalize_entity(kind, &Value::Object(merged), now)
}

fn canonical_json(value: &EntityValue) -> Result<Map<String, Value>, SyncError> {
    let json = match value {
        EntityValue::Recipe(r) => serde_json::to_value(r)?,
        EntityValue::Profile(p) => serde_json::to_value(p)?,
        EntityValue::FollowEdge(e) => serde_json::to_value(e)?,
        EntityValue::PantryItem(p) => serde_json::to_value(p)?,
        EntityValue::CommentThread(t) => serde_json::to_value(t)?,
    };
    match json {
        Value::Object(obj) => Ok(obj),
        other => Err(SyncError::InvalidResponse(format!(
            "entity serialized to {}",
            type_name(&other)
        ))),
    }
}

/// Pull the row list out of a list response.
///
/// Accepts a bare array or an envelope with the rows under `data`,
/// `recipes`, `items` or `rows`.
pub fn extract_rows(value: &Value) -> Result<&[Value], SyncError> {
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Object(obj) => ["data", "recipes", "items", "rows"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .map(Vec::as_slice)
            .ok_or_else(|| SyncError::InvalidResponse("list response without rows".to_string())),
        other => Err(SyncError::InvalidResponse(format!(
            "expected list, got {}",
            type_name(other)
        ))),
    }
}

/// Normalize a feed page. Rows that cannot be normalized are skipped.
pub fn normalize_feed(value: &Value, now: DateTime<Utc>) -> Result<Vec<EntityValue>, SyncError> {
    let rows = extract_rows(value)?;
    let mut recipes = Vec::with_capacity(rows.len());
    for row in rows {
        match normalize_entity(EntityKind::Recipe, row, now) {
            Ok(recipe) => recipes.push(recipe),
            Err(e) => warn!(error = %e, "skipping malformed feed row"),
        }
    }
    Ok(recipes)
}

/// Unwrap single-row responses, which some procedures return as `[row]`.
pub fn single_row(value: &Value) -> Result<&Value, SyncError> {
    match value {
        Value::Array(rows) => rows
            .first()
            .ok_or_else(|| SyncError::NotFound("empty result".to_string())),
        other => Ok(other),
    }
}

/// Normalize the response of a toggle call.
pub fn normalize_toggle(kind: MutationKind, value: &Value) -> Result<ToggleOutcome, SyncError> {
    let value = single_row(value)?;
    let obj = value
        .as_object()
        .ok_or_else(|| SyncError::InvalidResponse(format!("expected toggle object, got {}", type_name(value))))?;

    let (state_kind, state_field) = match kind {
        MutationKind::Like => (EntityKind::Recipe, "liked"),
        MutationKind::Save => (EntityKind::Recipe, "saved"),
        MutationKind::Follow => (EntityKind::Profile, "is_following"),
    };
    let new_state = ["new_state", "state"]
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| Row { obj, kind: state_kind }.raw(state_field))
        .and_then(parse_flag)
        .ok_or_else(|| SyncError::InvalidResponse(format!("{} response without new state", kind)))?;

    let recipe = Row {
        obj,
        kind: EntityKind::Recipe,
    };
    let profile = Row {
        obj,
        kind: EntityKind::Profile,
    };
    let counts = match kind {
        MutationKind::Like | MutationKind::Save => Counts {
            like_count: recipe.count_opt("like_count"),
            save_count: recipe.count_opt("save_count"),
            ..Counts::default()
        },
        MutationKind::Follow => Counts {
            follower_count: profile.count_opt("follower_count"),
            following_count: profile.count_opt("following_count"),
            ..Counts::default()
        },
    };

    Ok(ToggleOutcome { new_state, counts })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
