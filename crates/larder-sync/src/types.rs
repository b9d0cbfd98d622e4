//! Entity, key and event types shared by every component.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Days before expiry at which a pantry item counts as expiring soon.
pub const EXPIRING_SOON_DAYS: i64 = 3;

// =============================================================================
// Keys
// =============================================================================

/// The bounded set of entity kinds the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Recipe,
    Profile,
    FollowEdge,
    PantryItem,
    CommentThread,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Recipe,
        EntityKind::Profile,
        EntityKind::FollowEdge,
        EntityKind::PantryItem,
        EntityKind::CommentThread,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Recipe => "recipe",
            EntityKind::Profile => "profile",
            EntityKind::FollowEdge => "follow_edge",
            EntityKind::PantryItem => "pantry_item",
            EntityKind::CommentThread => "comment_thread",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of a logical entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which screen a denormalized copy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewContext {
    Feed,
    ProfileGrid,
    Detail,
    List,
}

impl ViewContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewContext::Feed => "feed",
            ViewContext::ProfileGrid => "profile-grid",
            ViewContext::Detail => "detail",
            ViewContext::List => "list",
        }
    }
}

impl fmt::Display for ViewContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical entity, independent of which views render it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Identifier of one denormalized copy of an entity.
///
/// Renders as `kind:id` or `kind:id@context`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: EntityId,
    pub context: Option<ViewContext>,
}

impl CacheKey {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
            context: None,
        }
    }

    pub fn recipe(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Recipe, id)
    }

    pub fn profile(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Profile, id)
    }

    /// The same entity rendered in a specific view context.
    pub fn in_context(mut self, context: ViewContext) -> Self {
        self.context = Some(context);
        self
    }

    /// The logical entity this key is a copy of.
    pub fn entity(&self) -> EntityRef {
        EntityRef {
            kind: self.kind,
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.context {
            Some(ctx) => write!(f, "{}:{}@{}", self.kind, self.id, ctx),
            None => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}

// =============================================================================
// Entity values
// =============================================================================

/// A recipe as rendered in any view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: EntityId,
    pub title: String,
    pub author_id: EntityId,
    pub like_count: u32,
    pub save_count: u32,
    pub comment_count: u32,
    pub liked: bool,
    pub saved: bool,
    /// Percentage of ingredients the viewer has in their pantry.
    /// Computed per view, never copied between views.
    pub pantry_match: Option<u8>,
}

/// A user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: EntityId,
    pub username: String,
    pub follower_count: u32,
    pub following_count: u32,
    pub recipe_count: u32,
    /// Whether the viewer follows this profile.
    pub is_following: bool,
}

/// A follower → followee relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    pub follower_id: EntityId,
    pub followee_id: EntityId,
    pub active: bool,
}

impl FollowEdge {
    /// Entity id of the edge between two profiles.
    pub fn edge_id(follower_id: &EntityId, followee_id: &EntityId) -> EntityId {
        EntityId::new(format!("{}:{}", follower_id, followee_id))
    }
}

/// Freshness of a pantry item relative to its expiry date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingState {
    Fresh,
    ExpiringSoon,
    Expired,
}

impl AgingState {
    /// Aging state at `now` for an item expiring at `expires_at`.
    pub fn at(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match expires_at {
            None => AgingState::Fresh,
            Some(exp) if now >= exp => AgingState::Expired,
            Some(exp) if exp - now <= chrono::Duration::days(EXPIRING_SOON_DAYS) => AgingState::ExpiringSoon,
            Some(_) => AgingState::Fresh,
        }
    }
}

/// An item in a user's pantry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PantryItem {
    pub id: EntityId,
    pub owner_id: EntityId,
    pub name: String,
    pub added_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub aging: AgingState,
}

/// The comment thread under a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentThread {
    pub recipe_id: EntityId,
    pub comment_count: u32,
    pub latest_preview: Option<String>,
}

/// The value of any managed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityValue {
    Recipe(Recipe),
    Profile(Profile),
    FollowEdge(FollowEdge),
    PantryItem(PantryItem),
    CommentThread(CommentThread),
}

impl EntityValue {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityValue::Recipe(_) => EntityKind::Recipe,
            EntityValue::Profile(_) => EntityKind::Profile,
            EntityValue::FollowEdge(_) => EntityKind::FollowEdge,
            EntityValue::PantryItem(_) => EntityKind::PantryItem,
            EntityValue::CommentThread(_) => EntityKind::CommentThread,
        }
    }

    /// Entity id of this value.
    pub fn id(&self) -> EntityId {
        match self {
            EntityValue::Recipe(r) => r.id.clone(),
            EntityValue::Profile(p) => p.id.clone(),
            EntityValue::FollowEdge(e) => FollowEdge::edge_id(&e.follower_id, &e.followee_id),
            EntityValue::PantryItem(p) => p.id.clone(),
            EntityValue::CommentThread(t) => t.recipe_id.clone(),
        }
    }

    /// The user who owns this entity, if ownership applies.
    pub fn owner_id(&self) -> Option<&EntityId> {
        match self {
            EntityValue::Recipe(r) => Some(&r.author_id),
            EntityValue::Profile(p) => Some(&p.id),
            EntityValue::FollowEdge(e) => Some(&e.follower_id),
            EntityValue::PantryItem(p) => Some(&p.owner_id),
            EntityValue::CommentThread(_) => None,
        }
    }

    pub fn as_recipe(&self) -> Option<&Recipe> {
        match self {
            EntityValue::Recipe(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_profile(&self) -> Option<&Profile> {
        match self {
            EntityValue::Profile(p) => Some(p),
            _ => None,
        }
    }

    /// Copy of `source` that keeps this copy's per-view derived fields.
    ///
    /// Used when one view's value fans out to another view's copy of the
    /// same entity. Values of different kinds are not merged.
    pub fn adopt_shared(&self, source: &EntityValue) -> EntityValue {
        match (self, source) {
            (EntityValue::Recipe(mine), EntityValue::Recipe(theirs)) => {
                EntityValue::Recipe(Recipe {
                    pantry_match: mine.pantry_match,
                    ..theirs.clone()
                })
            }
            _ => source.clone(),
        }
    }

    /// Recompute time-derived fields.
    pub fn refreshed_at(mut self, now: DateTime<Utc>) -> Self {
        if let EntityValue::PantryItem(ref mut item) = self {
            item.aging = AgingState::at(item.expires_at, now);
        }
        self
    }
}

/// The last-known value of one cache key plus its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub value: Arc<EntityValue>,
    /// When the value was last confirmed by the backend.
    pub fetched_at: DateTime<Utc>,
    /// How long after `fetched_at` the value counts as stale.
    pub stale_after: Duration,
    /// Monotonic per-key write counter.
    pub version: u64,
    /// Set when the backend signalled a change that could not be merged.
    pub invalidated: bool,
}

impl EntitySnapshot {
    pub fn new(value: EntityValue, fetched_at: DateTime<Utc>, stale_after: Duration, version: u64) -> Self {
        Self {
            value: Arc::new(value),
            fetched_at,
            stale_after,
            version,
            invalidated: false,
        }
    }

    /// How long ago the value was fetched.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.invalidated || self.age(now) >= self.stale_after
    }
}

// =============================================================================
// Mutations and events
// =============================================================================

/// User-triggered toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Like,
    Save,
    Follow,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Like => "like",
            MutationKind::Save => "save",
            MutationKind::Follow => "follow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(MutationKind::Like),
            "save" => Some(MutationKind::Save),
            "follow" => Some(MutationKind::Follow),
            _ => None,
        }
    }

    /// The entity kind this mutation targets.
    pub fn target_kind(&self) -> EntityKind {
        match self {
            MutationKind::Like | MutationKind::Save => EntityKind::Recipe,
            MutationKind::Follow => EntityKind::Profile,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effects that happen at most once per (actor, entity) per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnceActionKind {
    RecipeView,
    ProfileView,
}

impl OnceActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnceActionKind::RecipeView => "recipe_view",
            OnceActionKind::ProfileView => "profile_view",
        }
    }
}

impl fmt::Display for OnceActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters echoed by the backend after a toggle. Absent fields were not reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    pub like_count: Option<u32>,
    pub save_count: Option<u32>,
    pub follower_count: Option<u32>,
    pub following_count: Option<u32>,
}

/// Result of a remote toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    /// State after the call (e.g. `liked`).
    pub new_state: bool,
    pub counts: Counts,
}

/// A backend change notification, applied once and not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub changed_fields: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.kind, self.entity_id.clone())
    }
}
