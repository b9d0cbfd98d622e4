//! Test support: an in-memory backend behind the gateway trait.
//!
//! [`ScriptedGateway`] keeps server-side entity state, applies toggles the
//! way the real backend does, records every call, and can be told to fail
//! the next call of a given procedure or to add latency.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    Counts, DedupRecord, EntityId, EntityKind, EntityRef, EntityValue, MutationKind, OnceActionKind, Profile, Recipe,
    RemoteGateway, SyncError, ToggleOutcome,
};
use crate::error::UNIQUE_VIOLATION;

/// Remote procedures, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rpc {
    FeedPage,
    EntityDetail,
    MutateToggle,
    LogOnceAction,
}

/// A recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    FeedPage {
        user_id: EntityId,
        limit: u32,
        offset: u32,
    },
    EntityDetail {
        kind: EntityKind,
        id: EntityId,
    },
    MutateToggle {
        kind: MutationKind,
        actor_id: EntityId,
        target_id: EntityId,
        desired: bool,
    },
    LogOnceAction {
        kind: OnceActionKind,
        actor_id: EntityId,
        target_id: EntityId,
    },
}

impl GatewayCall {
    pub fn rpc(&self) -> Rpc {
        match self {
            GatewayCall::FeedPage { .. } => Rpc::FeedPage,
            GatewayCall::EntityDetail { .. } => Rpc::EntityDetail,
            GatewayCall::MutateToggle { .. } => Rpc::MutateToggle,
            GatewayCall::LogOnceAction { .. } => Rpc::LogOnceAction,
        }
    }
}

#[derive(Default)]
struct State {
    entities: HashMap<EntityRef, EntityValue>,
    feed: Vec<EntityId>,
    recorded_actions: HashSet<DedupRecord>,
    failures: HashMap<Rpc, VecDeque<SyncError>>,
    calls: Vec<GatewayCall>,
    underreport_feed: bool,
    latency: Duration,
}

/// In-memory backend.
#[derive(Default)]
pub struct ScriptedGateway {
    state: Mutex<State>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an entity server-side.
    pub fn insert(&self, value: EntityValue) {
        let entity = EntityRef::new(value.kind(), value.id());
        self.state().entities.insert(entity, value);
    }

    /// Store recipes and append them to the feed, in order.
    pub fn insert_feed(&self, recipes: impl IntoIterator<Item = EntityValue>) {
        let mut state = self.state();
        for recipe in recipes {
            let id = recipe.id();
            state.entities.insert(EntityRef::new(EntityKind::Recipe, id.clone()), recipe);
            state.feed.push(id);
        }
    }

    /// Server-side value of an entity.
    pub fn entity(&self, entity: &EntityRef) -> Option<EntityValue> {
        self.state().entities.get(entity).cloned()
    }

    /// Modify an entity server-side, as another client would.
    pub fn update(&self, entity: &EntityRef, f: impl FnOnce(&mut EntityValue)) {
        if let Some(value) = self.state().entities.get_mut(entity) {
            f(value);
        }
    }

    /// Feed pages report every counter as zero, as the aggregate query
    /// does when the counter columns are omitted.
    pub fn underreport_feed(&self, enabled: bool) {
        self.state().underreport_feed = enabled;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Fail the next call of `rpc` with `error`. Queued per procedure.
    pub fn fail_next(&self, rpc: Rpc, error: SyncError) {
        self.state().failures.entry(rpc).or_default().push_back(error);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, rpc: Rpc) -> usize {
        self.state().calls.iter().filter(|c| c.rpc() == rpc).count()
    }

    /// Toggle calls as `(kind, target, desired)`.
    pub fn toggle_calls(&self) -> Vec<(MutationKind, EntityId, bool)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::MutateToggle {
                    kind,
                    target_id,
                    desired,
                    ..
                } => Some((*kind, target_id.clone(), *desired)),
                _ => None,
            })
            .collect()
    }

    /// Entities fetched through the detail procedure.
    pub fn detail_calls(&self) -> Vec<EntityRef> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::EntityDetail { kind, id } => Some(EntityRef::new(*kind, id.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Record the call and return the configured latency.
    fn begin(&self, call: GatewayCall) -> Duration {
        let mut state = self.state();
        state.calls.push(call);
        state.latency
    }

    async fn enter(&self, call: GatewayCall) -> Result<(), SyncError> {
        let rpc = call.rpc();
        let latency = self.begin(call);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.state().failures.get_mut(&rpc).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn not_found(kind: EntityKind, id: &EntityId) -> SyncError {
    SyncError::NotFound(format!("{}:{}", kind, id))
}

fn adjust(count: &mut u32, up: bool) {
    if up {
        *count = count.saturating_add(1);
    } else {
        *count = count.saturating_sub(1);
    }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn fetch_feed_page(&self, user_id: &EntityId, limit: u32, offset: u32) -> Result<Vec<EntityValue>, SyncError> {
        self.enter(GatewayCall::FeedPage {
            user_id: user_id.clone(),
            limit,
            offset,
        })
        .await?;

        let state = self.state();
        let page = state
            .feed
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .filter_map(|id| state.entities.get(&EntityRef::new(EntityKind::Recipe, id.clone())))
            .map(|value| match value {
                EntityValue::Recipe(r) if state.underreport_feed => EntityValue::Recipe(Recipe {
                    like_count: 0,
                    save_count: 0,
                    comment_count: 0,
                    ..r.clone()
                }),
                other => other.clone(),
            })
            .collect();
        Ok(page)
    }

    async fn fetch_entity_detail(
        &self,
        kind: EntityKind,
        id: &EntityId,
        _viewer_id: &EntityId,
    ) -> Result<EntityValue, SyncError> {
        self.enter(GatewayCall::EntityDetail { kind, id: id.clone() }).await?;
        self.entity(&EntityRef::new(kind, id.clone()))
            .ok_or_else(|| not_found(kind, id))
    }

    async fn mutate_toggle(
        &self,
        kind: MutationKind,
        actor_id: &EntityId,
        target_id: &EntityId,
        desired: bool,
    ) -> Result<ToggleOutcome, SyncError> {
        self.enter(GatewayCall::MutateToggle {
            kind,
            actor_id: actor_id.clone(),
            target_id: target_id.clone(),
            desired,
        })
        .await?;

        let mut state = self.state();
        let target = EntityRef::new(kind.target_kind(), target_id.clone());
        let Some(value) = state.entities.get_mut(&target) else {
            return Err(not_found(target.kind, target_id));
        };

        match (kind, value) {
            (MutationKind::Like, EntityValue::Recipe(recipe)) => {
                if recipe.liked != desired {
                    recipe.liked = desired;
                    adjust(&mut recipe.like_count, desired);
                }
                Ok(ToggleOutcome {
                    new_state: recipe.liked,
                    counts: Counts {
                        like_count: Some(recipe.like_count),
                        save_count: Some(recipe.save_count),
                        ..Counts::default()
                    },
                })
            }
            (MutationKind::Save, EntityValue::Recipe(recipe)) => {
                if recipe.saved != desired {
                    recipe.saved = desired;
                    adjust(&mut recipe.save_count, desired);
                }
                Ok(ToggleOutcome {
                    new_state: recipe.saved,
                    counts: Counts {
                        like_count: Some(recipe.like_count),
                        save_count: Some(recipe.save_count),
                        ..Counts::default()
                    },
                })
            }
            (MutationKind::Follow, EntityValue::Profile(profile)) => {
                let changed = profile.is_following != desired;
                if changed {
                    profile.is_following = desired;
                    adjust(&mut profile.follower_count, desired);
                }
                let follower_count = profile.follower_count;

                let actor = EntityRef::new(EntityKind::Profile, actor_id.clone());
                let following_count = match state.entities.get_mut(&actor) {
                    Some(EntityValue::Profile(me)) => {
                        if changed {
                            adjust(&mut me.following_count, desired);
                        }
                        Some(me.following_count)
                    }
                    _ => None,
                };
                Ok(ToggleOutcome {
                    new_state: desired,
                    counts: Counts {
                        follower_count: Some(follower_count),
                        following_count,
                        ..Counts::default()
                    },
                })
            }
            _ => Err(SyncError::Validation(format!("{} cannot target {}", kind, target))),
        }
    }

    async fn log_once_action(
        &self,
        kind: OnceActionKind,
        actor_id: &EntityId,
        target_id: &EntityId,
    ) -> Result<(), SyncError> {
        self.enter(GatewayCall::LogOnceAction {
            kind,
            actor_id: actor_id.clone(),
            target_id: target_id.clone(),
        })
        .await?;

        let record = DedupRecord::new(kind, actor_id.clone(), target_id.clone());
        if !self.state().recorded_actions.insert(record) {
            return Err(SyncError::Conflict {
                code: UNIQUE_VIOLATION.to_string(),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        Ok(())
    }
}

/// A recipe with the given like count and everything else zeroed.
pub fn recipe(id: &str, author_id: &str, like_count: u32) -> EntityValue {
    EntityValue::Recipe(Recipe {
        id: id.into(),
        title: format!("Recipe {}", id),
        author_id: author_id.into(),
        like_count,
        save_count: 0,
        comment_count: 0,
        liked: false,
        saved: false,
        pantry_match: None,
    })
}

/// A profile with the given counters, not followed by the viewer.
pub fn profile(id: &str, follower_count: u32, following_count: u32) -> EntityValue {
    EntityValue::Profile(Profile {
        id: id.into(),
        username: format!("user_{}", id),
        follower_count,
        following_count,
        recipe_count: 0,
        is_following: false,
    })
}
