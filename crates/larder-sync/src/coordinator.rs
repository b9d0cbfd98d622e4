//! Mutation coordinator for like, save and follow toggles.
//!
//! A dispatch writes the optimistic value to every cached copy of the
//! target immediately, then sends one remote call carrying the desired end
//! state after a short coalescing window. Further toggles of the same
//! (kind, entity) only flip the desired state; toggles that land while the
//! call is in flight cause one follow-up call once it settles, and only if
//! the final desired state differs from the confirmed one.
//!
//! On failure every touched key is restored to its pre-mutation snapshot,
//! unless something else (a realtime push, a refresh) wrote it since.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::{
    CacheKey, Clock, Counts, EntityId, EntityKind, EntityRef, EntitySnapshot, EntityStore, EntityValue, FollowEdge,
    MutationKind, RemoteGateway, SyncError, ViewConsistencyMapper,
};

/// Default coalescing window.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(250);

/// Result of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// This dispatch sent the remote call and the backend confirmed `state`.
    Confirmed { state: bool },
    /// Folded into a mutation already pending for the same entity.
    Coalesced { desired: bool },
}

/// An optimistic mutation that has not settled yet.
#[derive(Debug)]
struct PendingMutation {
    /// Key the first dispatch came from.
    key: CacheKey,
    /// Snapshot of every touched key before the first optimistic write.
    /// `None` for keys that did not exist.
    previous: HashMap<CacheKey, Option<EntitySnapshot>>,
    /// Latest optimistic snapshot of `key`.
    optimistic: Option<EntitySnapshot>,
    /// Version of our latest write per touched key.
    written: HashMap<CacheKey, u64>,
    desired_state: bool,
    in_flight: bool,
    needs_reverify: bool,
    retry_count: u32,
}

type PendingKey = (MutationKind, EntityId);

/// Coordinates optimistic toggles against the backend.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: Arc<EntityStore>,
    mapper: Arc<ViewConsistencyMapper>,
    gateway: Arc<dyn RemoteGateway>,
    clock: Arc<dyn Clock>,
    actor_id: EntityId,
    coalesce_window: Duration,
    pending: Arc<DashMap<PendingKey, PendingMutation>>,
}

impl MutationCoordinator {
    /// Create a coordinator acting as `actor_id`.
    pub fn new(
        store: Arc<EntityStore>,
        mapper: Arc<ViewConsistencyMapper>,
        gateway: Arc<dyn RemoteGateway>,
        actor_id: EntityId,
    ) -> Self {
        let clock = Arc::clone(store.clock());
        Self {
            store,
            mapper,
            gateway,
            clock,
            actor_id,
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Set the coalescing window.
    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    pub fn actor_id(&self) -> &EntityId {
        &self.actor_id
    }

    /// Whether a mutation of `kind` on `id` has not settled yet.
    ///
    /// Must not be called from a store subscriber callback: dispatches write
    /// to the store while holding the pending entry.
    pub fn is_pending(&self, kind: MutationKind, id: &EntityId) -> bool {
        self.pending.contains_key(&(kind, id.clone()))
    }

    /// Toggle `kind` on the entity behind `key`.
    ///
    /// The remote leg runs on its own task and completes even if this
    /// future is dropped.
    #[tracing::instrument(skip(self), fields(actor = %self.actor_id))]
    pub async fn dispatch(&self, kind: MutationKind, key: CacheKey) -> Result<DispatchOutcome, SyncError> {
        if key.kind != kind.target_kind() {
            return Err(SyncError::Validation(format!(
                "{} cannot target {}",
                kind, key.kind
            )));
        }
        let target = key.entity();

        if self.cached_copies(&target).is_empty() {
            debug!(key = %key, "target not cached, fetching detail");
            let value = self
                .gateway
                .fetch_entity_detail(target.kind, &target.id, &self.actor_id)
                .await?;
            self.store.write_fetched(key.clone(), value, 0);
        }

        let slot = (kind, target.id.clone());
        match self.pending.entry(slot) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.desired_state = !pending.desired_state;
                if pending.in_flight {
                    pending.needs_reverify = true;
                }
                let desired = pending.desired_state;
                self.apply_optimistic(pending, kind, &target, desired);
                debug!(key = %key, desired, in_flight = pending.in_flight, "coalesced into pending mutation");
                return Ok(DispatchOutcome::Coalesced { desired });
            }
            Entry::Vacant(entry) => {
                let current = self
                    .store
                    .get(&key)
                    .or_else(|| self.cached_copies(&target).first().and_then(|k| self.store.get(k)))
                    .and_then(|snapshot| toggle_state(kind, &snapshot.value))
                    .ok_or_else(|| SyncError::Sync(format!("no cached value for {}", target)))?;

                let mut pending = PendingMutation {
                    key: key.clone(),
                    previous: HashMap::new(),
                    optimistic: None,
                    written: HashMap::new(),
                    desired_state: !current,
                    in_flight: false,
                    needs_reverify: false,
                    retry_count: 0,
                };
                self.apply_optimistic(&mut pending, kind, &target, !current);
                entry.insert(pending);
            }
        }

        let leg = self.clone();
        let task_target = target.clone();
        let handle = tokio::spawn(async move { leg.run_remote(kind, task_target).await });
        let state = handle
            .await
            .map_err(|e| SyncError::Sync(format!("mutation task failed: {}", e)))??;
        Ok(DispatchOutcome::Confirmed { state })
    }

    /// Every cached copy of `entity`, from the mapper and the store.
    fn cached_copies(&self, entity: &EntityRef) -> Vec<CacheKey> {
        let mut keys = self.store.keys_for_entity(entity);
        for key in self.mapper.keys_for(entity) {
            if !keys.contains(&key) && self.store.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Write the optimistic value for `desired` to every cached copy.
    fn apply_optimistic(&self, pending: &mut PendingMutation, kind: MutationKind, target: &EntityRef, desired: bool) {
        let mut touched = 0;
        for key in self.cached_copies(target) {
            if let Some(version) = self.write_transformed(pending, &key, |value| set_state(kind, value, desired)) {
                if key == pending.key {
                    pending.optimistic = self.store.get(&key).filter(|s| s.version == version);
                }
                touched += 1;
            }
        }

        if kind == MutationKind::Follow {
            let edge = EntityRef::new(
                EntityKind::FollowEdge,
                FollowEdge::edge_id(&self.actor_id, &target.id),
            );
            for key in self.cached_copies(&edge) {
                self.write_transformed(pending, &key, |value| set_state(kind, value, desired));
            }

            let actor = EntityRef::new(EntityKind::Profile, self.actor_id.clone());
            for key in self.cached_copies(&actor) {
                self.write_transformed(pending, &key, |value| adjust_following(value, desired));
            }
        }
        debug!(entity = %target, desired, touched, "optimistic write applied");
    }

    /// Write `transform(current)` to `key`, remembering the pre-mutation
    /// snapshot. Returns the written version.
    fn write_transformed(
        &self,
        pending: &mut PendingMutation,
        key: &CacheKey,
        transform: impl Fn(&EntityValue) -> Option<EntityValue>,
    ) -> Option<u64> {
        let current = self.store.get(key)?;
        let next = transform(&current.value)?;
        pending.previous.entry(key.clone()).or_insert(Some(current));
        let version = self.store.write_local(key.clone(), next).version()?;
        pending.written.insert(key.clone(), version);
        Some(version)
    }

    /// The remote leg: wait out the coalescing window, send the desired
    /// state, follow up if it changed meanwhile, then settle.
    async fn run_remote(self, kind: MutationKind, target: EntityRef) -> Result<bool, SyncError> {
        let slot = (kind, target.id.clone());
        self.clock.sleep(self.coalesce_window).await;

        loop {
            let desired = match self.pending.get_mut(&slot) {
                Some(mut pending) => {
                    pending.in_flight = true;
                    pending.needs_reverify = false;
                    pending.desired_state
                }
                None => return Err(SyncError::Sync(format!("pending {} on {} vanished", kind, target))),
            };

            debug!(kind = %kind, entity = %target, desired, "sending toggle");
            let result = match self
                .gateway
                .mutate_toggle(kind, &self.actor_id, &target.id, desired)
                .await
            {
                Ok(outcome) => Ok((outcome.new_state, outcome.counts)),
                // Already in the desired state.
                Err(e) if e.is_duplicate() => Ok((desired, Counts::default())),
                Err(e) => Err(e),
            };

            match result {
                Ok((confirmed, counts)) => {
                    let settled = match self.pending.entry(slot.clone()) {
                        Entry::Occupied(mut entry) => {
                            let pending = entry.get_mut();
                            if pending.needs_reverify && pending.desired_state != confirmed {
                                pending.retry_count += 1;
                                debug!(
                                    entity = %target,
                                    confirmed,
                                    desired = pending.desired_state,
                                    retry = pending.retry_count,
                                    "desired state changed in flight, following up"
                                );
                                None
                            } else {
                                Some(entry.remove())
                            }
                        }
                        Entry::Vacant(_) => {
                            return Err(SyncError::Sync(format!("pending {} on {} vanished", kind, target)));
                        }
                    };

                    if let Some(pending) = settled {
                        self.apply_echo(kind, &target, &pending, confirmed, &counts);
                        info!(kind = %kind, entity = %target, state = confirmed, "mutation confirmed");
                        return Ok(confirmed);
                    }
                }
                Err(e) => {
                    let Some((_, pending)) = self.pending.remove(&slot) else {
                        return Err(e);
                    };
                    if pending.retry_count == 0 {
                        self.roll_back(&pending);
                        warn!(kind = %kind, entity = %target, error = %e, "mutation failed, rolled back");
                    } else {
                        // An earlier call already landed; the server state is
                        // not the pre-mutation one any more.
                        warn!(kind = %kind, entity = %target, error = %e, "follow-up failed, refetching");
                        self.refetch(&target).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Restore pre-mutation snapshots where nothing else wrote since.
    fn roll_back(&self, pending: &PendingMutation) {
        debug!(
            key = %pending.key,
            optimistic_version = pending.optimistic.as_ref().map(|s| s.version),
            keys = pending.previous.len(),
            "rolling back optimistic write"
        );
        for (key, previous) in &pending.previous {
            let Some(&written) = pending.written.get(key) else {
                continue;
            };
            if !self.store.restore_if_version(key, written, previous.clone()) {
                debug!(key = %key, "rollback skipped, key overwritten since");
            }
        }
    }

    /// Replace optimistic values with the server echo where nothing else
    /// wrote since.
    fn apply_echo(
        &self,
        kind: MutationKind,
        target: &EntityRef,
        pending: &PendingMutation,
        confirmed: bool,
        counts: &Counts,
    ) {
        for (key, &written) in &pending.written {
            let Some(current) = self.store.get(key) else {
                continue;
            };
            let value = &*current.value;
            let echoed = if key.kind == EntityKind::Profile && key.id == self.actor_id && key.entity() != *target {
                with_following_count(value, counts)
            } else {
                let stated = set_state(kind, value, confirmed).unwrap_or_else(|| value.clone());
                with_counts(&stated, counts)
            };
            if !self.store.confirm_if_version(key, written, echoed) {
                debug!(key = %key, "echo skipped, key overwritten since");
            }
        }
    }

    async fn refetch(&self, target: &EntityRef) {
        match self
            .gateway
            .fetch_entity_detail(target.kind, &target.id, &self.actor_id)
            .await
        {
            Ok(value) => {
                for key in self.cached_copies(target) {
                    let fanned = match self.store.get(&key) {
                        Some(current) => current.value.adopt_shared(&value),
                        None => value.clone(),
                    };
                    self.store.write_authoritative(key, fanned);
                }
            }
            Err(e) => debug!(entity = %target, error = %e, "refetch after failed follow-up failed"),
        }
    }
}

/// The toggle state `kind` controls on `value`.
fn toggle_state(kind: MutationKind, value: &EntityValue) -> Option<bool> {
    match (kind, value) {
        (MutationKind::Like, EntityValue::Recipe(r)) => Some(r.liked),
        (MutationKind::Save, EntityValue::Recipe(r)) => Some(r.saved),
        (MutationKind::Follow, EntityValue::Profile(p)) => Some(p.is_following),
        (MutationKind::Follow, EntityValue::FollowEdge(e)) => Some(e.active),
        _ => None,
    }
}

fn step(count: u32, up: bool) -> u32 {
    if up {
        count.saturating_add(1)
    } else {
        count.saturating_sub(1)
    }
}

/// `value` with the toggle set to `desired`, or `None` if it already is.
///
/// Idempotent by state, so re-applying after a flip-flop never double counts.
fn set_state(kind: MutationKind, value: &EntityValue, desired: bool) -> Option<EntityValue> {
    if toggle_state(kind, value)? == desired {
        return None;
    }
    let mut next = value.clone();
    match (kind, &mut next) {
        (MutationKind::Like, EntityValue::Recipe(r)) => {
            r.liked = desired;
            r.like_count = step(r.like_count, desired);
        }
        (MutationKind::Save, EntityValue::Recipe(r)) => {
            r.saved = desired;
            r.save_count = step(r.save_count, desired);
        }
        (MutationKind::Follow, EntityValue::Profile(p)) => {
            p.is_following = desired;
            p.follower_count = step(p.follower_count, desired);
        }
        (MutationKind::Follow, EntityValue::FollowEdge(e)) => e.active = desired,
        _ => return None,
    }
    Some(next)
}

fn adjust_following(value: &EntityValue, up: bool) -> Option<EntityValue> {
    match value {
        EntityValue::Profile(p) => {
            let mut next = p.clone();
            next.following_count = step(p.following_count, up);
            Some(EntityValue::Profile(next))
        }
        _ => None,
    }
}

fn with_counts(value: &EntityValue, counts: &Counts) -> EntityValue {
    let mut next = value.clone();
    match &mut next {
        EntityValue::Recipe(r) => {
            if let Some(n) = counts.like_count {
                r.like_count = n;
            }
            if let Some(n) = counts.save_count {
                r.save_count = n;
            }
        }
        EntityValue::Profile(p) => {
            if let Some(n) = counts.follower_count {
                p.follower_count = n;
            }
        }
        _ => {}
    }
    next
}

fn with_following_count(value: &EntityValue, counts: &Counts) -> EntityValue {
    let mut next = value.clone();
    if let (EntityValue::Profile(p), Some(n)) = (&mut next, counts.following_count) {
        p.following_count = n;
    }
    next
}
