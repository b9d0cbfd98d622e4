//! In-memory entity store.
//!
//! Holds exactly one snapshot per cache key. Every write replaces the
//! snapshot wholesale and bumps its version; readers and subscribers see
//! either the old or the new snapshot, never a mix. Subscribers of a key
//! are notified synchronously after the write, once the shard lock has been
//! released, so a callback may read the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{CacheKey, Clock, EntityId, EntityRef, EntitySnapshot, EntityValue, StalenessPolicy};

/// Broadcast channel capacity for store updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// Callback invoked with the new snapshot after every write to a key.
pub type SnapshotCallback = Arc<dyn Fn(&CacheKey, &EntitySnapshot) + Send + Sync>;

type SubscriberTable = DashMap<CacheKey, Vec<(u64, SnapshotCallback)>>;

/// Where a write comes from, which decides how its version is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Optimistic or coordinator write.
    Local,
    /// Response to a fetch started at a known version.
    Fetch,
    /// Reconciliation refresh or realtime push. The server is the source of
    /// truth, so these are applied regardless of version.
    Authoritative,
}

/// Result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write replaced the snapshot; `version` is the stored version.
    Applied { version: u64 },
    /// The write carried a version at or below the current one and was dropped.
    StaleWriteRejected { current_version: u64 },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }

    /// Stored version if the write was applied.
    pub fn version(&self) -> Option<u64> {
        match self {
            WriteOutcome::Applied { version } => Some(*version),
            WriteOutcome::StaleWriteRejected { .. } => None,
        }
    }
}

/// Store-wide update event for non-keyed observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// A snapshot was written.
    Put {
        key: CacheKey,
        version: u64,
        origin: WriteOrigin,
    },
    /// A snapshot was marked stale by the backend.
    Invalidated { key: CacheKey, version: u64 },
    /// A snapshot was removed.
    Evicted { key: CacheKey },
    /// The store was torn down.
    Cleared,
}

/// Handle returned by [`EntityStore::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    table: Weak<SubscriberTable>,
    key: CacheKey,
    id: u64,
}

impl Subscription {
    /// Key this subscription listens to.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let now_empty = match table.get_mut(&self.key) {
            Some(mut subs) => {
                subs.retain(|(id, _)| *id != self.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.remove_if(&self.key, |_, subs| subs.is_empty());
        }
        trace!(key = %self.key, id = self.id, "store: unsubscribed");
    }
}

/// Keyed, subscribable snapshot table.
///
/// Created at session start and torn down with [`EntityStore::clear`] at
/// sign-out. Shared between components as `Arc<EntityStore>`.
pub struct EntityStore {
    entries: DashMap<CacheKey, EntitySnapshot>,
    subscribers: Arc<SubscriberTable>,
    next_subscriber: AtomicU64,
    policy: StalenessPolicy,
    /// The signed-in user, for owner-specific staleness.
    viewer_id: Option<EntityId>,
    clock: Arc<dyn Clock>,
    updates_tx: broadcast::Sender<StoreUpdate>,
}

impl EntityStore {
    /// Create a new empty store.
    pub fn new(policy: StalenessPolicy, viewer_id: Option<EntityId>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(1),
            policy,
            viewer_id,
            clock,
            updates_tx,
        })
    }

    /// The clock this store stamps snapshots with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn viewer_id(&self) -> Option<&EntityId> {
        self.viewer_id.as_ref()
    }

    /// Subscribe to store-wide updates.
    pub fn updates(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates_tx.subscribe()
    }

    fn broadcast(&self, update: StoreUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for store update");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the snapshot for a key.
    pub fn get(&self, key: &CacheKey) -> Option<EntitySnapshot> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Current version of a key, or 0 if it is not cached.
    pub fn version_of(&self, key: &CacheKey) -> u64 {
        self.entries.get(key).map(|r| r.value().version).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Every cached copy of one logical entity, sorted.
    pub fn keys_for_entity(&self, entity: &EntityRef) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|r| r.key().kind == entity.kind && r.key().id == entity.id)
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Build a fresh snapshot for `value`, stamped now.
    pub fn stamp(&self, value: EntityValue, version: u64) -> EntitySnapshot {
        let now = self.clock.now();
        let owned = match (value.owner_id(), self.viewer_id.as_ref()) {
            (Some(owner), Some(viewer)) => owner == viewer,
            _ => false,
        };
        let stale_after = self.policy.stale_after(value.kind(), owned);
        EntitySnapshot::new(value.refreshed_at(now), now, stale_after, version)
    }

    /// Replace the snapshot for `key`.
    ///
    /// `Local` and `Fetch` writes are rejected when `snapshot.version` is not
    /// newer than the current version. `Authoritative` writes always apply
    /// and are stored at `max(snapshot.version, current + 1)`.
    pub fn put(&self, key: CacheKey, snapshot: EntitySnapshot, origin: WriteOrigin) -> WriteOutcome {
        let stored = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().version;
                match origin {
                    WriteOrigin::Authoritative => {
                        let mut snapshot = snapshot;
                        snapshot.version = snapshot.version.max(current + 1);
                        entry.insert(snapshot.clone());
                        snapshot
                    }
                    _ if snapshot.version <= current => {
                        debug!(key = %key, current, rejected = snapshot.version, "store: stale write rejected");
                        return WriteOutcome::StaleWriteRejected {
                            current_version: current,
                        };
                    }
                    _ => {
                        entry.insert(snapshot.clone());
                        snapshot
                    }
                }
            }
            Entry::Vacant(entry) => {
                let mut snapshot = snapshot;
                snapshot.version = snapshot.version.max(1);
                entry.insert(snapshot.clone());
                snapshot
            }
        };

        let version = stored.version;
        trace!(key = %key, version, origin = ?origin, "store: snapshot written");
        self.notify(&key, &stored);
        self.broadcast(StoreUpdate::Put {
            key,
            version,
            origin,
        });
        WriteOutcome::Applied { version }
    }

    /// Local write at the next version. Keeps the fetch metadata of the
    /// current snapshot, since the value has not been confirmed remotely.
    pub fn write_local(&self, key: CacheKey, value: EntityValue) -> WriteOutcome {
        let stored = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                let snapshot = EntitySnapshot {
                    value: Arc::new(value),
                    fetched_at: current.fetched_at,
                    stale_after: current.stale_after,
                    version: current.version + 1,
                    invalidated: current.invalidated,
                };
                entry.insert(snapshot.clone());
                snapshot
            }
            Entry::Vacant(entry) => {
                let snapshot = self.stamp(value, 1);
                entry.insert(snapshot.clone());
                snapshot
            }
        };

        let version = stored.version;
        trace!(key = %key, version, "store: local write");
        self.notify(&key, &stored);
        self.broadcast(StoreUpdate::Put {
            key,
            version,
            origin: WriteOrigin::Local,
        });
        WriteOutcome::Applied { version }
    }

    /// Write a fetch response. `observed_version` is the key's version when
    /// the request was issued; any write since then wins over the response.
    pub fn write_fetched(&self, key: CacheKey, value: EntityValue, observed_version: u64) -> WriteOutcome {
        let snapshot = self.stamp(value, observed_version + 1);
        self.put(key, snapshot, WriteOrigin::Fetch)
    }

    /// Write a server-authoritative value.
    pub fn write_authoritative(&self, key: CacheKey, value: EntityValue) -> WriteOutcome {
        let snapshot = self.stamp(value, 0);
        self.put(key, snapshot, WriteOrigin::Authoritative)
    }

    /// Restore `previous` if nothing has written `key` since `expected_version`.
    ///
    /// `None` removes the key (it did not exist before). Returns whether the
    /// restore happened.
    pub fn restore_if_version(
        &self,
        key: &CacheKey,
        expected_version: u64,
        previous: Option<EntitySnapshot>,
    ) -> bool {
        let restored = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) if entry.get().version == expected_version => match previous {
                Some(previous) => {
                    let snapshot = EntitySnapshot {
                        version: expected_version + 1,
                        ..previous
                    };
                    entry.insert(snapshot.clone());
                    Some(snapshot)
                }
                None => {
                    entry.remove();
                    None
                }
            },
            _ => {
                debug!(key = %key, expected_version, "store: restore skipped, key written since");
                return false;
            }
        };

        match restored {
            Some(snapshot) => {
                let version = snapshot.version;
                self.notify(key, &snapshot);
                self.broadcast(StoreUpdate::Put {
                    key: key.clone(),
                    version,
                    origin: WriteOrigin::Local,
                });
            }
            None => self.broadcast(StoreUpdate::Evicted { key: key.clone() }),
        }
        trace!(key = %key, "store: snapshot restored");
        true
    }

    /// Replace the value with a server-confirmed one if nothing has written
    /// `key` since `expected_version`. Returns whether it was applied.
    pub fn confirm_if_version(&self, key: &CacheKey, expected_version: u64, value: EntityValue) -> bool {
        let confirmed = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) if entry.get().version == expected_version => {
                let snapshot = self.stamp(value, expected_version + 1);
                entry.insert(snapshot.clone());
                snapshot
            }
            _ => return false,
        };

        let version = confirmed.version;
        self.notify(key, &confirmed);
        self.broadcast(StoreUpdate::Put {
            key: key.clone(),
            version,
            origin: WriteOrigin::Local,
        });
        true
    }

    /// Mark a snapshot stale without dropping it, so views keep rendering
    /// it until a refetch lands.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let invalidated = match self.entries.get_mut(key) {
            Some(mut entry) => {
                let snapshot = EntitySnapshot {
                    version: entry.version + 1,
                    invalidated: true,
                    ..entry.clone()
                };
                *entry = snapshot.clone();
                snapshot
            }
            None => return false,
        };

        let version = invalidated.version;
        trace!(key = %key, version, "store: snapshot invalidated");
        self.notify(key, &invalidated);
        self.broadcast(StoreUpdate::Invalidated {
            key: key.clone(),
            version,
        });
        true
    }

    /// Remove a snapshot.
    pub fn evict(&self, key: &CacheKey) -> Option<EntitySnapshot> {
        let removed = self.entries.remove(key).map(|(_, snapshot)| snapshot);
        if removed.is_some() {
            self.broadcast(StoreUpdate::Evicted { key: key.clone() });
            trace!(key = %key, "store: snapshot evicted");
        }
        removed
    }

    /// Evict snapshots no view references whose age exceeds their staleness
    /// bound plus `grace`. Returns the evicted keys.
    pub fn collect_garbage(&self, grace: Duration, is_referenced: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let now = self.clock.now();
        let expired = |snapshot: &EntitySnapshot| snapshot.age(now) >= snapshot.stale_after + grace;

        let candidates: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|r| expired(r.value()))
            .map(|r| r.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for key in candidates {
            if is_referenced(&key) {
                continue;
            }
            if self.entries.remove_if(&key, |_, snapshot| expired(snapshot)).is_some() {
                self.broadcast(StoreUpdate::Evicted { key: key.clone() });
                evicted.push(key);
            }
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "store: garbage collected");
        }
        evicted
    }

    /// Drop every snapshot and subscriber.
    pub fn clear(&self) {
        self.entries.clear();
        self.subscribers.clear();
        self.broadcast(StoreUpdate::Cleared);
        debug!("store: cleared");
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register `callback` for every write to `key`.
    pub fn subscribe(
        &self,
        key: CacheKey,
        callback: impl Fn(&CacheKey, &EntitySnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        trace!(key = %key, id, "store: subscribed");
        Subscription {
            table: Arc::downgrade(&self.subscribers),
            key,
            id,
        }
    }

    /// Number of live subscriptions on `key`.
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscribers.get(key).map(|subs| subs.len()).unwrap_or(0)
    }

    fn notify(&self, key: &CacheKey, snapshot: &EntitySnapshot) {
        // Clone the callbacks out so none runs under the subscriber shard lock.
        let callbacks: Vec<SnapshotCallback> = match self.subscribers.get(key) {
            Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        for callback in callbacks {
            callback(key, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Recipe, TokioClock};
    use std::sync::Mutex;
    use std::thread;

    fn store() -> Arc<EntityStore> {
        EntityStore::new(
            StalenessPolicy::default(),
            Some(EntityId::new("viewer")),
            Arc::new(TokioClock::new()),
        )
    }

    fn recipe(id: &str, likes: u32) -> EntityValue {
        EntityValue::Recipe(Recipe {
            id: id.into(),
            title: "Dal".to_string(),
            author_id: "chef".into(),
            like_count: likes,
            save_count: 0,
            comment_count: 0,
            liked: false,
            saved: false,
            pantry_match: None,
        })
    }

    fn likes(snapshot: &EntitySnapshot) -> u32 {
        snapshot.value.as_recipe().unwrap().like_count
    }

    #[tokio::test]
    async fn test_get_miss_then_put() {
        let store = store();
        let key = CacheKey::recipe("r1");
        assert!(store.get(&key).is_none());

        let outcome = store.write_authoritative(key.clone(), recipe("r1", 4));
        assert_eq!(outcome, WriteOutcome::Applied { version: 1 });
        assert_eq!(likes(&store.get(&key).unwrap()), 4);
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = store();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 1));
        store.write_local(key.clone(), recipe("r1", 2));
        assert_eq!(store.version_of(&key), 2);

        let stale = store.stamp(recipe("r1", 99), 2);
        let outcome = store.put(key.clone(), stale, WriteOrigin::Local);
        assert_eq!(outcome, WriteOutcome::StaleWriteRejected { current_version: 2 });
        assert_eq!(likes(&store.get(&key).unwrap()), 2);
    }

    #[tokio::test]
    async fn test_authoritative_wins_over_version() {
        let store = store();
        let key = CacheKey::recipe("r1");
        for n in 0..5 {
            store.write_local(key.clone(), recipe("r1", n));
        }
        let outcome = store.put(key.clone(), store.stamp(recipe("r1", 42), 1), WriteOrigin::Authoritative);
        assert_eq!(outcome, WriteOutcome::Applied { version: 6 });
        assert_eq!(likes(&store.get(&key).unwrap()), 42);
    }

    #[tokio::test]
    async fn test_fetch_response_loses_to_intervening_write() {
        let store = store();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 1));
        let observed = store.version_of(&key);

        // A local write lands while the fetch is in flight.
        store.write_local(key.clone(), recipe("r1", 2));

        let outcome = store.write_fetched(key.clone(), recipe("r1", 1), observed);
        assert!(!outcome.is_applied());
        assert_eq!(likes(&store.get(&key).unwrap()), 2);
    }

    #[tokio::test]
    async fn test_subscriber_sees_exact_snapshot() {
        let store = store();
        let key = CacheKey::recipe("r1");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(key.clone(), move |_, snapshot| {
            sink.lock().unwrap().push(snapshot.clone());
        });

        store.write_authoritative(key.clone(), recipe("r1", 3));
        store.write_local(key.clone(), recipe("r1", 4));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], store.get(&key).unwrap());
    }

    #[tokio::test]
    async fn test_callback_can_read_store() {
        let store = store();
        let key = CacheKey::recipe("r1");
        let observed = Arc::new(Mutex::new(None));

        let reader = Arc::clone(&store);
        let sink = Arc::clone(&observed);
        let _sub = store.subscribe(key.clone(), move |key, _| {
            *sink.lock().unwrap() = reader.get(key).map(|s| s.version);
        });

        store.write_authoritative(key.clone(), recipe("r1", 3));
        assert_eq!(*observed.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let store = store();
        let key = CacheKey::recipe("r1");
        let calls = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&calls);
        let sub = store.subscribe(key.clone(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.subscriber_count(&key), 1);

        store.write_authoritative(key.clone(), recipe("r1", 1));
        sub.unsubscribe();
        assert_eq!(store.subscriber_count(&key), 0);

        store.write_authoritative(key.clone(), recipe("r1", 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restore_if_version() {
        let store = store();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 10));
        let previous = store.get(&key);
        let written = store.write_local(key.clone(), recipe("r1", 11)).version().unwrap();

        assert!(store.restore_if_version(&key, written, previous));
        let restored = store.get(&key).unwrap();
        assert_eq!(likes(&restored), 10);
        assert_eq!(restored.version, written + 1);
    }

    #[tokio::test]
    async fn test_restore_skipped_after_authoritative_write() {
        let store = store();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 10));
        let previous = store.get(&key);
        let written = store.write_local(key.clone(), recipe("r1", 11)).version().unwrap();
        store.write_authoritative(key.clone(), recipe("r1", 15));

        assert!(!store.restore_if_version(&key, written, previous));
        assert_eq!(likes(&store.get(&key).unwrap()), 15);
    }

    #[tokio::test]
    async fn test_restore_none_removes_key() {
        let store = store();
        let key = CacheKey::recipe("r1");
        let written = store.write_local(key.clone(), recipe("r1", 1)).version().unwrap();
        assert!(store.restore_if_version(&key, written, None));
        assert!(!store.contains(&key));
    }

    #[tokio::test]
    async fn test_invalidate_keeps_value() {
        let store = store();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 5));
        assert!(store.invalidate(&key));

        let snapshot = store.get(&key).unwrap();
        assert!(snapshot.invalidated);
        assert!(snapshot.is_stale(store.clock().now()));
        assert_eq!(likes(&snapshot), 5);
        assert!(!store.invalidate(&CacheKey::recipe("missing")));
    }

    #[tokio::test]
    async fn test_keys_for_entity() {
        let store = store();
        let feed = CacheKey::recipe("r1").in_context(crate::ViewContext::Feed);
        let detail = CacheKey::recipe("r1").in_context(crate::ViewContext::Detail);
        store.write_authoritative(feed.clone(), recipe("r1", 1));
        store.write_authoritative(detail.clone(), recipe("r1", 1));
        store.write_authoritative(CacheKey::recipe("r2"), recipe("r2", 1));

        let keys = store.keys_for_entity(&feed.entity());
        assert_eq!(keys, vec![feed, detail]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_garbage_skips_referenced() {
        let store = store();
        let kept = CacheKey::recipe("r1");
        let dropped = CacheKey::recipe("r2");
        store.write_authoritative(kept.clone(), recipe("r1", 1));
        store.write_authoritative(dropped.clone(), recipe("r2", 1));

        // Nothing is old enough yet.
        assert!(store.collect_garbage(Duration::from_secs(10), |_| false).is_empty());

        tokio::time::advance(Duration::from_secs(120)).await;
        let evicted = store.collect_garbage(Duration::from_secs(10), |key| key == &kept);
        assert_eq!(evicted, vec![dropped]);
        assert!(store.contains(&kept));
    }

    #[tokio::test]
    async fn test_updates_broadcast() {
        let store = store();
        let mut rx = store.updates();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 1));
        store.evict(&key);

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreUpdate::Put {
                key: key.clone(),
                version: 1,
                origin: WriteOrigin::Authoritative
            }
        );
        assert_eq!(rx.recv().await.unwrap(), StoreUpdate::Evicted { key });
    }

    #[test]
    fn test_concurrent_local_writes_same_key() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let store = store();
        let key = CacheKey::recipe("r1");
        store.write_authoritative(key.clone(), recipe("r1", 0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let key = key.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        store.write_local(key.clone(), recipe("r1", t * 100 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Every write got its own version.
        assert_eq!(store.version_of(&key), 1 + 8 * 50);
    }
}
