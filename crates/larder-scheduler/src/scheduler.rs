//! Reconciliation scheduler implementation.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use larder_sync::{
    CacheKey, Clock, EntityId, EntityKind, EntityRef, EntityStore, EntityValue, RemoteGateway,
    ViewConsistencyMapper, ViewId,
};

use crate::{CorrectionPredicate, ReconcileConfig, Trigger, ZeroCounterPredicate, visible_window};

/// Background work owned by one view.
struct ViewTasks {
    /// Index of the item the view is centred on.
    focus: usize,
    cancel_tx: watch::Sender<bool>,
    passes: Vec<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ViewTasks {
    fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            focus: 0,
            cancel_tx,
            passes: Vec::new(),
            ticker: None,
        }
    }

    fn prune(&mut self) {
        self.passes.retain(|handle| !handle.is_finished());
    }

    fn cancel(self) {
        self.cancel_tx.send_replace(true);
        for handle in self.passes {
            handle.abort();
        }
        if let Some(ticker) = self.ticker {
            ticker.abort();
        }
    }
}

/// Issues staggered correction fetches for the entities a view shows.
///
/// Every pass belongs to a view. Unmounting the view (followed by
/// [`cancel_view`](Self::cancel_view)) stops its passes; a pass also
/// re-checks the registration before each write, so nothing lands for a
/// view that has gone away.
#[derive(Clone)]
pub struct ReconciliationScheduler {
    store: Arc<EntityStore>,
    mapper: Arc<ViewConsistencyMapper>,
    gateway: Arc<dyn RemoteGateway>,
    clock: Arc<dyn Clock>,
    viewer_id: EntityId,
    config: ReconcileConfig,
    predicate: Arc<dyn CorrectionPredicate>,
    views: Arc<DashMap<ViewId, ViewTasks>>,
    /// Reconnect refreshes not yet done, by the view whose pass owns them.
    reconnect_owners: Arc<DashMap<EntityRef, ViewId>>,
    /// Copies whose refreshed value still matched the predicate, at the
    /// version the refresh wrote. The server has confirmed them.
    confirmed: Arc<DashMap<CacheKey, u64>>,
}

impl ReconciliationScheduler {
    /// Create a scheduler fetching as `viewer_id`.
    pub fn new(
        store: Arc<EntityStore>,
        mapper: Arc<ViewConsistencyMapper>,
        gateway: Arc<dyn RemoteGateway>,
        viewer_id: EntityId,
    ) -> Self {
        let clock = Arc::clone(store.clock());
        Self {
            store,
            mapper,
            gateway,
            clock,
            viewer_id,
            config: ReconcileConfig::default(),
            predicate: Arc::new(ZeroCounterPredicate),
            views: Arc::new(DashMap::new()),
            reconnect_owners: Arc::new(DashMap::new()),
            confirmed: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default zero-counter heuristic.
    pub fn with_predicate(mut self, predicate: impl CorrectionPredicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Keys of `view` inside its visible window.
    pub fn visible_keys(&self, view: &ViewId) -> Vec<CacheKey> {
        let keys = self.mapper.view_keys(view);
        let focus = self.views.get(view).map(|t| t.focus).unwrap_or(0);
        let window = visible_window(keys.len(), focus, self.config.window_size);
        keys[window].to_vec()
    }

    /// Start a pass over the visible entities of `view` that need correction.
    ///
    /// Returns the number of entities scheduled for refresh.
    #[tracing::instrument(skip(self, view), fields(view = %view))]
    pub fn trigger(&self, view: &ViewId, trigger: Trigger) -> usize {
        if !self.mapper.is_mounted(view) {
            trace!(%trigger, "view not mounted, ignoring trigger");
            return 0;
        }
        let entities = self.candidates(&self.visible_keys(view));
        self.spawn_pass(view, trigger, entities)
    }

    /// Move the focus of `view` to `index`, reconciling the new window.
    pub fn set_focus_position(&self, view: &ViewId, index: usize) -> usize {
        if !self.mapper.is_mounted(view) {
            return 0;
        }
        let changed = {
            let mut tasks = self.views.entry(view.clone()).or_insert_with(ViewTasks::new);
            let changed = tasks.focus != index;
            tasks.focus = index;
            changed
        };
        if changed {
            self.trigger(view, Trigger::VisibleSetChanged)
        } else {
            0
        }
    }

    /// Reconcile `view` now and then every period until it blurs.
    pub fn focus(&self, view: &ViewId) -> usize {
        if !self.mapper.is_mounted(view) {
            return 0;
        }
        let count = self.trigger(view, Trigger::FocusGained);

        let mut tasks = self.views.entry(view.clone()).or_insert_with(ViewTasks::new);
        if let Some(previous) = tasks.ticker.take() {
            previous.abort();
        }
        let cancel_rx = tasks.cancel_tx.subscribe();
        let this = self.clone();
        let view_id = view.clone();
        tasks.ticker = Some(tokio::spawn(async move { this.tick(view_id, cancel_rx).await }));
        debug!(view = %view, period_secs = self.config.period_secs, "periodic reconciliation started");
        count
    }

    /// Stop periodic reconciliation of `view`. Passes already running continue.
    pub fn blur(&self, view: &ViewId) {
        if let Some(mut tasks) = self.views.get_mut(view) {
            if let Some(ticker) = tasks.ticker.take() {
                ticker.abort();
                debug!(view = %view, "periodic reconciliation stopped");
            }
        }
    }

    /// One refresh of every visible cached entity of `kinds`, whatever the
    /// predicate says. Each entity is refreshed once, attributed to the
    /// first view showing it; if that view is cancelled first, the entity
    /// moves to another view still showing it.
    #[tracing::instrument(skip(self))]
    pub fn reconcile_kinds(&self, kinds: &[EntityKind]) -> usize {
        let mut seen = HashSet::new();
        let mut total = 0;
        for view in self.mapper.view_ids() {
            let entities: Vec<EntityRef> = self
                .visible_keys(&view)
                .into_iter()
                .filter(|key| kinds.contains(&key.kind) && self.store.contains(key))
                .map(|key| key.entity())
                .filter(|entity| seen.insert(entity.clone()))
                .collect();
            for entity in &entities {
                self.reconnect_owners.insert(entity.clone(), view.clone());
            }
            total += self.spawn_pass(&view, Trigger::Reconnect, entities);
        }
        info!(total, "reconnect reconciliation scheduled");
        total
    }

    /// Cancel every pass and the ticker of `view`.
    pub fn cancel_view(&self, view: &ViewId) -> bool {
        match self.views.remove(view) {
            Some((_, tasks)) => {
                tasks.cancel();
                debug!(view = %view, "reconciliation cancelled");
                self.hand_off_reconnect(view);
                true
            }
            None => false,
        }
    }

    /// Cancel the running passes of `view` but keep its focus position and
    /// periodic ticker. Used when the view's registrations are replaced.
    pub fn cancel_passes(&self, view: &ViewId) -> usize {
        let cancelled = {
            let Some(mut tasks) = self.views.get_mut(view) else {
                return 0;
            };
            let (cancel_tx, _) = watch::channel(false);
            std::mem::replace(&mut tasks.cancel_tx, cancel_tx).send_replace(true);
            tasks.prune();
            let cancelled = tasks.passes.len();
            for handle in tasks.passes.drain(..) {
                handle.abort();
            }
            if let Some(ticker) = tasks.ticker.take() {
                ticker.abort();
                let cancel_rx = tasks.cancel_tx.subscribe();
                let this = self.clone();
                let view_id = view.clone();
                tasks.ticker = Some(tokio::spawn(async move { this.tick(view_id, cancel_rx).await }));
            }
            cancelled
        };
        debug!(view = %view, cancelled, "reconciliation passes cancelled");
        self.hand_off_reconnect(view);
        cancelled
    }

    /// Cancel all background work.
    pub fn shutdown(&self) {
        self.reconnect_owners.clear();
        let views: Vec<ViewId> = self.views.iter().map(|entry| entry.key().clone()).collect();
        for view in &views {
            self.cancel_view(view);
        }
        self.confirmed.clear();
        info!(views = views.len(), "reconciliation scheduler shut down");
    }

    /// Passes of `view` still running.
    pub fn active_passes(&self, view: &ViewId) -> usize {
        self.views
            .get(view)
            .map(|tasks| tasks.passes.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Distinct entities behind `keys` whose cached value needs a refresh.
    fn candidates(&self, keys: &[CacheKey]) -> Vec<EntityRef> {
        let now = self.clock.now();
        let mut seen = HashSet::new();
        keys.iter()
            .filter(|key| {
                self.store.get(key).is_some_and(|snapshot| {
                    let confirmed = self
                        .confirmed
                        .get(*key)
                        .is_some_and(|version| *version == snapshot.version);
                    (!confirmed && self.predicate.needs_correction(&snapshot.value))
                        || (self.config.refresh_stale && snapshot.is_stale(now))
                })
            })
            .map(|key| key.entity())
            .filter(|entity| seen.insert(entity.clone()))
            .collect()
    }

    fn spawn_pass(&self, view: &ViewId, trigger: Trigger, entities: Vec<EntityRef>) -> usize {
        if entities.is_empty() {
            trace!(view = %view, %trigger, "nothing to reconcile");
            return 0;
        }
        let count = entities.len();

        let mut tasks = self.views.entry(view.clone()).or_insert_with(ViewTasks::new);
        tasks.prune();
        let cancel_rx = tasks.cancel_tx.subscribe();
        let this = self.clone();
        let view_id = view.clone();
        tasks
            .passes
            .push(tokio::spawn(async move { this.run_pass(view_id, entities, cancel_rx).await }));

        debug!(view = %view, %trigger, count, "reconciliation pass scheduled");
        count
    }

    async fn run_pass(&self, view: ViewId, entities: Vec<EntityRef>, cancel_rx: watch::Receiver<bool>) {
        for (i, entity) in entities.into_iter().enumerate() {
            if i > 0 {
                self.clock.sleep(self.config.stagger()).await;
            }
            if self.cancelled(&view, &cancel_rx) {
                debug!(view = %view, "pass cancelled");
                self.hand_off_reconnect(&view);
                return;
            }

            let value = match self
                .gateway
                .fetch_entity_detail(entity.kind, &entity.id, &self.viewer_id)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    debug!(entity = %entity, error = %e, "refresh failed, dropped");
                    self.release_reconnect(&view, &entity);
                    continue;
                }
            };

            if self.cancelled(&view, &cancel_rx) {
                debug!(view = %view, entity = %entity, "view gone, refresh discarded");
                self.hand_off_reconnect(&view);
                return;
            }
            let written = self.write_through(&entity, &value);
            self.release_reconnect(&view, &entity);
            trace!(entity = %entity, written, "entity reconciled");
        }
    }

    fn cancelled(&self, view: &ViewId, cancel_rx: &watch::Receiver<bool>) -> bool {
        *cancel_rx.borrow() || !self.mapper.is_mounted(view)
    }

    /// Write `value` authoritatively to every cached copy of `entity`.
    fn write_through(&self, entity: &EntityRef, value: &EntityValue) -> usize {
        let keys: BTreeSet<CacheKey> = self
            .store
            .keys_for_entity(entity)
            .into_iter()
            .chain(self.mapper.keys_for(entity))
            .collect();

        let mut written = 0;
        for key in keys {
            let Some(current) = self.store.get(&key) else {
                continue;
            };
            let merged = current.value.adopt_shared(value);
            let still_flagged = self.predicate.needs_correction(&merged);
            if let Some(version) = self.store.write_authoritative(key.clone(), merged).version() {
                if still_flagged {
                    self.confirmed.insert(key, version);
                } else {
                    self.confirmed.remove(&key);
                }
                written += 1;
            }
        }
        written
    }

    fn release_reconnect(&self, view: &ViewId, entity: &EntityRef) {
        self.reconnect_owners.remove_if(entity, |_, owner| owner == view);
    }

    /// Move the unfinished reconnect refreshes of `from` to the first other
    /// mounted view showing each entity. Entities nobody shows are dropped.
    fn hand_off_reconnect(&self, from: &ViewId) {
        let orphaned: HashSet<EntityRef> = self
            .reconnect_owners
            .iter()
            .filter(|entry| entry.value() == from)
            .map(|entry| entry.key().clone())
            .collect();
        if orphaned.is_empty() {
            return;
        }

        let mut assigned = HashSet::new();
        for view in self.mapper.view_ids() {
            if &view == from {
                continue;
            }
            let entities: Vec<EntityRef> = self
                .visible_keys(&view)
                .into_iter()
                .filter(|key| self.store.contains(key))
                .map(|key| key.entity())
                .filter(|entity| orphaned.contains(entity) && assigned.insert(entity.clone()))
                .collect();
            for entity in &entities {
                self.reconnect_owners.insert(entity.clone(), view.clone());
            }
            if !entities.is_empty() {
                debug!(from = %from, to = %view, count = entities.len(), "reconnect refreshes handed off");
                self.spawn_pass(&view, Trigger::Reconnect, entities);
            }
        }

        for entity in orphaned.difference(&assigned) {
            self.release_reconnect(from, entity);
        }
    }

    async fn tick(&self, view: ViewId, cancel_rx: watch::Receiver<bool>) {
        loop {
            self.clock.sleep(self.config.period()).await;
            if self.cancelled(&view, &cancel_rx) {
                return;
            }
            self.trigger(&view, Trigger::Periodic);
        }
    }
}
