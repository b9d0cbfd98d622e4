//! Session lifecycle: sign-in to sign-out.
//!
//! A [`Session`] owns one instance of every engine component. Views talk to
//! the session; nothing below it is global.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use larder_scheduler::{ReconciliationScheduler, Trigger};
use larder_sync::{
    CacheKey, Clock, DispatchOutcome, DuplicateActionGuard, EntityId, EntityKind, EntitySnapshot,
    EntityStore, MutationCoordinator, MutationKind, OnceActionKind, OnceOutcome, RealtimeBridge,
    RemoteGateway, Subscription, SyncError, TokioClock, ViewConsistencyMapper, ViewContext, ViewId,
};

use crate::config::LarderConfig;

/// A running realtime bridge.
struct RealtimeTask {
    bridge: Arc<RealtimeBridge>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), SyncError>>,
}

/// One signed-in user's engine.
pub struct Session {
    id: Uuid,
    viewer_id: EntityId,
    config: LarderConfig,
    store: Arc<EntityStore>,
    mapper: Arc<ViewConsistencyMapper>,
    gateway: Arc<dyn RemoteGateway>,
    guard: DuplicateActionGuard,
    coordinator: MutationCoordinator,
    scheduler: ReconciliationScheduler,
    /// First-load fetches per view; cancelled on unmount.
    first_loads: DashMap<ViewId, Vec<JoinHandle<()>>>,
    realtime: Mutex<Option<RealtimeTask>>,
}

impl Session {
    /// Start a session for `viewer_id` on the tokio clock.
    pub fn start(viewer_id: EntityId, gateway: Arc<dyn RemoteGateway>, config: LarderConfig) -> Self {
        Self::start_with_clock(viewer_id, gateway, config, Arc::new(TokioClock::new()))
    }

    pub fn start_with_clock(
        viewer_id: EntityId,
        gateway: Arc<dyn RemoteGateway>,
        config: LarderConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = EntityStore::new(config.sync.staleness.clone(), Some(viewer_id.clone()), clock);
        let mapper = Arc::new(ViewConsistencyMapper::new());
        let coordinator = MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&mapper),
            Arc::clone(&gateway),
            viewer_id.clone(),
        )
        .with_coalesce_window(config.sync.coalesce_window());
        let scheduler = ReconciliationScheduler::new(
            Arc::clone(&store),
            Arc::clone(&mapper),
            Arc::clone(&gateway),
            viewer_id.clone(),
        )
        .with_config(config.reconcile.clone());

        let id = Uuid::new_v4();
        info!(session = %id, viewer = %viewer_id, "session started");
        Self {
            id,
            viewer_id,
            config,
            store,
            mapper,
            gateway,
            guard: DuplicateActionGuard::new(),
            coordinator,
            scheduler,
            first_loads: DashMap::new(),
            realtime: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn viewer_id(&self) -> &EntityId {
        &self.viewer_id
    }

    pub fn config(&self) -> &LarderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<ViewConsistencyMapper> {
        &self.mapper
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &ReconciliationScheduler {
        &self.scheduler
    }

    pub fn guard(&self) -> &DuplicateActionGuard {
        &self.guard
    }

    // =========================================================================
    // Realtime
    // =========================================================================

    /// A bridge wired to this session's store, mapper and scheduler.
    ///
    /// After every reconnect it runs one reconciliation pass for the
    /// subscribed kinds.
    pub fn realtime_bridge(&self, url: impl Into<String>) -> RealtimeBridge {
        let scheduler = self.scheduler.clone();
        RealtimeBridge::new(url, Arc::clone(&self.store), Arc::clone(&self.mapper))
            .with_config(self.config.sync.realtime.clone())
            .with_reconnect_callback(Arc::new(move |kinds: &[EntityKind]| {
                scheduler.reconcile_kinds(kinds);
            }))
    }

    /// Subscribe to the change feed at `url` until sign-out.
    ///
    /// Replaces a bridge started earlier.
    pub async fn connect_realtime(&self, url: impl Into<String>) -> Arc<RealtimeBridge> {
        let bridge = Arc::new(self.realtime_bridge(url));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Arc::clone(&bridge);
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let previous = self.realtime.lock().await.replace(RealtimeTask {
            bridge: Arc::clone(&bridge),
            shutdown_tx,
            handle,
        });
        if let Some(previous) = previous {
            stop_realtime(previous).await;
        }
        bridge
    }

    /// The running bridge, if any.
    pub async fn realtime(&self) -> Option<Arc<RealtimeBridge>> {
        self.realtime
            .lock()
            .await
            .as_ref()
            .map(|task| Arc::clone(&task.bridge))
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Register `view` rendering `keys` in order.
    ///
    /// Keys that are not cached yet are fetched in the background on behalf
    /// of the view. Remounting a view first cancels the work started for its
    /// previous keys. Returns the number of first-load fetches started.
    pub fn mount(&self, view: ViewId, keys: Vec<CacheKey>) -> usize {
        self.cancel_view_work(&view);
        let missing: Vec<CacheKey> = keys.iter().filter(|k| !self.store.contains(k)).cloned().collect();
        self.mapper.mount(view.clone(), keys);

        let mut handles = Vec::with_capacity(missing.len());
        for key in &missing {
            handles.push(self.spawn_first_load(view.clone(), key.clone()));
        }
        let started = handles.len();
        if started > 0 {
            let mut loads = self.first_loads.entry(view.clone()).or_default();
            loads.retain(|h| !h.is_finished());
            loads.extend(handles);
        }

        self.scheduler.trigger(&view, Trigger::VisibleSetChanged);
        debug!(view = %view, first_loads = started, "view mounted");
        started
    }

    fn spawn_first_load(&self, view: ViewId, key: CacheKey) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let mapper = Arc::clone(&self.mapper);
        let gateway = Arc::clone(&self.gateway);
        let viewer_id = self.viewer_id.clone();
        tokio::spawn(async move {
            let observed = store.version_of(&key);
            match gateway.fetch_entity_detail(key.kind, &key.id, &viewer_id).await {
                Ok(value) => {
                    if !mapper.is_mounted(&view) {
                        debug!(view = %view, key = %key, "view gone, first load discarded");
                        return;
                    }
                    store.write_fetched(key, value, observed);
                }
                Err(e) => debug!(view = %view, key = %key, error = %e, "first load failed"),
            }
        })
    }

    /// Fetch a feed page into `view`. Offset 0 mounts the view; later pages
    /// append to it. Returns the keys of the page.
    #[tracing::instrument(skip(self, view), fields(view = %view))]
    pub async fn mount_feed(&self, view: ViewId, offset: u32) -> Result<Vec<CacheKey>, SyncError> {
        // Versions before the request: writes landing during it win.
        let observed: HashMap<CacheKey, u64> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| k.context == Some(ViewContext::Feed))
            .map(|k| {
                let version = self.store.version_of(&k);
                (k, version)
            })
            .collect();

        let page = self
            .gateway
            .fetch_feed_page(&self.viewer_id, self.config.feed_page_size, offset)
            .await?;

        let mut keys = Vec::with_capacity(page.len());
        for value in page {
            let key = CacheKey::new(value.kind(), value.id()).in_context(ViewContext::Feed);
            let version = observed.get(&key).copied().unwrap_or(0);
            self.store.write_fetched(key.clone(), value, version);
            keys.push(key);
        }

        if offset == 0 {
            self.cancel_view_work(&view);
            self.mapper.mount(view.clone(), keys.clone());
        } else if !self.mapper.append(&view, keys.clone()) {
            warn!(offset, "feed page for unmounted view");
            return Ok(keys);
        }
        self.scheduler.trigger(&view, Trigger::VisibleSetChanged);
        info!(offset, count = keys.len(), "feed page loaded");
        Ok(keys)
    }

    /// Remove `view`, cancelling its first loads and reconciliation.
    pub fn unmount(&self, view: &ViewId) {
        self.mapper.unmount(view);
        self.scheduler.cancel_view(view);
        self.abort_first_loads(view);
        debug!(view = %view, "view unmounted");
    }

    /// Cancel reconciliation and first loads of a mounted `view` before its
    /// registrations are replaced.
    fn cancel_view_work(&self, view: &ViewId) {
        if !self.mapper.is_mounted(view) {
            return;
        }
        self.scheduler.cancel_passes(view);
        self.abort_first_loads(view);
        debug!(view = %view, "previous registrations cancelled");
    }

    fn abort_first_loads(&self, view: &ViewId) {
        if let Some((_, handles)) = self.first_loads.remove(view) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub fn focus(&self, view: &ViewId) -> usize {
        self.scheduler.focus(view)
    }

    pub fn blur(&self, view: &ViewId) {
        self.scheduler.blur(view)
    }

    /// The view scrolled so that item `index` is centred.
    pub fn scroll_to(&self, view: &ViewId, index: usize) -> usize {
        self.scheduler.set_focus_position(view, index)
    }

    // =========================================================================
    // Reads and interactions
    // =========================================================================

    pub fn get(&self, key: &CacheKey) -> Option<EntitySnapshot> {
        self.store.get(key)
    }

    pub fn subscribe(
        &self,
        key: CacheKey,
        callback: impl Fn(&CacheKey, &EntitySnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(key, callback)
    }

    /// Toggle like, save or follow on the entity behind `key`.
    pub async fn dispatch(&self, kind: MutationKind, key: CacheKey) -> Result<DispatchOutcome, SyncError> {
        self.coordinator.dispatch(kind, key).await
    }

    /// Record that the viewer opened `target`, at most once per session.
    pub async fn log_view(&self, action: OnceActionKind, target: &EntityId) -> Result<OnceOutcome, SyncError> {
        self.guard
            .log_once(self.gateway.as_ref(), action, &self.viewer_id, target)
            .await
    }

    /// Evict stale snapshots no view renders.
    pub fn collect_garbage(&self) -> Vec<CacheKey> {
        self.store
            .collect_garbage(self.config.sync.gc_grace(), |key| self.mapper.is_referenced(key))
    }

    /// Tear everything down. Pending mutations finish on their own tasks
    /// but their writes land in an empty store.
    pub async fn sign_out(&self) {
        if let Some(task) = self.realtime.lock().await.take() {
            stop_realtime(task).await;
        }
        self.scheduler.shutdown();

        let views: Vec<ViewId> = self.first_loads.iter().map(|e| e.key().clone()).collect();
        for view in &views {
            self.abort_first_loads(view);
        }

        self.guard.clear();
        self.mapper.clear();
        self.store.clear();
        info!(session = %self.id, "signed out");
    }
}

async fn stop_realtime(task: RealtimeTask) {
    task.shutdown_tx.send_replace(true);
    match task.handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "realtime bridge stopped with error"),
        Err(e) => warn!(error = %e, "realtime bridge task failed"),
    }
}
