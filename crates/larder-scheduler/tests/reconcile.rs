//! Reconciliation scheduler behavior against a scripted backend.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::sleep;

use larder_scheduler::{ReconcileConfig, ReconciliationScheduler, Trigger};
use larder_sync::testing::{self, Rpc, ScriptedGateway};
use larder_sync::{
    CacheKey, EntityId, EntityKind, EntityRef, EntityStore, EntityValue, StalenessPolicy, SyncError,
    TokioClock, ViewConsistencyMapper, ViewContext, ViewId,
};

struct Fixture {
    store: Arc<EntityStore>,
    mapper: Arc<ViewConsistencyMapper>,
    gateway: Arc<ScriptedGateway>,
    scheduler: ReconciliationScheduler,
}

fn fixture(config: ReconcileConfig) -> Fixture {
    let store = EntityStore::new(
        StalenessPolicy::default(),
        Some(EntityId::new("me")),
        Arc::new(TokioClock::new()),
    );
    let mapper = Arc::new(ViewConsistencyMapper::new());
    let gateway = ScriptedGateway::new();
    let scheduler = ReconciliationScheduler::new(
        Arc::clone(&store),
        Arc::clone(&mapper),
        gateway.clone(),
        EntityId::new("me"),
    )
    .with_config(config);
    Fixture {
        store,
        mapper,
        gateway,
        scheduler,
    }
}

/// Server-side recipe with every counter non-zero.
fn server_recipe(id: &str, likes: u32) -> EntityValue {
    let mut value = testing::recipe(id, "chef", likes);
    if let EntityValue::Recipe(r) = &mut value {
        r.save_count = 1;
        r.comment_count = 1;
    }
    value
}

fn feed_key(id: &str) -> CacheKey {
    CacheKey::recipe(id).in_context(ViewContext::Feed)
}

fn likes(store: &EntityStore, key: &CacheKey) -> u32 {
    store.get(key).unwrap().value.as_recipe().unwrap().like_count
}

/// Mount a feed of `ids` whose cached copies all under-report likes as 0.
fn mount_underreported_feed(f: &Fixture, view: &ViewId, ids: &[&str]) {
    let keys: Vec<CacheKey> = ids.iter().map(|id| feed_key(id)).collect();
    for id in ids {
        f.gateway.insert(server_recipe(id, 7));
        f.store.write_fetched(feed_key(id), testing::recipe(id, "chef", 0), 0);
    }
    f.mapper.mount(view.clone(), keys);
}

#[tokio::test(start_paused = true)]
async fn test_zero_counts_corrected_in_every_copy() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0", "r1", "r2"]);

    // A detail copy of r0 that no view has registered yet
    let detail = CacheKey::recipe("r0").in_context(ViewContext::Detail);
    f.store.write_fetched(detail.clone(), testing::recipe("r0", "chef", 0), 0);

    assert_eq!(f.scheduler.trigger(&feed, Trigger::FocusGained), 3);
    sleep(Duration::from_secs(2)).await;

    for id in ["r0", "r1", "r2"] {
        assert_eq!(likes(&f.store, &feed_key(id)), 7, "feed copy of {}", id);
    }
    assert_eq!(likes(&f.store, &detail), 7);
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 3);
}

#[tokio::test(start_paused = true)]
async fn test_refreshes_are_staggered() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0", "r1", "r2"]);

    f.scheduler.trigger(&feed, Trigger::FocusGained);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        f.gateway.detail_calls(),
        vec![
            EntityRef::new(EntityKind::Recipe, "r0"),
            EntityRef::new(EntityKind::Recipe, "r1"),
            EntityRef::new(EntityKind::Recipe, "r2"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unmount_cancels_pending_refreshes() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0", "r1", "r2"]);

    f.scheduler.trigger(&feed, Trigger::FocusGained);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);

    f.mapper.unmount(&feed);
    assert!(f.scheduler.cancel_view(&feed));
    sleep(Duration::from_secs(5)).await;

    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);
    assert_eq!(likes(&f.store, &feed_key("r1")), 0);
    assert_eq!(likes(&f.store, &feed_key("r2")), 0);
    assert_eq!(f.scheduler.active_passes(&feed), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_refresh_discarded_after_unmount() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0"]);
    f.gateway.set_latency(Duration::from_millis(100));

    f.scheduler.trigger(&feed, Trigger::FocusGained);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);

    // Only the registration goes away; the pass notices on its own
    f.mapper.unmount(&feed);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(likes(&f.store, &feed_key("r0")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_on_unmounted_view_does_nothing() {
    let f = fixture(ReconcileConfig::default());
    assert_eq!(f.scheduler.trigger(&ViewId::new("nowhere"), Trigger::Periodic), 0);
    assert_eq!(f.scheduler.focus(&ViewId::new("nowhere")), 0);
    sleep(Duration::from_secs(60)).await;
    assert!(f.gateway.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_custom_predicate_can_skip_everything() {
    let config = ReconcileConfig {
        refresh_stale: false,
        ..ReconcileConfig::default()
    };
    let f = fixture(config);
    let scheduler = f.scheduler.clone().with_predicate(|_: &EntityValue| false);
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0", "r1"]);

    assert_eq!(scheduler.trigger(&feed, Trigger::FocusGained), 0);
    sleep(Duration::from_secs(1)).await;
    assert!(f.gateway.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_the_visible_window_is_reconciled() {
    let config = ReconcileConfig {
        window_size: 4,
        stagger_ms: 10,
        ..ReconcileConfig::default()
    };
    let f = fixture(config);
    let feed = ViewId::new("feed");
    let ids: Vec<String> = (0..30).map(|i| format!("r{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    mount_underreported_feed(&f, &feed, &id_refs);

    assert_eq!(f.scheduler.trigger(&feed, Trigger::FocusGained), 4);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(
        f.gateway.detail_calls().iter().map(|e| e.id.to_string()).collect::<Vec<_>>(),
        vec!["r0", "r1", "r2", "r3"]
    );

    f.gateway.clear_calls();
    assert_eq!(f.scheduler.set_focus_position(&feed, 20), 4);
    // Same position again is not a change
    assert_eq!(f.scheduler.set_focus_position(&feed, 20), 0);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(
        f.gateway.detail_calls().iter().map(|e| e.id.to_string()).collect::<Vec<_>>(),
        vec!["r18", "r19", "r20", "r21"]
    );
    assert_eq!(likes(&f.store, &feed_key("r10")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_focus_refreshes_periodically_until_blur() {
    let f = fixture(ReconcileConfig::default());
    let scheduler = f.scheduler.clone().with_predicate(|_: &EntityValue| true);
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0"]);

    assert_eq!(scheduler.focus(&feed), 1);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);

    // A feed reload under-reports again
    let version = f.store.version_of(&feed_key("r0"));
    f.store.write_fetched(feed_key("r0"), testing::recipe("r0", "chef", 0), version);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 2);

    scheduler.blur(&feed);
    let version = f.store.version_of(&feed_key("r0"));
    f.store.write_fetched(feed_key("r0"), testing::recipe("r0", "chef", 0), version);
    sleep(Duration::from_secs(120)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_kinds_refreshes_each_entity_once() {
    let f = fixture(ReconcileConfig::default());
    for id in ["r0", "r1"] {
        f.gateway.insert(server_recipe(id, 9));
    }
    f.gateway.insert(testing::profile("p0", 4, 4));

    // Fully counted values: the predicate would skip them
    let feed = ViewId::new("feed");
    let detail = ViewId::new("detail:r0");
    let detail_key = CacheKey::recipe("r0").in_context(ViewContext::Detail);
    f.store.write_fetched(feed_key("r0"), server_recipe("r0", 1), 0);
    f.store.write_fetched(feed_key("r1"), server_recipe("r1", 1), 0);
    f.store.write_fetched(detail_key.clone(), server_recipe("r0", 1), 0);
    f.store.write_fetched(CacheKey::profile("p0"), testing::profile("p0", 1, 1), 0);
    f.mapper.mount(feed.clone(), vec![feed_key("r0"), feed_key("r1"), CacheKey::profile("p0")]);
    f.mapper.mount(detail.clone(), vec![detail_key.clone()]);

    assert_eq!(f.scheduler.trigger(&feed, Trigger::FocusGained), 0);
    assert_eq!(f.scheduler.reconcile_kinds(&[EntityKind::Recipe]), 2);
    sleep(Duration::from_secs(2)).await;

    let mut fetched = f.gateway.detail_calls();
    fetched.sort();
    assert_eq!(
        fetched,
        vec![
            EntityRef::new(EntityKind::Recipe, "r0"),
            EntityRef::new(EntityKind::Recipe, "r1"),
        ]
    );
    assert_eq!(likes(&f.store, &feed_key("r0")), 9);
    assert_eq!(likes(&f.store, &detail_key), 9);
    assert_eq!(likes(&f.store, &feed_key("r1")), 9);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_is_dropped_and_pass_continues() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0", "r1"]);
    f.gateway
        .fail_next(Rpc::EntityDetail, SyncError::Network("offline".to_string()));

    f.scheduler.trigger(&feed, Trigger::FocusGained);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 2);
    assert_eq!(likes(&f.store, &feed_key("r0")), 0);
    assert_eq!(likes(&f.store, &feed_key("r1")), 7);
}

#[tokio::test(start_paused = true)]
async fn test_pantry_match_survives_refresh() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    f.gateway.insert(server_recipe("r0", 7));

    let mut cached = testing::recipe("r0", "chef", 0);
    if let EntityValue::Recipe(r) = &mut cached {
        r.pantry_match = Some(60);
    }
    f.store.write_fetched(feed_key("r0"), cached, 0);
    f.mapper.mount(feed.clone(), vec![feed_key("r0")]);

    f.scheduler.trigger(&feed, Trigger::FocusGained);
    sleep(Duration::from_secs(1)).await;

    let snapshot = f.store.get(&feed_key("r0")).unwrap();
    let recipe = snapshot.value.as_recipe().unwrap();
    assert_eq!(recipe.like_count, 7);
    assert_eq!(recipe.pantry_match, Some(60));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_all_views() {
    let f = fixture(ReconcileConfig::default());
    let a = ViewId::new("a");
    let b = ViewId::new("b");
    mount_underreported_feed(&f, &a, &["r0", "r1", "r2"]);
    f.mapper.mount(b.clone(), vec![feed_key("r2"), feed_key("r1")]);

    f.scheduler.focus(&a);
    f.scheduler.focus(&b);
    sleep(Duration::from_millis(10)).await;
    let before = f.gateway.call_count(Rpc::EntityDetail);

    f.scheduler.shutdown();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), before);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_zero_is_not_refetched() {
    let config = ReconcileConfig {
        refresh_stale: false,
        ..ReconcileConfig::default()
    };
    let f = fixture(config);
    let feed = ViewId::new("feed");
    // The server agrees: nobody has saved or commented on r0
    f.gateway.insert(testing::recipe("r0", "chef", 5));
    f.store.write_fetched(feed_key("r0"), testing::recipe("r0", "chef", 0), 0);
    f.mapper.mount(feed.clone(), vec![feed_key("r0")]);

    assert_eq!(f.scheduler.focus(&feed), 1);
    sleep(Duration::from_secs(95)).await;

    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);
    assert_eq!(likes(&f.store, &feed_key("r0")), 5);
    assert_eq!(f.scheduler.trigger(&feed, Trigger::VisibleSetChanged), 0);

    // A new under-reported copy is suspect again
    let version = f.store.version_of(&feed_key("r0"));
    f.store.write_fetched(feed_key("r0"), testing::recipe("r0", "chef", 0), version);
    assert_eq!(f.scheduler.trigger(&feed, Trigger::VisibleSetChanged), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_refresh_moves_to_remaining_view() {
    let f = fixture(ReconcileConfig::default());
    let a = ViewId::new("a");
    let b = ViewId::new("b");
    let ids = ["r1", "r2", "r3"];
    for id in ids {
        f.gateway.insert(server_recipe(id, 7));
        f.store.write_fetched(feed_key(id), server_recipe(id, 3), 0);
        f.store
            .write_fetched(CacheKey::recipe(id).in_context(ViewContext::Detail), server_recipe(id, 3), 0);
    }
    f.mapper.mount(a.clone(), ids.iter().map(|id| feed_key(id)).collect());
    f.mapper.mount(
        b.clone(),
        ids.iter()
            .map(|id| CacheKey::recipe(*id).in_context(ViewContext::Detail))
            .collect(),
    );

    assert_eq!(f.scheduler.reconcile_kinds(&[EntityKind::Recipe]), 3);
    sleep(Duration::from_millis(10)).await;
    f.mapper.unmount(&a);
    f.scheduler.cancel_view(&a);
    sleep(Duration::from_secs(2)).await;

    let seen: Vec<u32> = ids
        .iter()
        .map(|id| likes(&f.store, &CacheKey::recipe(*id).in_context(ViewContext::Detail)))
        .collect();
    assert_eq!(seen, vec![7, 7, 7]);
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_passes_keeps_periodic_ticker() {
    let f = fixture(ReconcileConfig::default());
    let feed = ViewId::new("feed");
    mount_underreported_feed(&f, &feed, &["r0", "r1", "r2"]);

    assert_eq!(f.scheduler.focus(&feed), 3);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);

    f.mapper.mount(feed.clone(), vec![feed_key("r0")]);
    assert_eq!(f.scheduler.cancel_passes(&feed), 1);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 1);
    assert_eq!(likes(&f.store, &feed_key("r1")), 0);

    let version = f.store.version_of(&feed_key("r0"));
    f.store.write_fetched(feed_key("r0"), testing::recipe("r0", "chef", 0), version);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(f.gateway.call_count(Rpc::EntityDetail), 2);
    assert_eq!(likes(&f.store, &feed_key("r0")), 7);
}
