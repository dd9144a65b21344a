//! Integration Tests for the Single-Item Synchronizer
//!
//! Covers initial-load synchronicity, event filtering, the single-subscription
//! invariant, refetch behavior (success, failure, loading flag), teardown and
//! debounced delivery against the in-memory reference cache.

use std::sync::Arc;
use std::time::Duration;

use cachet_core::{CacheEvent, ItemKey, RemoteOperations, SyncConfig};
use cachet_sync::{observe_item, observe_item_with_config, ItemSnapshot};
use cachet_test_utils::fixtures::User;
use cachet_test_utils::logging::capture_logger;
use cachet_test_utils::MemoryCache;

// ============================================================================
// INITIAL LOAD AND EVENTS
// ============================================================================

#[test]
fn initial_load_is_synchronous_and_local() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));

    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    assert_eq!(
        obs.snapshot(),
        ItemSnapshot {
            item: Some(User::active(1, "Alice")),
            is_loading: false,
        }
    );
    assert_eq!(cache.local_get_calls(), 1);
    assert_eq!(cache.remote_get_calls(), 0);
}

#[test]
fn missing_item_loads_as_none() {
    let cache = MemoryCache::<User>::shared();
    cache.seed_remote(User::active(1, "Alice"));

    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));
    assert_eq!(obs.snapshot(), ItemSnapshot::default());
}

#[test]
fn end_to_end_update_then_remove() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(ItemKey::primary("user", "1")));
    assert_eq!(obs.item().map(|u| u.name), Some("Alice".to_string()));

    cache.emit(CacheEvent::item_updated(
        User::key_for(1),
        User::active(1, "Alicia"),
    ));
    assert_eq!(obs.item().map(|u| u.name), Some("Alicia".to_string()));

    cache.emit(CacheEvent::item_removed(User::key_for(1), None));
    assert_eq!(obs.item(), None);
    assert!(!obs.is_loading());
}

#[test]
fn events_for_other_keys_leave_item_unchanged() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));
    let rx = obs.watch();

    cache.set(User::active(2, "Bob"));
    cache.emit(CacheEvent::item_removed(User::key_for(2), None));
    assert_eq!(obs.item(), Some(User::active(1, "Alice")));
    assert!(!rx.has_changed().unwrap());

    cache.set(User::active(1, "Alice").with_status("away"));
    assert_eq!(obs.item().map(|u| u.status), Some("away".to_string()));
    assert!(rx.has_changed().unwrap());
}

#[test]
fn every_item_event_type_replaces_the_item() {
    let cache = MemoryCache::shared();
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    cache.emit(CacheEvent::item_created(User::key_for(1), User::active(1, "a")));
    assert_eq!(obs.item().map(|u| u.name), Some("a".to_string()));
    cache.emit(CacheEvent::item_retrieved(User::key_for(1), User::active(1, "b")));
    assert_eq!(obs.item().map(|u| u.name), Some("b".to_string()));
    cache.emit(CacheEvent::item_set(User::key_for(1), User::active(1, "c")));
    assert_eq!(obs.item().map(|u| u.name), Some("c".to_string()));
}

#[test]
fn cache_cleared_resets_item() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    cache.clear();
    assert_eq!(obs.snapshot(), ItemSnapshot::default());
}

#[test]
fn invalidation_events_do_not_touch_the_item() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    cache.invalidate_queries(vec![], Some("test"));
    cache.invalidate_location(vec![]);
    assert_eq!(obs.item(), Some(User::active(1, "Alice")));
}

// ============================================================================
// SUBSCRIPTION LIFECYCLE
// ============================================================================

#[test]
fn key_changes_never_resubscribe() {
    let cache = MemoryCache::shared();
    for id in 0..5 {
        cache.seed(User::active(id, "u"));
    }
    let mut obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(0)));

    for round in 0..20 {
        obs.set_key(Some(User::key_for(round % 5)));
        assert_eq!(obs.item().map(|u| u.id), Some(round % 5));
    }
    obs.set_key(None);
    assert_eq!(obs.item(), None);
    assert!(obs.is_bound());

    assert_eq!(cache.subscribe_calls(), 1);
    assert_eq!(cache.listener_count(), 1);
}

#[test]
fn switching_caches_moves_the_subscription() {
    let first = MemoryCache::shared();
    let second = MemoryCache::shared();
    first.seed(User::active(1, "first"));
    second.seed(User::active(1, "second"));

    let mut obs = observe_item(Some(Arc::clone(&first)), Some(User::key_for(1)));
    obs.set_target(Some(Arc::clone(&second)), Some(User::key_for(1)));
    assert_eq!(obs.item().map(|u| u.name), Some("second".to_string()));
    assert_eq!(first.listener_count(), 0);
    assert_eq!(second.listener_count(), 1);

    first.set(User::active(1, "ignored"));
    assert_eq!(obs.item().map(|u| u.name), Some("second".to_string()));

    obs.set_target(None, Some(User::key_for(1)));
    assert!(!obs.is_bound());
    assert_eq!(obs.item(), None);
    assert_eq!(second.listener_count(), 0);
}

#[test]
fn teardown_unsubscribes_exactly_once() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let mut obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    obs.close();
    obs.close();
    drop(obs);

    assert_eq!(cache.subscribe_calls(), 1);
    assert_eq!(cache.unsubscribe_calls(), 1);
    assert_eq!(cache.listener_count(), 0);
}

#[test]
fn dropping_observer_unsubscribes() {
    let cache = MemoryCache::<User>::shared();
    {
        let _obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));
        assert_eq!(cache.listener_count(), 1);
    }
    assert_eq!(cache.unsubscribe_calls(), 1);
    assert_eq!(cache.listener_count(), 0);
}

// ============================================================================
// REFETCH
// ============================================================================

#[tokio::test]
async fn refetch_returns_and_applies_server_value() {
    let cache = MemoryCache::shared();
    cache.seed_local(User::active(1, "stale"));
    cache.seed_remote(User::active(1, "fresh"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    let got = obs.refetch().await;
    assert_eq!(got, Some(User::active(1, "fresh")));
    assert_eq!(
        obs.snapshot(),
        ItemSnapshot {
            item: Some(User::active(1, "fresh")),
            is_loading: false,
        }
    );
    assert_eq!(cache.remote_get_calls(), 1);
}

#[tokio::test]
async fn refetch_is_loading_until_resolved() {
    let cache = MemoryCache::shared();
    cache.seed_remote(User::active(1, "fresh"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    let release = cache.gate_next_call();
    let pending = tokio::spawn(obs.refetch());
    while cache.gated_waiting() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(obs.is_loading());

    release.send(()).unwrap();
    pending.await.unwrap();
    assert!(!obs.is_loading());
    assert_eq!(obs.item(), Some(User::active(1, "fresh")));
}

#[tokio::test]
async fn failed_refetch_resolves_to_none_and_logs() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let (logger, capture) = capture_logger();
    let obs = observe_item_with_config(
        Some(Arc::clone(&cache)),
        Some(User::key_for(1)),
        SyncConfig::new().with_logger(logger),
    );

    cache.fail_remote(true);
    assert_eq!(obs.refetch().await, None);
    assert_eq!(obs.snapshot(), ItemSnapshot::default());
    assert!(capture.contains("Item refetch failed"));
    assert!(capture.contains("injected failure"));
    assert!(capture.contains("transient=true"));
}

#[tokio::test]
async fn unbound_refetch_resolves_to_none() {
    let obs = observe_item::<MemoryCache<User>>(None, Some(User::key_for(1)));
    assert_eq!(obs.refetch().await, None);
    assert_eq!(obs.snapshot(), ItemSnapshot::default());
}

#[tokio::test]
async fn remote_mutations_flow_back_through_events() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "Alice"));
    let obs = observe_item(Some(Arc::clone(&cache)), Some(User::key_for(1)));

    cache
        .update(&User::key_for(1), User::active(1, "Alicia"))
        .await
        .unwrap();
    assert_eq!(obs.item().map(|u| u.name), Some("Alicia".to_string()));

    cache.remove(&User::key_for(1)).await.unwrap();
    assert_eq!(obs.item(), None);

    cache.create(User::active(1, "Again"), &[]).await.unwrap();
    assert_eq!(obs.item().map(|u| u.name), Some("Again".to_string()));
}

// ============================================================================
// DEBOUNCE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn debounced_observer_applies_burst_once_idle() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "a"));
    let obs = observe_item_with_config(
        Some(Arc::clone(&cache)),
        Some(User::key_for(1)),
        SyncConfig::new().with_debounce(Duration::from_millis(50)),
    );
    let rx = obs.watch();

    for name in ["b", "c", "d"] {
        cache.set(User::active(1, name));
    }
    assert_eq!(obs.item().map(|u| u.name), Some("a".to_string()));
    assert!(!rx.has_changed().unwrap());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(obs.item().map(|u| u.name), Some("d".to_string()));
    assert!(rx.has_changed().unwrap());
}

#[tokio::test(start_paused = true)]
async fn debounced_burst_settles_on_last_matching_event() {
    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "a"));
    cache.seed(User::active(2, "other"));
    let obs = observe_item_with_config(
        Some(Arc::clone(&cache)),
        Some(User::key_for(1)),
        SyncConfig::new().with_debounce(Duration::from_millis(20)),
    );

    cache.set(User::active(1, "b"));
    cache.clear();
    cache.set(User::active(1, "c"));
    cache.set(User::active(2, "noise"));
    cache.emit(CacheEvent::query_invalidated(vec![], None));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(obs.item(), Some(User::active(1, "c")));

    cache.set(User::active(1, "d"));
    cache.evict(&User::key_for(1));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(obs.item(), None);
}

#[test]
fn debounce_without_tokio_timer_applies_immediately() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .build()
        .unwrap();
    let _guard = runtime.enter();

    let cache = MemoryCache::shared();
    cache.seed(User::active(1, "a"));
    let obs = observe_item_with_config(
        Some(Arc::clone(&cache)),
        Some(User::key_for(1)),
        SyncConfig::new().with_debounce(Duration::from_millis(5)),
    );

    cache.set(User::active(1, "b"));
    assert_eq!(obs.item(), Some(User::active(1, "b")));
}
