//! Single-Item Synchronizer.
//!
//! An [`ItemObserver`] holds "the current known value" for one key of one
//! cache. The value is loaded synchronously from the local store whenever the
//! target changes, follows matching mutation events, and is replaced by the
//! server-confirmed value on [`ItemObserver::refetch`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;

use cachet_core::lock::lock_logged;
use cachet_core::{
    Cache, CacheEvent, EventPayload, EventType, ItemKey, Listener, SubscribeOptions, SyncConfig,
};

use crate::binding::SubscriptionBinding;
use crate::request::{RequestTracker, Ticket};

/// Event types an item observer subscribes to.
pub const ITEM_EVENT_TYPES: [EventType; 6] = [
    EventType::ItemCreated,
    EventType::ItemUpdated,
    EventType::ItemRetrieved,
    EventType::ItemSet,
    EventType::ItemRemoved,
    EventType::CacheCleared,
];

/// `(item, is_loading)` as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSnapshot<T> {
    /// `None` means unknown locally, confirmed absent, or unbound.
    pub item: Option<T>,
    pub is_loading: bool,
}

impl<T> Default for ItemSnapshot<T> {
    fn default() -> Self {
        Self {
            item: None,
            is_loading: false,
        }
    }
}

struct ItemControl<C: Cache> {
    cache: Option<Arc<C>>,
    key: Option<ItemKey>,
    normalized: Option<String>,
    requests: RequestTracker,
}

struct ItemShared<C: Cache> {
    control: Mutex<ItemControl<C>>,
    state: watch::Sender<ItemSnapshot<C::Item>>,
    config: SyncConfig,
}

impl<C: Cache> ItemShared<C> {
    fn lock(&self) -> MutexGuard<'_, ItemControl<C>> {
        lock_logged(&self.control, &self.config.logger)
    }

    /// Apply a delivered batch. Only the last event that concerns the
    /// target decides the item, so a debounced burst costs one update.
    fn apply(&self, events: &[CacheEvent<C::Item>]) {
        let control = self.lock();
        let Some(target) = control.normalized.as_deref() else {
            return;
        };
        let Some((event, next)) = events
            .iter()
            .rev()
            .find_map(|event| resolve(event, target).map(|next| (event, next)))
        else {
            return;
        };
        self.config.logger.scope(|| {
            tracing::trace!(
                event_type = %event.event_type(),
                key = target,
                batch = events.len(),
                "Item event applied"
            )
        });
        self.state.send_modify(|snapshot| snapshot.item = next);
    }

    fn commit(&self, ticket: Ticket, item: Option<C::Item>) {
        let mut control = self.lock();
        if !control.requests.try_commit(ticket) {
            self.config
                .logger
                .scope(|| tracing::debug!("Discarding stale item refetch"));
            return;
        }
        let is_loading = control.requests.pending();
        self.state.send_modify(|snapshot| {
            snapshot.item = item;
            snapshot.is_loading = is_loading;
        });
    }
}

/// The item `event` leaves behind for `target`, or `None` if it does not
/// concern it.
fn resolve<T: Clone>(event: &CacheEvent<T>, target: &str) -> Option<Option<T>> {
    match &event.payload {
        EventPayload::CacheCleared => Some(None),
        EventPayload::ItemCreated { key, item }
        | EventPayload::ItemUpdated { key, item }
        | EventPayload::ItemRetrieved { key, item }
        | EventPayload::ItemSet { key, item } => {
            (key.normalized() == target).then(|| Some(item.clone()))
        }
        EventPayload::ItemRemoved { key, .. } => (key.normalized() == target).then_some(None),
        _ => None,
    }
}

/// Listener capturing a weak reference, so the cache's listener list does not
/// keep the observer alive.
fn item_listener<C: Cache>(shared: &Arc<ItemShared<C>>) -> Listener<C::Item> {
    let weak: Weak<ItemShared<C>> = Arc::downgrade(shared);
    Arc::new(move |events: &[CacheEvent<C::Item>]| {
        if let Some(shared) = weak.upgrade() {
            shared.apply(events);
        }
    })
}

/// Keeps one key of one cache in view.
pub struct ItemObserver<C: Cache> {
    shared: Arc<ItemShared<C>>,
    binding: SubscriptionBinding<C>,
}

impl<C: Cache> ItemObserver<C> {
    pub fn new(cache: Option<Arc<C>>, key: Option<ItemKey>, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(ItemSnapshot {
            item: None,
            is_loading: true,
        });
        let binding = SubscriptionBinding::new(config.logger.clone());
        let shared = Arc::new(ItemShared {
            control: Mutex::new(ItemControl {
                cache: None,
                key: None,
                normalized: None,
                requests: RequestTracker::new(),
            }),
            state,
            config,
        });
        let mut observer = Self { shared, binding };
        observer.retarget(cache, key);
        observer
    }

    /// Point the observer at a new cache and/or key.
    ///
    /// Same cache handle and same normalized key is a no-op. Otherwise any
    /// in-flight refetch becomes stale, the item is reloaded synchronously
    /// from the local store and the subscription's key filter is updated in
    /// place (a new subscription is only created for a different cache).
    pub fn set_target(&mut self, cache: Option<Arc<C>>, key: Option<ItemKey>) {
        {
            let control = self.shared.lock();
            let same_cache = match (&control.cache, &cache) {
                (Some(current), Some(next)) => Arc::ptr_eq(current, next),
                (None, None) => true,
                _ => false,
            };
            let normalized = key.as_ref().map(ItemKey::normalized);
            if same_cache && control.normalized == normalized {
                return;
            }
        }
        self.retarget(cache, key);
    }

    /// Change the key, keeping the cache.
    pub fn set_key(&mut self, key: Option<ItemKey>) {
        let cache = self.shared.lock().cache.clone();
        self.set_target(cache, key);
    }

    fn retarget(&mut self, cache: Option<Arc<C>>, key: Option<ItemKey>) {
        {
            let mut control = self.shared.lock();
            control.requests.retarget();
            let item = match (&cache, &key) {
                (Some(cache), Some(key)) => cache.local_get(key),
                _ => None,
            };
            control.cache = cache.clone();
            control.normalized = key.as_ref().map(ItemKey::normalized);
            control.key = key.clone();
            self.shared.state.send_replace(ItemSnapshot {
                item,
                is_loading: false,
            });
        }

        let options = SubscribeOptions::new()
            .with_keys(key.into_iter().collect())
            .with_event_types(ITEM_EVENT_TYPES)
            .with_debounce(self.shared.config.debounce());
        self.binding
            .bind(cache.as_ref(), item_listener(&self.shared), options);
    }

    /// Force a remote round trip for the current key.
    ///
    /// Resolves to the remote value, or `None` if the remote failed (the
    /// failure is logged) or the observer is unbound. The result is only
    /// applied if the target has not changed in the meantime and no newer
    /// refetch has already been applied. The returned future does not borrow
    /// the observer.
    pub fn refetch(&self) -> impl Future<Output = Option<C::Item>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let started = {
            let mut control = shared.lock();
            match (control.cache.clone(), control.key.clone()) {
                (Some(cache), Some(key)) => {
                    let ticket = control.requests.issue();
                    shared.state.send_if_modified(|snapshot| {
                        !std::mem::replace(&mut snapshot.is_loading, true)
                    });
                    Some((cache, key, ticket))
                }
                _ => None,
            }
        };

        async move {
            let (cache, key, ticket) = started?;
            let item = match cache.get(&key).await {
                Ok(item) => item,
                Err(error) => {
                    shared.config.logger.scope(|| {
                        tracing::warn!(
                            operation = "get",
                            key = %key,
                            error = %error,
                            transient = error.is_transient(),
                            "Item refetch failed"
                        )
                    });
                    None
                }
            };
            shared.commit(ticket, item.clone());
            item
        }
    }

    /// Stop observing. The snapshot resets to `(None, false)`; any in-flight
    /// refetch is discarded. Idempotent.
    pub fn close(&mut self) {
        self.binding.teardown();
        let mut control = self.shared.lock();
        control.requests.retarget();
        control.cache = None;
        control.key = None;
        control.normalized = None;
        self.shared.state.send_if_modified(|snapshot| {
            let changed = snapshot.item.is_some() || snapshot.is_loading;
            snapshot.item = None;
            snapshot.is_loading = false;
            changed
        });
    }

    pub fn snapshot(&self) -> ItemSnapshot<C::Item> {
        self.shared.state.borrow().clone()
    }

    pub fn item(&self) -> Option<C::Item> {
        self.shared.state.borrow().item.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().is_loading
    }

    /// Receiver notified on every applied state change.
    pub fn watch(&self) -> watch::Receiver<ItemSnapshot<C::Item>> {
        self.shared.state.subscribe()
    }

    pub fn key(&self) -> Option<ItemKey> {
        self.shared.lock().key.clone()
    }

    /// Whether the observer currently holds a subscription.
    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }
}

impl<C: Cache> Drop for ItemObserver<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_test_utils::fixtures::User;
    use cachet_test_utils::MemoryCache;

    fn observer(cache: &Arc<MemoryCache<User>>, id: i64) -> ItemObserver<MemoryCache<User>> {
        ItemObserver::new(
            Some(Arc::clone(cache)),
            Some(User::key_for(id)),
            SyncConfig::default(),
        )
    }

    #[test]
    fn test_initial_load_is_synchronous() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        let obs = observer(&cache, 1);
        assert_eq!(
            obs.snapshot(),
            ItemSnapshot {
                item: Some(User::active(1, "ada")),
                is_loading: false
            }
        );
        assert_eq!(cache.remote_get_calls(), 0);
    }

    #[test]
    fn test_unbound_observer_is_inert() {
        let obs = ItemObserver::<MemoryCache<User>>::new(None, None, SyncConfig::default());
        assert_eq!(obs.snapshot(), ItemSnapshot::default());
        assert!(!obs.is_bound());

        let cache = MemoryCache::<User>::shared();
        let keyless = ItemObserver::new(Some(Arc::clone(&cache)), None, SyncConfig::default());
        cache.set(User::active(1, "ada"));
        assert_eq!(keyless.item(), None);
    }

    #[test]
    fn test_events_for_other_keys_are_ignored() {
        let cache = MemoryCache::shared();
        let obs = observer(&cache, 1);
        let mut rx = obs.watch();
        rx.borrow_and_update();

        cache.emit(CacheEvent::item_updated(User::key_for(2), User::active(2, "bob")));
        assert_eq!(obs.item(), None);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_key_change_reuses_subscription() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        cache.seed(User::active(2, "bob"));
        let mut obs = observer(&cache, 1);

        obs.set_key(Some(User::key_for(2)));
        assert_eq!(obs.item(), Some(User::active(2, "bob")));
        obs.set_key(Some(ItemKey::primary("user", "2")));
        assert_eq!(cache.subscribe_calls(), 1);
        assert_eq!(cache.local_get_calls(), 2);

        cache.set(User::active(1, "ada").with_status("inactive"));
        assert_eq!(obs.item(), Some(User::active(2, "bob")));
    }

    #[test]
    fn test_close_is_idempotent() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        let mut obs = observer(&cache, 1);
        obs.close();
        obs.close();
        drop(obs);
        assert_eq!(cache.unsubscribe_calls(), 1);
        assert_eq!(cache.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_refetch_without_target_has_no_side_effects() {
        let cache = MemoryCache::<User>::shared();
        let obs = ItemObserver::new(Some(Arc::clone(&cache)), None, SyncConfig::default());
        let mut rx = obs.watch();
        rx.borrow_and_update();

        assert_eq!(obs.refetch().await, None);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(cache.remote_get_calls(), 0);
    }
}
