//! Query Synchronizer.
//!
//! A [`QueryObserver`] holds "the current known result set" for one
//! `(query, locations)` identity of one cache. Membership is always decided
//! by the cache's own local filter; the observer never evaluates the query
//! itself. The one incremental patch it applies is removal, which can only
//! shrink the set.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;

use cachet_core::lock::lock_logged;
use cachet_core::{
    digest, identity_digest, is_location_prefix, normalize_locations, Cache, CacheEvent,
    EventPayload, EventType, Keyed, Listener, LocKey, LocationChain, SubscribeOptions, SyncConfig,
    Value,
};

use crate::binding::SubscriptionBinding;
use crate::request::{RequestTracker, Ticket};

/// Event types a query observer subscribes to.
pub const QUERY_EVENT_TYPES: [EventType; 9] = [
    EventType::ItemsQueried,
    EventType::ItemCreated,
    EventType::ItemUpdated,
    EventType::ItemRemoved,
    EventType::ItemRetrieved,
    EventType::ItemSet,
    EventType::CacheCleared,
    EventType::QueryInvalidated,
    EventType::LocationInvalidated,
];

/// Identity of a `(query, locations)` pair.
///
/// Both halves are hex SHA-256 digests: the query through the
/// primitive-coercing identity hash, the locations through the key
/// normalizer. `{id: 5}` and `{id: "5"}` therefore share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryIdentity {
    pub query: String,
    pub locations: String,
}

impl QueryIdentity {
    pub fn of(query: &Value, locations: &[LocKey]) -> Self {
        Self {
            query: identity_digest(query),
            locations: digest(&normalize_locations(locations)),
        }
    }

    /// `"<query>:<locations>"`, the form listed in `query_invalidated` events.
    pub fn token(&self) -> String {
        format!("{}:{}", self.query, self.locations)
    }
}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.query, self.locations)
    }
}

/// `(items, is_loading)` as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
    pub items: Vec<T>,
    pub is_loading: bool,
}

impl<T> Default for QuerySnapshot<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            is_loading: false,
        }
    }
}

struct QueryControl<C: Cache> {
    cache: Option<Arc<C>>,
    query: Value,
    locations: LocationChain,
    identity: QueryIdentity,
    requests: RequestTracker,
}

/// A remote `all` that has been issued a ticket but not yet run.
struct PendingFetch<C: Cache> {
    cache: Arc<C>,
    query: Value,
    locations: LocationChain,
    ticket: Ticket,
}

/// What a batch of events does to the result set, accumulated in order.
struct Batch<T> {
    /// Working copy of the items, once an event touched them.
    items: Option<Vec<T>>,
    /// Run the local filter once the batch is folded.
    refilter: bool,
    /// Keys removed since the last authoritative replacement; they stay out
    /// of a later re-filter.
    removed: Vec<String>,
    changed: bool,
    refetch: Option<EventType>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: None,
            refilter: false,
            removed: Vec::new(),
            changed: false,
            refetch: None,
        }
    }
}

impl<T: Clone> Batch<T> {
    fn working(&mut self, state: &watch::Sender<QuerySnapshot<T>>) -> &mut Vec<T> {
        self.items.get_or_insert_with(|| state.borrow().items.clone())
    }

    /// An authoritative result set supersedes everything folded so far.
    fn replace(&mut self, items: Vec<T>) {
        self.items = Some(items);
        self.refilter = false;
        self.removed.clear();
        self.changed = true;
    }
}

/// Whether invalidating `invalidated` touches an observer scoped to `scope`:
/// one chain is a prefix of the other. An empty chain invalidates everything.
fn locations_overlap(invalidated: &[LocKey], scope: &[LocKey]) -> bool {
    is_location_prefix(invalidated, scope) || is_location_prefix(scope, invalidated)
}

struct QueryShared<C: Cache> {
    control: Mutex<QueryControl<C>>,
    state: watch::Sender<QuerySnapshot<C::Item>>,
    config: SyncConfig,
}

impl<C: Cache> QueryShared<C> {
    fn lock(&self) -> MutexGuard<'_, QueryControl<C>> {
        lock_logged(&self.control, &self.config.logger)
    }

    /// Apply a delivered batch in order, running the local filter at most
    /// once and notifying at most once.
    fn apply(self: &Arc<Self>, events: &[CacheEvent<C::Item>]) {
        let mut control = self.lock();
        let Some(cache) = control.cache.clone() else {
            return;
        };
        let mut batch = Batch::default();
        for event in events {
            self.fold(&control, &mut batch, event);
        }

        if batch.refilter {
            let mut items = cache.local_filter(&control.query, &control.locations);
            if !batch.removed.is_empty() {
                items.retain(|item| !batch.removed.contains(&item.key().normalized()));
            }
            batch.items = Some(items);
            batch.changed = true;
        }
        if batch.changed {
            let items = match batch.items {
                Some(items) => items,
                None => self.state.borrow().items.clone(),
            };
            self.state.send_modify(|snapshot| snapshot.items = items);
        }

        let Some(cause) = batch.refetch else {
            return;
        };
        let pending = self.begin_fetch(&mut control);
        drop(control);
        if let (Some(pending), Ok(handle)) = (pending, Handle::try_current()) {
            self.config
                .logger
                .scope(|| tracing::debug!(cause = %cause, "Refetching invalidated query"));
            handle.spawn(Arc::clone(self).run_fetch(pending));
        }
    }

    fn fold(
        &self,
        control: &QueryControl<C>,
        batch: &mut Batch<C::Item>,
        event: &CacheEvent<C::Item>,
    ) {
        match &event.payload {
            EventPayload::ItemsQueried {
                query,
                locations,
                items,
            } => {
                if QueryIdentity::of(query, locations) != control.identity {
                    return;
                }
                batch.replace(items.clone());
            }
            EventPayload::ItemCreated { key, .. }
            | EventPayload::ItemUpdated { key, .. }
            | EventPayload::ItemRetrieved { key, .. }
            | EventPayload::ItemSet { key, .. } => {
                let written = key.normalized();
                batch.removed.retain(|removed| *removed != written);
                batch.refilter = true;
            }
            EventPayload::ItemRemoved { key, .. } => {
                let removed = key.normalized();
                let items = batch.working(&self.state);
                let before = items.len();
                items.retain(|item| item.key().normalized() != removed);
                batch.changed |= items.len() != before;
                batch.removed.push(removed);
            }
            EventPayload::CacheCleared => {
                let changed = batch.changed || !batch.working(&self.state).is_empty();
                batch.replace(Vec::new());
                batch.changed = changed;
            }
            EventPayload::QueryInvalidated { query_tokens, .. } => {
                if !query_tokens.is_empty() && !query_tokens.contains(&control.identity.token()) {
                    return;
                }
                let refetch = self.config.refetch_on_query_invalidated;
                self.invalidated(batch, refetch, EventType::QueryInvalidated);
            }
            EventPayload::LocationInvalidated { locations } => {
                if !locations_overlap(locations, &control.locations) {
                    return;
                }
                let refetch = self.config.refetch_on_location_invalidated;
                self.invalidated(batch, refetch, EventType::LocationInvalidated);
            }
        }
    }

    /// Schedule a remote refetch if allowed and a runtime is available,
    /// else a local re-filter.
    fn invalidated(&self, batch: &mut Batch<C::Item>, refetch: bool, cause: EventType) {
        if refetch {
            if Handle::try_current().is_ok() {
                batch.refetch = Some(cause);
                return;
            }
            self.config.logger.scope(|| {
                tracing::warn!(
                    cause = %cause,
                    "No tokio runtime for invalidation refetch, re-filtering locally"
                )
            });
        }
        batch.refilter = true;
    }

    /// Issue a ticket and mark loading. `None` when unbound.
    fn begin_fetch(&self, control: &mut QueryControl<C>) -> Option<PendingFetch<C>> {
        let cache = control.cache.clone()?;
        let ticket = control.requests.issue();
        self.state
            .send_if_modified(|snapshot| !std::mem::replace(&mut snapshot.is_loading, true));
        Some(PendingFetch {
            cache,
            query: control.query.clone(),
            locations: control.locations.clone(),
            ticket,
        })
    }

    async fn run_fetch(self: Arc<Self>, pending: PendingFetch<C>) -> Vec<C::Item> {
        let items = match pending.cache.all(&pending.query, &pending.locations).await {
            Ok(items) => items,
            Err(error) => {
                self.config.logger.scope(|| {
                    tracing::warn!(
                        operation = "all",
                        error = %error,
                        transient = error.is_transient(),
                        "Query refetch failed"
                    )
                });
                Vec::new()
            }
        };
        self.commit(pending.ticket, items.clone());
        items
    }

    fn commit(&self, ticket: Ticket, items: Vec<C::Item>) {
        let mut control = self.lock();
        if !control.requests.try_commit(ticket) {
            self.config
                .logger
                .scope(|| tracing::debug!("Discarding stale query refetch"));
            return;
        }
        let is_loading = control.requests.pending();
        self.state.send_modify(|snapshot| {
            snapshot.items = items;
            snapshot.is_loading = is_loading;
        });
    }
}

fn query_listener<C: Cache>(shared: &Arc<QueryShared<C>>) -> Listener<C::Item> {
    let weak: Weak<QueryShared<C>> = Arc::downgrade(shared);
    Arc::new(move |events: &[CacheEvent<C::Item>]| {
        if let Some(shared) = weak.upgrade() {
            shared.apply(events);
        }
    })
}

/// Keeps the result set of one query in view.
pub struct QueryObserver<C: Cache> {
    shared: Arc<QueryShared<C>>,
    binding: SubscriptionBinding<C>,
}

impl<C: Cache> QueryObserver<C> {
    pub fn new(
        cache: Option<Arc<C>>,
        query: Value,
        locations: LocationChain,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(QuerySnapshot {
            items: Vec::new(),
            is_loading: true,
        });
        let binding = SubscriptionBinding::new(config.logger.clone());
        let identity = QueryIdentity::of(&query, &locations);
        let shared = Arc::new(QueryShared {
            control: Mutex::new(QueryControl {
                cache: None,
                query: Value::Undefined,
                locations: Vec::new(),
                identity,
                requests: RequestTracker::new(),
            }),
            state,
            config,
        });
        let mut observer = Self { shared, binding };
        observer.retarget(cache, query, locations);
        observer
    }

    /// Point the observer at a new cache, query or location chain.
    ///
    /// Same cache handle and same identity is a no-op, however the query
    /// value was constructed.
    pub fn set_target(&mut self, cache: Option<Arc<C>>, query: Value, locations: LocationChain) {
        {
            let control = self.shared.lock();
            let same_cache = match (&control.cache, &cache) {
                (Some(current), Some(next)) => Arc::ptr_eq(current, next),
                (None, None) => true,
                _ => false,
            };
            if same_cache && control.identity == QueryIdentity::of(&query, &locations) {
                return;
            }
        }
        self.retarget(cache, query, locations);
    }

    /// Change the query and locations, keeping the cache.
    pub fn set_query(&mut self, query: Value, locations: LocationChain) {
        let cache = self.shared.lock().cache.clone();
        self.set_target(cache, query, locations);
    }

    fn retarget(&mut self, cache: Option<Arc<C>>, query: Value, locations: LocationChain) {
        {
            let mut control = self.shared.lock();
            control.requests.retarget();
            let items = cache
                .as_ref()
                .map(|cache| cache.local_filter(&query, &locations))
                .unwrap_or_default();
            control.identity = QueryIdentity::of(&query, &locations);
            control.cache = cache.clone();
            control.query = query;
            control.locations = locations;
            self.shared.state.send_replace(QuerySnapshot {
                items,
                is_loading: false,
            });
        }

        let options = SubscribeOptions::new()
            .with_event_types(QUERY_EVENT_TYPES)
            .with_debounce(self.shared.config.debounce());
        self.binding
            .bind(cache.as_ref(), query_listener(&self.shared), options);
    }

    /// Force a remote `all` for the current identity.
    ///
    /// Resolves to the server-confirmed items, or empty if the remote failed
    /// (logged) or the observer has no cache. Stale results are not applied.
    pub fn refetch(&self) -> impl Future<Output = Vec<C::Item>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let pending = {
            let mut control = shared.lock();
            shared.begin_fetch(&mut control)
        };
        async move {
            match pending {
                Some(pending) => shared.run_fetch(pending).await,
                None => Vec::new(),
            }
        }
    }

    /// Stop observing. The snapshot resets to `([], false)`; any in-flight
    /// refetch is discarded. Idempotent.
    pub fn close(&mut self) {
        self.binding.teardown();
        let mut control = self.shared.lock();
        control.requests.retarget();
        control.cache = None;
        self.shared.state.send_if_modified(|snapshot| {
            let changed = !snapshot.items.is_empty() || snapshot.is_loading;
            snapshot.items.clear();
            snapshot.is_loading = false;
            changed
        });
    }

    pub fn snapshot(&self) -> QuerySnapshot<C::Item> {
        self.shared.state.borrow().clone()
    }

    pub fn items(&self) -> Vec<C::Item> {
        self.shared.state.borrow().items.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().is_loading
    }

    pub fn identity(&self) -> QueryIdentity {
        self.shared.lock().identity.clone()
    }

    /// Receiver notified on every applied state change.
    pub fn watch(&self) -> watch::Receiver<QuerySnapshot<C::Item>> {
        self.shared.state.subscribe()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }
}

impl<C: Cache> Drop for QueryObserver<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{ItemKey, Record};
    use cachet_test_utils::assertions::assert_keys;
    use cachet_test_utils::fixtures::{status_query, Comment, User};
    use cachet_test_utils::MemoryCache;

    #[test]
    fn test_identity_coerces_primitives() {
        let numeric = Value::Record(Record::new().with("id", 5));
        let textual = Value::Record(Record::new().with("id", "5"));
        assert_eq!(
            QueryIdentity::of(&numeric, &[]),
            QueryIdentity::of(&textual, &[])
        );
        assert_ne!(
            QueryIdentity::of(&numeric, &[]),
            QueryIdentity::of(&numeric, &[LocKey::new("org", 1)])
        );
    }

    #[test]
    fn test_identity_ignores_record_order() {
        let a = Value::Record(Record::new().with("a", 1).with("b", 2));
        let b = Value::Record(Record::new().with("b", 2).with("a", 1));
        let identity = QueryIdentity::of(&a, &[]);
        assert_eq!(identity, QueryIdentity::of(&b, &[]));
        assert_eq!(identity.token(), identity.to_string());
    }

    #[test]
    fn test_initial_load_uses_local_filter() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        cache.seed(User::active(2, "bob").with_status("inactive"));
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            status_query("active"),
            vec![],
            SyncConfig::default(),
        );
        assert_keys(&obs.items(), &[User::key_for(1)]);
        assert!(!obs.is_loading());
        assert_eq!(cache.local_filter_calls(), 1);
        assert_eq!(cache.remote_all_calls(), 0);
    }

    #[test]
    fn test_same_identity_is_noop() {
        let cache = MemoryCache::<User>::shared();
        let mut obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            Value::Record(Record::new().with("status", "active").with("id", 1)),
            vec![],
            SyncConfig::default(),
        );
        obs.set_query(
            Value::Record(Record::new().with("id", "1").with("status", "active")),
            vec![],
        );
        assert_eq!(cache.local_filter_calls(), 1);
        assert_eq!(cache.subscribe_calls(), 1);
    }

    #[test]
    fn test_items_queried_for_other_identity_is_ignored() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            status_query("active"),
            vec![],
            SyncConfig::default(),
        );

        cache.emit(CacheEvent::items_queried(
            status_query("inactive"),
            vec![],
            vec![User::active(9, "zed")],
        ));
        assert_keys(&obs.items(), &[User::key_for(1)]);

        cache.emit(CacheEvent::items_queried(
            status_query("active"),
            vec![],
            vec![User::active(9, "zed")],
        ));
        assert_keys(&obs.items(), &[User::key_for(9)]);
    }

    #[test]
    fn test_location_scoped_query() {
        let cache = MemoryCache::shared();
        cache.seed(Comment::new(1, 7, "first"));
        cache.seed(Comment::new(2, 8, "elsewhere"));
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            Value::Null,
            Comment::post(7),
            SyncConfig::default(),
        );
        assert_keys(&obs.items(), &[Comment::new(1, 7, "").key()]);

        cache.set(Comment::new(3, 7, "second"));
        assert_keys(
            &obs.items(),
            &[Comment::new(1, 7, "").key(), Comment::new(3, 7, "").key()],
        );
        cache.emit(CacheEvent::item_removed(
            ItemKey::composite("comment", "1", Comment::post(7)),
            None,
        ));
        assert_keys(&obs.items(), &[Comment::new(3, 7, "").key()]);
    }

    #[test]
    fn test_invalidation_without_runtime_refilters_locally() {
        let cache = MemoryCache::shared();
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            status_query("active"),
            vec![],
            SyncConfig::default(),
        );
        cache.seed_local(User::active(1, "ada"));
        cache.invalidate_queries(vec![], None);
        assert_keys(&obs.items(), &[User::key_for(1)]);
        assert_eq!(cache.remote_all_calls(), 0);
    }

    #[test]
    fn test_batch_refilters_once_and_keeps_removals() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        cache.seed(User::active(2, "bob"));
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            status_query("active"),
            vec![],
            SyncConfig::default(),
        );
        let filters_before = cache.local_filter_calls();

        // The local store still holds user 1; the batch says it is gone.
        obs.shared.apply(&[
            CacheEvent::item_removed(User::key_for(1), None),
            CacheEvent::item_set(User::key_for(3), User::active(3, "cy")),
            CacheEvent::item_set(User::key_for(4), User::active(4, "di")),
        ]);
        assert_eq!(cache.local_filter_calls(), filters_before + 1);
        assert_keys(&obs.items(), &[User::key_for(2)]);
    }

    #[test]
    fn test_batch_clear_after_removal_still_notifies() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            status_query("active"),
            vec![],
            SyncConfig::default(),
        );
        let rx = obs.watch();

        obs.shared.apply(&[
            CacheEvent::item_removed(User::key_for(1), None),
            CacheEvent::cache_cleared(),
        ]);
        assert!(rx.has_changed().unwrap());
        assert!(obs.items().is_empty());
    }

    #[test]
    fn test_batch_items_queried_supersedes_earlier_writes() {
        let cache = MemoryCache::shared();
        cache.seed(User::active(1, "ada"));
        let obs = QueryObserver::new(
            Some(Arc::clone(&cache)),
            status_query("active"),
            vec![],
            SyncConfig::default(),
        );
        let filters_before = cache.local_filter_calls();

        obs.shared.apply(&[
            CacheEvent::item_set(User::key_for(1), User::active(1, "ada")),
            CacheEvent::items_queried(
                status_query("active"),
                vec![],
                vec![User::active(9, "zed")],
            ),
        ]);
        assert_eq!(cache.local_filter_calls(), filters_before);
        assert_keys(&obs.items(), &[User::key_for(9)]);
    }

    #[test]
    fn test_location_overlap_is_two_way_prefix() {
        let post = Comment::post(7);
        assert!(locations_overlap(&[], &post));
        assert!(locations_overlap(&post, &[]));
        assert!(locations_overlap(&post, &post));
        assert!(!locations_overlap(&Comment::post(8), &post));
    }
}
