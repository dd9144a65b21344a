//! CACHET Test Utilities
//!
//! Shared test infrastructure for the cachet workspace:
//! - `MemoryCache`: an in-memory [`Cache`] with a separate "server" store,
//!   call counters, failure injection and gates for ordering remote calls
//! - Fixtures for keyed items (`User`, `Comment`)
//! - Proptest generators
//! - A capturing logger for asserting on observer diagnostics

pub use cachet_core::{
    Cache, CacheError, CacheEvent, CacheResult, EventSource, ItemKey, Keyed, LocKey, LocalCache,
    Logger, Record, RemoteError, RemoteOperations, SubscribeOptions, SyncConfig, Value,
};

use async_trait::async_trait;
use cachet_core::identity_hash;
use cachet_core::is_location_prefix;
use cachet_core::lock::{lock_or_recover, read_or_recover, write_or_recover};
use cachet_core::{EventOrigin, FilterHandle, Listener, Subscription};
use cachet_events::EventHub;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;

// ============================================================================
// FILTERABLE ITEMS
// ============================================================================

/// Field access used by [`MemoryCache`] to evaluate record queries.
pub trait Filterable {
    /// Value of `name`, or [`Value::Undefined`] if the item has no such field.
    fn field(&self, name: &str) -> Value;
}

/// Whether `item` satisfies `query` within `locations`.
///
/// A record query matches when every field equals the item's field after
/// primitive coercion (`{id: "5"}` matches `id == 5`). Nullish and
/// non-record queries match everything. `locations` must be a prefix of the
/// item key's location chain.
pub fn matches_query<T: Keyed + Filterable>(item: &T, query: &Value, locations: &[LocKey]) -> bool {
    if !is_location_prefix(locations, item.key().locations()) {
        return false;
    }
    match query {
        Value::Record(record) => record
            .iter()
            .all(|(name, expected)| identity_hash(&item.field(name)) == identity_hash(expected)),
        _ => true,
    }
}

// ============================================================================
// MEMORY CACHE
// ============================================================================

/// Entries keyed by normalized key, in insertion order.
struct Store<T> {
    entries: Vec<(String, T)>,
}

impl<T: Keyed + Clone> Store<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn get(&self, key: &ItemKey) -> Option<T> {
        let normalized = key.normalized();
        self.entries
            .iter()
            .find(|(k, _)| *k == normalized)
            .map(|(_, item)| item.clone())
    }

    fn upsert(&mut self, item: T) {
        let normalized = item.key().normalized();
        match self.entries.iter_mut().find(|(k, _)| *k == normalized) {
            Some((_, slot)) => *slot = item,
            None => self.entries.push((normalized, item)),
        }
    }

    fn remove(&mut self, key: &ItemKey) -> Option<T> {
        let normalized = key.normalized();
        let idx = self.entries.iter().position(|(k, _)| *k == normalized)?;
        Some(self.entries.remove(idx).1)
    }

    fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.entries
            .iter()
            .filter(|(_, item)| pred(item))
            .map(|(_, item)| item.clone())
            .collect()
    }
}

type ActionFn<T> = Arc<dyn Fn(&T, &Record) -> T + Send + Sync>;
type FacetFn<T> = Arc<dyn Fn(&T, &Record) -> Value + Send + Sync>;

#[derive(Default)]
struct Counters {
    subscribe: AtomicUsize,
    local_get: AtomicUsize,
    local_filter: AtomicUsize,
    remote_get: AtomicUsize,
    remote_all: AtomicUsize,
    unsubscribe: Arc<AtomicUsize>,
}

/// Wraps a hub subscription to count `unsubscribe` calls.
struct CountedSubscription {
    inner: Box<dyn Subscription>,
    calls: Arc<AtomicUsize>,
}

impl Subscription for CountedSubscription {
    fn unsubscribe(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.unsubscribe();
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }
}

/// In-memory cache for tests.
///
/// The local store is what `local_get`/`local_filter` see. The remote store
/// plays the server: remote operations read and write it, copy results into
/// the local store and then emit the matching event. Events are always
/// emitted after internal locks are released.
pub struct MemoryCache<T> {
    local: RwLock<Store<T>>,
    remote: RwLock<Store<T>>,
    hub: EventHub<T>,
    counters: Counters,
    fail_remote: AtomicBool,
    gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    gated_waiting: AtomicUsize,
    actions: RwLock<HashMap<String, ActionFn<T>>>,
    facets: RwLock<HashMap<String, FacetFn<T>>>,
}

impl<T> MemoryCache<T>
where
    T: Keyed + Filterable + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            local: RwLock::new(Store::new()),
            remote: RwLock::new(Store::new()),
            hub: EventHub::new(),
            counters: Counters::default(),
            fail_remote: AtomicBool::new(false),
            gates: Mutex::new(VecDeque::new()),
            gated_waiting: AtomicUsize::new(0),
            actions: RwLock::new(HashMap::new()),
            facets: RwLock::new(HashMap::new()),
        }
    }

    /// Convenience: a fresh cache behind an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // === Seeding (no events) ===

    /// Put `item` in both stores without emitting anything.
    pub fn seed(&self, item: T) {
        write_or_recover(&self.remote).upsert(item.clone());
        write_or_recover(&self.local).upsert(item);
    }

    /// Put `item` on the server only.
    pub fn seed_remote(&self, item: T) {
        write_or_recover(&self.remote).upsert(item);
    }

    /// Put `item` in the local store only.
    pub fn seed_local(&self, item: T) {
        write_or_recover(&self.local).upsert(item);
    }

    // === Local drivers (emit events) ===

    /// Write `item` locally and emit `item_set`.
    pub fn set(&self, item: T) {
        let key = item.key();
        write_or_recover(&self.local).upsert(item.clone());
        self.hub
            .emit(CacheEvent::item_set(key, item).with_origin(EventOrigin::Manual));
    }

    /// Drop `key` locally and emit `item_removed`.
    pub fn evict(&self, key: &ItemKey) {
        let removed = write_or_recover(&self.local).remove(key);
        self.hub.emit(CacheEvent::item_removed(key.clone(), removed));
    }

    /// Empty the local store and emit `cache_cleared`.
    pub fn clear(&self) {
        write_or_recover(&self.local).entries.clear();
        self.hub.emit(CacheEvent::cache_cleared());
    }

    pub fn invalidate_location(&self, locations: Vec<LocKey>) {
        self.hub.emit(CacheEvent::location_invalidated(locations));
    }

    /// Emit `query_invalidated`; empty `tokens` invalidates every query.
    pub fn invalidate_queries(&self, tokens: Vec<String>, reason: Option<&str>) {
        self.hub.emit(CacheEvent::query_invalidated(
            tokens,
            reason.map(str::to_string),
        ));
    }

    /// Emit an arbitrary event.
    pub fn emit(&self, event: CacheEvent<T>) {
        self.hub.emit(event);
    }

    // === Behaviour controls ===

    /// Make every subsequent remote call fail with `Unavailable`.
    pub fn fail_remote(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    /// Hold the next remote call until the returned sender fires (or drops).
    ///
    /// Gates are consumed in call order, one per remote call.
    pub fn gate_next_call(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        lock_or_recover(&self.gates).push_back(rx);
        tx
    }

    /// Remote calls currently blocked on a gate.
    pub fn gated_waiting(&self) -> usize {
        self.gated_waiting.load(Ordering::SeqCst)
    }

    pub fn register_action(
        &self,
        name: impl Into<String>,
        f: impl Fn(&T, &Record) -> T + Send + Sync + 'static,
    ) {
        write_or_recover(&self.actions).insert(name.into(), Arc::new(f));
    }

    pub fn register_facet(
        &self,
        name: impl Into<String>,
        f: impl Fn(&T, &Record) -> Value + Send + Sync + 'static,
    ) {
        write_or_recover(&self.facets).insert(name.into(), Arc::new(f));
    }

    // === Introspection ===

    pub fn subscribe_calls(&self) -> usize {
        self.counters.subscribe.load(Ordering::SeqCst)
    }

    /// Calls to `unsubscribe` on handles this cache returned, repeats included.
    pub fn unsubscribe_calls(&self) -> usize {
        self.counters.unsubscribe.load(Ordering::SeqCst)
    }

    pub fn local_get_calls(&self) -> usize {
        self.counters.local_get.load(Ordering::SeqCst)
    }

    pub fn local_filter_calls(&self) -> usize {
        self.counters.local_filter.load(Ordering::SeqCst)
    }

    pub fn remote_get_calls(&self) -> usize {
        self.counters.remote_get.load(Ordering::SeqCst)
    }

    pub fn remote_all_calls(&self) -> usize {
        self.counters.remote_all.load(Ordering::SeqCst)
    }

    /// Active event subscriptions.
    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }

    // === Internals ===

    async fn enter_remote(&self, operation: &str) -> CacheResult<()> {
        let gate = lock_or_recover(&self.gates).pop_front();
        if let Some(gate) = gate {
            self.gated_waiting.fetch_add(1, Ordering::SeqCst);
            let _ = gate.await;
            self.gated_waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable {
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn remote_item(&self, key: &ItemKey, operation: &str) -> CacheResult<T> {
        read_or_recover(&self.remote).get(key).ok_or_else(|| {
            tracing::debug!(operation, key = %key, "Remote item missing");
            RemoteError::NotFound { key: key.clone() }.into()
        })
    }

    fn store_confirmed(&self, item: &T) {
        write_or_recover(&self.remote).upsert(item.clone());
        write_or_recover(&self.local).upsert(item.clone());
    }
}

impl<T> Default for MemoryCache<T>
where
    T: Keyed + Filterable + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalCache<T> for MemoryCache<T>
where
    T: Keyed + Filterable + Clone + Send + Sync + 'static,
{
    fn local_get(&self, key: &ItemKey) -> Option<T> {
        self.counters.local_get.fetch_add(1, Ordering::SeqCst);
        read_or_recover(&self.local).get(key)
    }

    fn local_filter(&self, query: &Value, locations: &[LocKey]) -> Vec<T> {
        self.counters.local_filter.fetch_add(1, Ordering::SeqCst);
        read_or_recover(&self.local).filter(|item| matches_query(item, query, locations))
    }
}

#[async_trait]
impl<T> RemoteOperations<T> for MemoryCache<T>
where
    T: Keyed + Filterable + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ItemKey) -> CacheResult<Option<T>> {
        self.counters.remote_get.fetch_add(1, Ordering::SeqCst);
        self.enter_remote("get").await?;
        let found = read_or_recover(&self.remote).get(key);
        if let Some(item) = &found {
            write_or_recover(&self.local).upsert(item.clone());
            self.hub.emit(
                CacheEvent::item_retrieved(key.clone(), item.clone()).with_origin(EventOrigin::Api),
            );
        }
        Ok(found)
    }

    async fn all(&self, query: &Value, locations: &[LocKey]) -> CacheResult<Vec<T>> {
        self.counters.remote_all.fetch_add(1, Ordering::SeqCst);
        self.enter_remote("all").await?;
        let items =
            read_or_recover(&self.remote).filter(|item| matches_query(item, query, locations));
        {
            let mut local = write_or_recover(&self.local);
            for item in &items {
                local.upsert(item.clone());
            }
        }
        self.hub.emit(
            CacheEvent::items_queried(query.clone(), locations.to_vec(), items.clone())
                .with_origin(EventOrigin::Api),
        );
        Ok(items)
    }

    async fn create(&self, item: T, locations: &[LocKey]) -> CacheResult<T> {
        self.enter_remote("create").await?;
        let key = item.key();
        if !is_location_prefix(locations, key.locations()) {
            return Err(RemoteError::Rejected {
                operation: "create".to_string(),
                reason: format!("{key} is outside the requested locations"),
            }
            .into());
        }
        self.store_confirmed(&item);
        self.hub
            .emit(CacheEvent::item_created(key, item.clone()).with_origin(EventOrigin::Api));
        Ok(item)
    }

    async fn update(&self, key: &ItemKey, item: T) -> CacheResult<T> {
        self.enter_remote("update").await?;
        self.remote_item(key, "update")?;
        self.store_confirmed(&item);
        self.hub.emit(
            CacheEvent::item_updated(key.clone(), item.clone()).with_origin(EventOrigin::Api),
        );
        Ok(item)
    }

    async fn remove(&self, key: &ItemKey) -> CacheResult<Option<T>> {
        self.enter_remote("remove").await?;
        let removed = write_or_recover(&self.remote).remove(key);
        let local = write_or_recover(&self.local).remove(key);
        let removed = removed.or(local);
        self.hub.emit(
            CacheEvent::item_removed(key.clone(), removed.clone()).with_origin(EventOrigin::Api),
        );
        Ok(removed)
    }

    async fn action(&self, key: &ItemKey, action: &str, body: &Record) -> CacheResult<T> {
        self.enter_remote("action").await?;
        let current = self.remote_item(key, "action")?;
        let handler = read_or_recover(&self.actions).get(action).cloned();
        let Some(handler) = handler else {
            return Err(RemoteError::Rejected {
                operation: "action".to_string(),
                reason: format!("unknown action '{action}'"),
            }
            .into());
        };
        let updated = handler(&current, body);
        self.store_confirmed(&updated);
        self.hub.emit(
            CacheEvent::item_updated(key.clone(), updated.clone()).with_origin(EventOrigin::Api),
        );
        Ok(updated)
    }

    async fn facet(&self, key: &ItemKey, facet: &str, params: &Record) -> CacheResult<Value> {
        self.enter_remote("facet").await?;
        let current = self.remote_item(key, "facet")?;
        let handler = read_or_recover(&self.facets).get(facet).cloned();
        match handler {
            Some(handler) => Ok(handler(&current, params)),
            None => Err(RemoteError::Rejected {
                operation: "facet".to_string(),
                reason: format!("unknown facet '{facet}'"),
            }
            .into()),
        }
    }
}

impl<T> EventSource<T> for MemoryCache<T>
where
    T: Keyed + Filterable + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, listener: Listener<T>, filter: FilterHandle) -> Box<dyn Subscription> {
        self.counters.subscribe.fetch_add(1, Ordering::SeqCst);
        Box::new(CountedSubscription {
            inner: self.hub.subscribe(listener, filter),
            calls: Arc::clone(&self.counters.unsubscribe),
        })
    }
}

impl<T> Cache for MemoryCache<T>
where
    T: Keyed + Filterable + Clone + Send + Sync + 'static,
{
    type Item = T;
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Keyed test items.

    use super::*;

    /// Primary-keyed item: `user:<id>`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct User {
        pub id: i64,
        pub name: String,
        pub status: String,
    }

    impl User {
        pub fn new(id: i64, name: &str, status: &str) -> Self {
            Self {
                id,
                name: name.to_string(),
                status: status.to_string(),
            }
        }

        pub fn active(id: i64, name: &str) -> Self {
            Self::new(id, name, "active")
        }

        pub fn with_status(mut self, status: &str) -> Self {
            self.status = status.to_string();
            self
        }

        pub fn key_for(id: i64) -> ItemKey {
            ItemKey::primary("user", id)
        }
    }

    impl Keyed for User {
        fn key(&self) -> ItemKey {
            Self::key_for(self.id)
        }
    }

    impl Filterable for User {
        fn field(&self, name: &str) -> Value {
            match name {
                "id" => Value::Int(self.id),
                "name" => Value::from(self.name.as_str()),
                "status" => Value::from(self.status.as_str()),
                _ => Value::Undefined,
            }
        }
    }

    /// Composite-keyed item: `comment:<id>` under `post:<post_id>`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Comment {
        pub id: i64,
        pub post_id: i64,
        pub body: String,
    }

    impl Comment {
        pub fn new(id: i64, post_id: i64, body: &str) -> Self {
            Self {
                id,
                post_id,
                body: body.to_string(),
            }
        }

        pub fn post(post_id: i64) -> Vec<LocKey> {
            vec![LocKey::new("post", post_id)]
        }
    }

    impl Keyed for Comment {
        fn key(&self) -> ItemKey {
            ItemKey::composite("comment", self.id, Self::post(self.post_id))
        }
    }

    impl Filterable for Comment {
        fn field(&self, name: &str) -> Value {
            match name {
                "id" => Value::Int(self.id),
                "post_id" => Value::Int(self.post_id),
                "body" => Value::from(self.body.as_str()),
                _ => Value::Undefined,
            }
        }
    }

    /// Query record `{status: <status>}`.
    pub fn status_query(status: &str) -> Value {
        Value::Record(Record::new().with("status", status))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and fixture items.

    use super::fixtures::User;
    use super::*;
    use cachet_core::KeyValue;
    use proptest::prelude::*;

    /// Identifier values, biased towards small ints and their string forms.
    pub fn arb_key_value() -> impl Strategy<Value = KeyValue> {
        prop_oneof![
            (0i64..20).prop_map(KeyValue::Int),
            (0i64..20).prop_map(|i| KeyValue::Str(i.to_string())),
            "[a-z]{1,4}".prop_map(KeyValue::Str),
        ]
    }

    pub fn arb_loc_key() -> impl Strategy<Value = LocKey> {
        ("[a-c]", arb_key_value()).prop_map(|(kt, lk)| LocKey { kt, lk })
    }

    pub fn arb_item_key() -> impl Strategy<Value = ItemKey> {
        prop_oneof![
            ("[a-c]", arb_key_value()).prop_map(|(kt, pk)| ItemKey::primary(kt, pk)),
            (
                "[a-c]",
                arb_key_value(),
                prop::collection::vec(arb_loc_key(), 0..3)
            )
                .prop_map(|(kt, pk, loc)| ItemKey::composite(kt, pk, loc)),
        ]
    }

    pub fn arb_status() -> impl Strategy<Value = String> {
        prop_oneof![Just("active".to_string()), Just("inactive".to_string())]
    }

    pub fn arb_user() -> impl Strategy<Value = User> {
        (0i64..10, "[a-z]{1,6}", arb_status()).prop_map(|(id, name, status)| User {
            id,
            name,
            status,
        })
    }
}

// ============================================================================
// LOG CAPTURE
// ============================================================================

pub mod logging {
    //! A [`Logger`] whose output can be inspected.

    use super::*;
    use std::io;
    use tracing_subscriber::fmt::MakeWriter;

    /// Buffer shared by a capturing logger and the test that reads it.
    #[derive(Clone, Default)]
    pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl LogCapture {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&lock_or_recover(&self.0)).into_owned()
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.contents().contains(needle)
        }

        pub fn is_empty(&self) -> bool {
            lock_or_recover(&self.0).is_empty()
        }
    }

    pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock_or_recover(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogCapture {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureWriter(Arc::clone(&self.0))
        }
    }

    /// Logger that records every event at TRACE and above, without ANSI codes.
    pub fn capture_logger() -> (Logger, LogCapture) {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        (Logger::from(tracing::Dispatch::new(subscriber)), capture)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for observer state.

    use super::*;

    /// Assert that `items` carry exactly `expected` keys, in order.
    #[track_caller]
    pub fn assert_keys<T: Keyed>(items: &[T], expected: &[ItemKey]) {
        let got: Vec<String> = items.iter().map(|i| i.key().normalized()).collect();
        let want: Vec<String> = expected.iter().map(ItemKey::normalized).collect();
        assert_eq!(got, want, "Item keys differ");
    }

    /// Assert that a result failed with a remote error.
    #[track_caller]
    pub fn assert_remote_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Remote(_)) => {}
            other => panic!("Expected Remote error, got: {:?}", other),
        }
    }
}
