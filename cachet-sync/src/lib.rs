//! CACHET Sync - Item and Query Observers
//!
//! Turns a stream of cache events plus explicit fetches into a minimal,
//! race-free view of one item or one query result set.
//!
//! # Architecture
//!
//! ```text
//!  cache ──events──▶ SubscriptionBinding ──▶ ItemObserver / QueryObserver ──watch──▶ consumer
//!    ▲                (one subscription per                │
//!    └──────── local_get / local_filter / get / all ───────┘
//! ```
//!
//! - [`SubscriptionBinding`] keeps exactly one subscription per cache and
//!   swaps listener and filters in place.
//! - [`ItemObserver`] loads synchronously from the local store, follows
//!   matching events, and refetches on demand.
//! - [`QueryObserver`] re-runs the cache's local filter on item events,
//!   patches removals, takes `items_queried` for its own identity as-is and
//!   refetches on invalidation.
//! - Refetches are tracked with tickets so a stale response is discarded
//!   instead of overwriting newer state.
//!
//! Observers never fail: remote errors are logged through the injected
//! [`cachet_core::Logger`] and surface as `None` / empty results.

pub mod binding;
pub mod item;
pub mod query;
pub mod request;

use std::sync::Arc;

use cachet_core::{Cache, ItemKey, LocationChain, SyncConfig, Value};

pub use binding::SubscriptionBinding;
pub use item::{ItemObserver, ItemSnapshot, ITEM_EVENT_TYPES};
pub use query::{QueryIdentity, QueryObserver, QuerySnapshot, QUERY_EVENT_TYPES};
pub use request::{RequestTracker, Ticket};

/// Observe one key with the default configuration.
///
/// A `None` cache or key yields an inert observer: `(None, false)`, no
/// subscription, and `refetch()` resolves to `None`.
pub fn observe_item<C: Cache>(cache: Option<Arc<C>>, key: Option<ItemKey>) -> ItemObserver<C> {
    ItemObserver::new(cache, key, SyncConfig::default())
}

pub fn observe_item_with_config<C: Cache>(
    cache: Option<Arc<C>>,
    key: Option<ItemKey>,
    config: SyncConfig,
) -> ItemObserver<C> {
    ItemObserver::new(cache, key, config)
}

/// Observe one `(query, locations)` result set with the default configuration.
pub fn observe_query<C: Cache>(
    cache: Option<Arc<C>>,
    query: impl Into<Value>,
    locations: LocationChain,
) -> QueryObserver<C> {
    QueryObserver::new(cache, query.into(), locations, SyncConfig::default())
}

pub fn observe_query_with_config<C: Cache>(
    cache: Option<Arc<C>>,
    query: impl Into<Value>,
    locations: LocationChain,
    config: SyncConfig,
) -> QueryObserver<C> {
    QueryObserver::new(cache, query.into(), locations, config)
}
