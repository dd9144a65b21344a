//! Collaborator traits: what an observer needs from a cache.
//!
//! A cache is three things at once:
//! - a synchronous local store ([`LocalCache`]): point lookup and a filter
//!   over the items it currently holds
//! - an asynchronous remote ([`RemoteOperations`]) whose results are
//!   server-confirmed
//! - an event source ([`EventSource`]) that notifies about every mutation
//!
//! [`Cache`] ties them together with the item type.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CacheResult;
use crate::event::{CacheEvent, FilterHandle};
use crate::key::{ItemKey, LocKey};
use crate::value::{Record, Value};

/// Items that know their own key.
pub trait Keyed {
    fn key(&self) -> ItemKey;
}

/// Callback invoked with each delivered batch of events.
///
/// An undebounced subscription receives one event per call. A debounced
/// subscription receives a whole burst, in FIFO order, in one call, so the
/// subscriber can re-evaluate once per burst.
pub type Listener<T> = Arc<dyn Fn(&[CacheEvent<T>]) + Send + Sync>;

/// One listener's registration with an event source.
pub trait Subscription: Send + Sync {
    /// Stop delivery. Calling it again is a no-op.
    fn unsubscribe(&self);

    fn is_active(&self) -> bool;
}

/// Source of cache events.
///
/// Delivery is FIFO per source, within and across batches. Sources must
/// consult `filter` at delivery time rather than copying it at subscribe
/// time: subscribers update filters in place through their own clone of the
/// handle.
pub trait EventSource<T>: Send + Sync {
    fn subscribe(&self, listener: Listener<T>, filter: FilterHandle) -> Box<dyn Subscription>;
}

/// Synchronous view over the items a cache currently holds.
pub trait LocalCache<T>: Send + Sync {
    /// Point lookup. Never touches the network.
    fn local_get(&self, key: &ItemKey) -> Option<T>;

    /// Items currently held that satisfy `query` within `locations`.
    fn local_filter(&self, query: &Value, locations: &[LocKey]) -> Vec<T>;
}

/// Asynchronous, server-confirmed operations.
#[async_trait]
pub trait RemoteOperations<T: Send + 'static>: Send + Sync {
    async fn get(&self, key: &ItemKey) -> CacheResult<Option<T>>;

    async fn all(&self, query: &Value, locations: &[LocKey]) -> CacheResult<Vec<T>>;

    async fn create(&self, item: T, locations: &[LocKey]) -> CacheResult<T>;

    async fn update(&self, key: &ItemKey, item: T) -> CacheResult<T>;

    /// Returns the removed item, if the remote reported it.
    async fn remove(&self, key: &ItemKey) -> CacheResult<Option<T>>;

    /// Invoke a named action on one item.
    async fn action(&self, key: &ItemKey, action: &str, body: &Record) -> CacheResult<T>;

    /// Compute a named facet (derived, non-item value) of one item.
    async fn facet(&self, key: &ItemKey, facet: &str, params: &Record) -> CacheResult<Value>;
}

/// A complete cache: local store, remote and event source for one item type.
pub trait Cache:
    LocalCache<Self::Item> + RemoteOperations<Self::Item> + EventSource<Self::Item> + 'static
{
    type Item: Keyed + Clone + Send + Sync + 'static;
}
