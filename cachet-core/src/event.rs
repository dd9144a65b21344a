//! Cache events and subscription options.
//!
//! Events are fire-and-forget notifications emitted by a cache. They are not
//! acknowledged and may be missed entirely by a listener that registers
//! late, which is why observers always start from a synchronous local load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::key::{ItemKey, LocationChain};
use crate::lock::{read_or_recover, write_or_recover};
use crate::value::Value;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Discriminant of a [`CacheEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ItemCreated,
    ItemUpdated,
    ItemRetrieved,
    ItemSet,
    ItemRemoved,
    ItemsQueried,
    CacheCleared,
    LocationInvalidated,
    QueryInvalidated,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::ItemCreated,
        EventType::ItemUpdated,
        EventType::ItemRetrieved,
        EventType::ItemSet,
        EventType::ItemRemoved,
        EventType::ItemsQueried,
        EventType::CacheCleared,
        EventType::LocationInvalidated,
        EventType::QueryInvalidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ItemCreated => "item_created",
            EventType::ItemUpdated => "item_updated",
            EventType::ItemRetrieved => "item_retrieved",
            EventType::ItemSet => "item_set",
            EventType::ItemRemoved => "item_removed",
            EventType::ItemsQueried => "items_queried",
            EventType::CacheCleared => "cache_cleared",
            EventType::LocationInvalidated => "location_invalidated",
            EventType::QueryInvalidated => "query_invalidated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// A confirmed remote operation.
    Api,
    /// The cache's own bookkeeping.
    #[default]
    Cache,
    /// An explicit local write by application code.
    Manual,
    Other(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Type-specific event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload<T> {
    ItemCreated { key: ItemKey, item: T },
    ItemUpdated { key: ItemKey, item: T },
    ItemRetrieved { key: ItemKey, item: T },
    ItemSet { key: ItemKey, item: T },
    ItemRemoved { key: ItemKey, item: Option<T> },
    ItemsQueried {
        query: Value,
        locations: LocationChain,
        items: Vec<T>,
    },
    CacheCleared,
    LocationInvalidated { locations: LocationChain },
    /// `query_tokens` lists the identity tokens to invalidate; empty means all.
    QueryInvalidated {
        query_tokens: Vec<String>,
        reason: Option<String>,
    },
}

/// A notification emitted by a cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent<T> {
    pub timestamp: DateTime<Utc>,
    pub origin: EventOrigin,
    pub payload: EventPayload<T>,
}

impl<T> CacheEvent<T> {
    /// New event stamped now, with [`EventOrigin::Cache`].
    pub fn new(payload: EventPayload<T>) -> Self {
        Self {
            timestamp: Utc::now(),
            origin: EventOrigin::default(),
            payload,
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn item_created(key: ItemKey, item: T) -> Self {
        Self::new(EventPayload::ItemCreated { key, item })
    }

    pub fn item_updated(key: ItemKey, item: T) -> Self {
        Self::new(EventPayload::ItemUpdated { key, item })
    }

    pub fn item_retrieved(key: ItemKey, item: T) -> Self {
        Self::new(EventPayload::ItemRetrieved { key, item })
    }

    pub fn item_set(key: ItemKey, item: T) -> Self {
        Self::new(EventPayload::ItemSet { key, item })
    }

    pub fn item_removed(key: ItemKey, item: Option<T>) -> Self {
        Self::new(EventPayload::ItemRemoved { key, item })
    }

    pub fn items_queried(query: Value, locations: LocationChain, items: Vec<T>) -> Self {
        Self::new(EventPayload::ItemsQueried {
            query,
            locations,
            items,
        })
    }

    pub fn cache_cleared() -> Self {
        Self::new(EventPayload::CacheCleared)
    }

    pub fn location_invalidated(locations: LocationChain) -> Self {
        Self::new(EventPayload::LocationInvalidated { locations })
    }

    pub fn query_invalidated(query_tokens: Vec<String>, reason: Option<String>) -> Self {
        Self::new(EventPayload::QueryInvalidated {
            query_tokens,
            reason,
        })
    }

    pub fn event_type(&self) -> EventType {
        match &self.payload {
            EventPayload::ItemCreated { .. } => EventType::ItemCreated,
            EventPayload::ItemUpdated { .. } => EventType::ItemUpdated,
            EventPayload::ItemRetrieved { .. } => EventType::ItemRetrieved,
            EventPayload::ItemSet { .. } => EventType::ItemSet,
            EventPayload::ItemRemoved { .. } => EventType::ItemRemoved,
            EventPayload::ItemsQueried { .. } => EventType::ItemsQueried,
            EventPayload::CacheCleared => EventType::CacheCleared,
            EventPayload::LocationInvalidated { .. } => EventType::LocationInvalidated,
            EventPayload::QueryInvalidated { .. } => EventType::QueryInvalidated,
        }
    }

    /// Key of a single-item event.
    pub fn key(&self) -> Option<&ItemKey> {
        match &self.payload {
            EventPayload::ItemCreated { key, .. }
            | EventPayload::ItemUpdated { key, .. }
            | EventPayload::ItemRetrieved { key, .. }
            | EventPayload::ItemSet { key, .. }
            | EventPayload::ItemRemoved { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Item carried by a single-item event.
    pub fn item(&self) -> Option<&T> {
        match &self.payload {
            EventPayload::ItemCreated { item, .. }
            | EventPayload::ItemUpdated { item, .. }
            | EventPayload::ItemRetrieved { item, .. }
            | EventPayload::ItemSet { item, .. } => Some(item),
            EventPayload::ItemRemoved { item, .. } => item.as_ref(),
            _ => None,
        }
    }
}

// ============================================================================
// SUBSCRIPTION OPTIONS
// ============================================================================

/// Filter and delivery options for one subscription.
///
/// `None` filters accept everything. A key filter only constrains events
/// that carry a key; keyless events (`cache_cleared`, `items_queried`,
/// invalidations) always pass it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    pub keys: Option<Vec<ItemKey>>,
    pub event_types: Option<Vec<EventType>>,
    pub debounce: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(mut self, keys: Vec<ItemKey>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_event_types(mut self, event_types: impl Into<Vec<EventType>>) -> Self {
        self.event_types = Some(event_types.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Option<Duration>) -> Self {
        self.debounce = debounce;
        self
    }

    /// Whether `event` passes both filters.
    pub fn matches<T>(&self, event: &CacheEvent<T>) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type()) {
                return false;
            }
        }
        match (&self.keys, event.key()) {
            (Some(keys), Some(event_key)) => {
                let normalized = event_key.normalized();
                keys.iter().any(|k| k.normalized() == normalized)
            }
            _ => true,
        }
    }
}

/// Shared, updatable handle to a subscription's options.
///
/// The subscriber keeps one clone and the event source another; replacing
/// the options through either is visible to the other at the next delivery,
/// so filters change without re-subscribing.
#[derive(Debug, Clone, Default)]
pub struct FilterHandle(Arc<RwLock<SubscribeOptions>>);

impl FilterHandle {
    pub fn new(options: SubscribeOptions) -> Self {
        Self(Arc::new(RwLock::new(options)))
    }

    pub fn replace(&self, options: SubscribeOptions) {
        *write_or_recover(&self.0) = options;
    }

    pub fn snapshot(&self) -> SubscribeOptions {
        read_or_recover(&self.0).clone()
    }

    pub fn matches<T>(&self, event: &CacheEvent<T>) -> bool {
        read_or_recover(&self.0).matches(event)
    }

    pub fn debounce(&self) -> Option<Duration> {
        read_or_recover(&self.0).debounce
    }
}
