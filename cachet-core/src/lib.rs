//! CACHET Core - Keys, Values and Collaborator Traits
//!
//! Everything the observers in `cachet-sync` agree on with a cache:
//!
//! - `key`: item keys, location chains and the key normalizer
//! - `value` / `hash`: dynamic parameter values, stable hashing, deep equality
//! - `event`: cache events and subscription options
//! - `cache`: the traits a cache implements (local store, remote, events)
//! - `config` / `logging` / `error`: the ambient stack shared by all crates

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod key;
pub mod lock;
pub mod logging;
pub mod value;

pub use cache::{Cache, EventSource, Keyed, Listener, LocalCache, RemoteOperations, Subscription};
pub use config::SyncConfig;
pub use error::{CacheError, CacheResult, ConfigError, RemoteError};
pub use event::{CacheEvent, EventOrigin, EventPayload, EventType, FilterHandle, SubscribeOptions};
pub use hash::{
    deep_equal, digest, identity_digest, identity_hash, stable_digest, stable_hash,
    CIRCULAR_SENTINEL,
};
pub use key::{
    is_location_prefix, normalize_key, normalize_locations, ComKey, ItemKey, KeyValue, LocKey,
    LocationChain, PriKey,
};
pub use logging::Logger;
pub use value::{Record, SharedValue, Value};
