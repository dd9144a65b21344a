//! CACHET Events - In-Process Event Hub
//!
//! `EventHub<T>` is a ready-made [`cachet_core::EventSource`] for caches
//! that live in the same process as their observers.
//!
//! # Delivery
//!
//! - Events reach listeners in emission order (FIFO per hub).
//! - Filters are read at delivery time, so a subscriber that replaces its
//!   [`cachet_core::FilterHandle`] options sees the change on the next event.
//! - Listeners are called with no hub lock held; they may subscribe,
//!   unsubscribe or emit from inside a callback.
//! - A subscription with a debounce window buffers matching events and
//!   flushes them together once the window passes without a new event.

mod hub;

pub use hub::{EventHub, HubSubscription};
