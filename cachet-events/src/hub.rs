//! EventHub - synchronous fan-out with optional debounced delivery
//!
//! Undebounced subscriptions are called once per event, on the emitting
//! thread. A debounced subscription buffers matching events and receives the
//! whole buffer as one batch once it has been idle for the window.

use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Sleep;

use cachet_core::lock::{lock_or_recover, read_or_recover, write_or_recover};
use cachet_core::{CacheEvent, EventSource, FilterHandle, Listener, Subscription};

/// In-process event source.
///
/// Cloning a hub yields another handle to the same listener set.
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

struct HubInner<T> {
    entries: RwLock<Vec<Arc<Entry<T>>>>,
    next_id: AtomicU64,
}

struct Entry<T> {
    id: u64,
    listener: Listener<T>,
    filter: FilterHandle,
    active: AtomicBool,
    pending: Mutex<Pending<T>>,
}

/// Events held back by a debounce window.
struct Pending<T> {
    events: Vec<CacheEvent<T>>,
    /// Bumped on every buffered event; a flush only runs if it still matches.
    generation: u64,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HubInner {
                entries: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> EventHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every active subscription whose filter accepts it.
    ///
    /// The listener list is snapshotted first and the lock released before
    /// any callback runs. A subscription added during emission does not see
    /// the current event.
    pub fn emit(&self, event: CacheEvent<T>) {
        let snapshot: Vec<Arc<Entry<T>>> = read_or_recover(&self.inner.entries).clone();
        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) || !entry.filter.matches(&event) {
                continue;
            }
            match entry.filter.debounce() {
                None => (entry.listener)(std::slice::from_ref(&event)),
                Some(window) => buffer(&entry, event.clone(), window),
            }
        }
    }

    /// Number of active subscriptions.
    pub fn listener_count(&self) -> usize {
        read_or_recover(&self.inner.entries).len()
    }
}

impl<T: Clone + Send + Sync + 'static> EventSource<T> for EventHub<T> {
    fn subscribe(&self, listener: Listener<T>, filter: FilterHandle) -> Box<dyn Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            listener,
            filter,
            active: AtomicBool::new(true),
            pending: Mutex::new(Pending {
                events: Vec::new(),
                generation: 0,
            }),
        });
        write_or_recover(&self.inner.entries).push(Arc::clone(&entry));
        tracing::trace!(subscription_id = id, "Event hub subscription added");
        Box::new(HubSubscription {
            entry,
            hub: Arc::downgrade(&self.inner),
        })
    }
}

fn buffer<T: Send + Sync + 'static>(entry: &Arc<Entry<T>>, event: CacheEvent<T>, window: Duration) {
    let generation = {
        let mut pending = lock_or_recover(&entry.pending);
        pending.events.push(event);
        pending.generation += 1;
        pending.generation
    };
    match idle_timer(window) {
        Some((handle, sleep)) => {
            let entry = Arc::clone(entry);
            handle.spawn(async move {
                sleep.await;
                flush(&entry, generation);
            });
        }
        None => {
            tracing::trace!(
                subscription_id = entry.id,
                "No tokio timer for debounce, delivering immediately"
            );
            flush(entry, generation);
        }
    }
}

/// A runtime handle plus a sleep armed on its timer.
///
/// `None` outside a runtime, or inside one built without `enable_time`,
/// where creating a sleep panics.
fn idle_timer(window: Duration) -> Option<(Handle, Sleep)> {
    let handle = Handle::try_current().ok()?;
    let sleep = panic::catch_unwind(|| tokio::time::sleep(window)).ok()?;
    Some((handle, sleep))
}

/// Deliver everything buffered as one batch, unless newer events arrived.
fn flush<T>(entry: &Entry<T>, generation: u64) {
    let events = {
        let mut pending = lock_or_recover(&entry.pending);
        if pending.generation != generation {
            return;
        }
        std::mem::take(&mut pending.events)
    };
    if events.is_empty() || !entry.active.load(Ordering::Acquire) {
        return;
    }
    (entry.listener)(&events);
}

/// Handle returned by [`EventHub`]'s `subscribe`.
///
/// Dropping the handle does not unsubscribe; call
/// [`Subscription::unsubscribe`].
pub struct HubSubscription<T> {
    entry: Arc<Entry<T>>,
    hub: Weak<HubInner<T>>,
}

impl<T: Send + Sync> Subscription for HubSubscription<T> {
    fn unsubscribe(&self) {
        if !self.entry.active.swap(false, Ordering::AcqRel) {
            return;
        }
        lock_or_recover(&self.entry.pending).events.clear();
        if let Some(hub) = self.hub.upgrade() {
            write_or_recover(&hub.entries).retain(|e| e.id != self.entry.id);
        }
        tracing::trace!(subscription_id = self.entry.id, "Event hub subscription removed");
    }

    fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }
}
