//! Event Subscription Adapter.
//!
//! A [`SubscriptionBinding`] owns at most one subscription to one cache. The
//! cache only ever sees a trampoline listener that forwards to whatever
//! listener is currently installed in the binding, and a [`FilterHandle`]
//! the binding updates in place. Re-binding to the same cache with a new
//! listener or new options therefore never re-subscribes.

use std::sync::{Arc, RwLock};

use cachet_core::lock::{read_logged, write_logged};
use cachet_core::{Cache, CacheEvent, FilterHandle, Listener, Logger, SubscribeOptions, Subscription};

struct Bound<C> {
    cache: Arc<C>,
    subscription: Box<dyn Subscription>,
}

pub struct SubscriptionBinding<C: Cache> {
    listener: Arc<RwLock<Listener<C::Item>>>,
    filter: FilterHandle,
    bound: Option<Bound<C>>,
    logger: Logger,
}

impl<C: Cache> SubscriptionBinding<C> {
    /// An unbound binding. Until the first [`bind`](Self::bind) the listener
    /// ignores every event.
    pub fn new(logger: Logger) -> Self {
        let inert: Listener<C::Item> = Arc::new(|_: &[CacheEvent<C::Item>]| {});
        Self {
            listener: Arc::new(RwLock::new(inert)),
            filter: FilterHandle::default(),
            bound: None,
            logger,
        }
    }

    /// Point the binding at `cache` with `listener` and `options`.
    ///
    /// - `None` tears the subscription down.
    /// - The cache already bound: listener and options are swapped in place.
    /// - Any other cache: the old subscription is torn down and exactly one
    ///   new one is created.
    pub fn bind(
        &mut self,
        cache: Option<&Arc<C>>,
        listener: Listener<C::Item>,
        options: SubscribeOptions,
    ) {
        *write_logged(&self.listener, &self.logger) = listener;
        self.filter.replace(options);

        let Some(cache) = cache else {
            self.teardown();
            return;
        };
        if let Some(bound) = &self.bound {
            if Arc::ptr_eq(&bound.cache, cache) {
                return;
            }
        }
        self.teardown();

        let slot = Arc::clone(&self.listener);
        let logger = self.logger.clone();
        let trampoline: Listener<C::Item> = Arc::new(move |events: &[CacheEvent<C::Item>]| {
            let current = read_logged(&slot, &logger).clone();
            current(events);
        });
        let subscription = cache.subscribe(trampoline, self.filter.clone());
        self.logger.scope(|| tracing::debug!("Subscribed to cache events"));
        self.bound = Some(Bound {
            cache: Arc::clone(cache),
            subscription,
        });
    }

    /// Unsubscribe if bound. Further calls are no-ops.
    pub fn teardown(&mut self) {
        if let Some(bound) = self.bound.take() {
            bound.subscription.unsubscribe();
            self.logger
                .scope(|| tracing::debug!("Unsubscribed from cache events"));
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Options currently applied to the subscription.
    pub fn options(&self) -> SubscribeOptions {
        self.filter.snapshot()
    }
}

impl<C: Cache> Drop for SubscriptionBinding<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{EventType, ItemKey};
    use cachet_test_utils::fixtures::User;
    use cachet_test_utils::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Listener<User> {
        let counter = Arc::clone(counter);
        Arc::new(move |events: &[CacheEvent<User>]| {
            counter.fetch_add(events.len(), Ordering::SeqCst);
        })
    }

    #[test]
    fn test_rebinding_same_cache_subscribes_once() {
        let cache = MemoryCache::<User>::shared();
        let mut binding = SubscriptionBinding::new(Logger::none());

        for i in 0..5 {
            let counter = Arc::new(AtomicUsize::new(0));
            binding.bind(
                Some(&cache),
                counting(&counter),
                SubscribeOptions::new().with_keys(vec![User::key_for(i)]),
            );
        }
        assert_eq!(cache.subscribe_calls(), 1);
        assert_eq!(cache.listener_count(), 1);
        assert!(binding.is_bound());
    }

    #[test]
    fn test_latest_listener_receives_events() {
        let cache = MemoryCache::<User>::shared();
        let mut binding = SubscriptionBinding::new(Logger::none());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        binding.bind(Some(&cache), counting(&first), SubscribeOptions::new());
        cache.set(User::active(1, "ada"));
        binding.bind(Some(&cache), counting(&second), SubscribeOptions::new());
        cache.set(User::active(1, "ada"));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_options_update_in_place() {
        let cache = MemoryCache::<User>::shared();
        let mut binding = SubscriptionBinding::new(Logger::none());
        let counter = Arc::new(AtomicUsize::new(0));

        binding.bind(
            Some(&cache),
            counting(&counter),
            SubscribeOptions::new().with_event_types([EventType::CacheCleared]),
        );
        cache.set(User::active(1, "ada"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        binding.bind(
            Some(&cache),
            counting(&counter),
            SubscribeOptions::new().with_keys(vec![ItemKey::primary("user", "1")]),
        );
        cache.set(User::active(1, "ada"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.subscribe_calls(), 1);
        assert_eq!(binding.options().keys.map(|k| k.len()), Some(1));
    }

    #[test]
    fn test_switching_cache_moves_subscription() {
        let a = MemoryCache::<User>::shared();
        let b = MemoryCache::<User>::shared();
        let mut binding = SubscriptionBinding::new(Logger::none());
        let counter = Arc::new(AtomicUsize::new(0));

        binding.bind(Some(&a), counting(&counter), SubscribeOptions::new());
        binding.bind(Some(&b), counting(&counter), SubscribeOptions::new());
        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 1);

        a.clear();
        b.clear();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_cache_and_drop_tear_down() {
        let cache = MemoryCache::<User>::shared();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut binding = SubscriptionBinding::new(Logger::none());

        binding.bind(Some(&cache), counting(&counter), SubscribeOptions::new());
        binding.bind(None, counting(&counter), SubscribeOptions::new());
        assert!(!binding.is_bound());
        assert_eq!(cache.listener_count(), 0);

        binding.bind(Some(&cache), counting(&counter), SubscribeOptions::new());
        drop(binding);
        assert_eq!(cache.listener_count(), 0);
        assert_eq!(cache.subscribe_calls(), 2);
    }
}
