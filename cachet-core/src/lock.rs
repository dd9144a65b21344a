//! Poison-tolerant lock helpers.
//!
//! Observer state is updated from inside event callbacks, which must never
//! panic. A poisoned lock only means another thread panicked mid-update; the
//! guarded data is still structurally valid for every type guarded here, so
//! the guard is recovered rather than propagated.
//!
//! The `*_or_recover` helpers recover silently. Code holding an injected
//! [`Logger`] uses the `*_logged` variants, which report the recovery through
//! that logger.

use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::logging::Logger;

fn recover<G>(result: LockResult<G>, logger: Option<&Logger>) -> G {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            if let Some(logger) = logger {
                logger.scope(|| tracing::warn!("Lock was poisoned, recovering"));
            }
            poisoned.into_inner()
        }
    }
}

pub fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    recover(lock.read(), None)
}

pub fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    recover(lock.write(), None)
}

pub fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    recover(lock.lock(), None)
}

pub fn read_logged<'a, T>(lock: &'a RwLock<T>, logger: &Logger) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), Some(logger))
}

pub fn write_logged<'a, T>(lock: &'a RwLock<T>, logger: &Logger) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), Some(logger))
}

/// Lock `lock`, warning through `logger` if it had to be recovered.
pub fn lock_logged<'a, T>(lock: &'a Mutex<T>, logger: &Logger) -> MutexGuard<'a, T> {
    recover(lock.lock(), Some(logger))
}
