//! Injectable logging capability.
//!
//! Observers never log through the process-global subscriber implicitly.
//! Each one holds a [`Logger`] handed to it at construction; the default is
//! a no-op. Under the hood a `Logger` is a `tracing::Dispatch`, so any
//! `tracing` subscriber can be injected.

use std::fmt;
use tracing::Dispatch;

#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// A logger that discards everything.
    pub fn none() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// Run `f` with this logger's subscriber as the default.
    ///
    /// `tracing` macros invoked inside `f` go to the injected subscriber.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Dispatch> for Logger {
    fn from(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }
}

/// Loggers carry no data, so any two compare equal.
impl PartialEq for Logger {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_returns_closure_value() {
        let logger = Logger::none();
        let v = logger.scope(|| {
            tracing::warn!("discarded");
            41 + 1
        });
        assert_eq!(v, 42);
    }

    #[test]
    fn test_none_is_default() {
        let logger = Logger::default();
        assert!(logger.scope(|| !tracing::enabled!(tracing::Level::ERROR)));
    }
}
