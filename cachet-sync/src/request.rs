//! Stale-response tracking for in-flight refetches.
//!
//! Remote calls cannot be cancelled. Instead every call takes a [`Ticket`]
//! when it starts and may only commit its result if the ticket is still
//! current when it resolves:
//!
//! - a retarget (new key, new query identity, close) bumps the epoch, so
//!   every ticket issued before it is stale
//! - within one epoch, a response older than the last committed one is
//!   stale, so a slow early refetch cannot overwrite a fast later one

/// Captured at refetch start and checked at resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    epoch: u64,
    request: u64,
}

#[derive(Debug, Default)]
pub struct RequestTracker {
    epoch: u64,
    issued: u64,
    committed: u64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate every outstanding ticket.
    pub fn retarget(&mut self) {
        self.epoch += 1;
        self.committed = self.issued;
    }

    pub fn issue(&mut self) -> Ticket {
        self.issued += 1;
        Ticket {
            epoch: self.epoch,
            request: self.issued,
        }
    }

    /// Record `ticket` as committed if its response may still be applied.
    pub fn try_commit(&mut self, ticket: Ticket) -> bool {
        if ticket.epoch != self.epoch || ticket.request < self.committed {
            return false;
        }
        self.committed = ticket.request;
        true
    }

    /// Whether a ticket of the current epoch is newer than the last commit.
    pub fn pending(&self) -> bool {
        self.issued > self.committed
    }
}
