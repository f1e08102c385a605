//! Bookkeeping for registrations that complete asynchronously
//!
//! A radio stack hands back a handle some time after a registration was
//! requested, and dropping that handle unregisters it. [`RegistrationSlot`]
//! holds the current handle and decides what to do with late arrivals:
//! a handle requested before the last [`RegistrationSlot::reset`] or
//! superseded by a newer request is handed back to the caller to drop.

/// Identifies one registration request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    epoch: u64,
    seq: u64,
}

/// Holds at most one live registration handle
#[derive(Debug)]
pub(crate) struct RegistrationSlot<H> {
    epoch: u64,
    seq: u64,
    current: Option<(u64, H)>,
}

impl<H> Default for RegistrationSlot<H> {
    fn default() -> Self {
        Self {
            epoch: 0,
            seq: 0,
            current: None,
        }
    }
}

impl<H> RegistrationSlot<H> {
    /// Start a registration request
    pub(crate) fn begin(&mut self) -> Ticket {
        self.seq += 1;
        Ticket {
            epoch: self.epoch,
            seq: self.seq,
        }
    }

    /// Whether the ticket was issued before the last reset
    pub(crate) fn is_stale(&self, ticket: Ticket) -> bool {
        ticket.epoch != self.epoch
    }

    /// Store a completed registration.
    ///
    /// Returns the handle that is no longer wanted: the arriving one when it
    /// is stale or superseded, otherwise the one it replaces.
    pub(crate) fn complete(&mut self, ticket: Ticket, handle: H) -> Option<H> {
        if self.is_stale(ticket) {
            return Some(handle);
        }
        if self
            .current
            .as_ref()
            .is_some_and(|(seq, _)| *seq > ticket.seq)
        {
            return Some(handle);
        }
        self.current.replace((ticket.seq, handle)).map(|(_, h)| h)
    }

    /// Take the live handle without invalidating requests in flight
    pub(crate) fn take(&mut self) -> Option<H> {
        self.current.take().map(|(_, h)| h)
    }

    /// Invalidate every request in flight and take the live handle
    pub(crate) fn reset(&mut self) -> Option<H> {
        self.epoch += 1;
        self.take()
    }

    /// Whether a handle is live
    pub(crate) fn is_live(&self) -> bool {
        self.current.is_some()
    }
}
