//! WAL event watchers.
//!
//! A watcher subscribes to edge notifications from the WAL thread:
//! `ROTATE` when a new segment is opened and `WRITE` when a batch lands.
//! Delivery is coalescing: while a notification is in flight (delivered
//! but not yet acknowledged), further events OR into a pending mask and
//! are re-sent in one message when the acknowledgement comes back. The
//! watcher list is touched only by the WAL thread; attach and detach
//! travel over the WAL pipe like everything else.

use std::time::Duration;

use crate::bus::{Endpoint, Pipe, Recv};

use super::writer::WalRequest;

/// A new segment was opened.
pub const WAL_EVENT_ROTATE: u8 = 1 << 0;

/// A batch of rows was written.
pub const WAL_EVENT_WRITE: u8 = 1 << 1;

/// Subscriber end of a watcher.
///
/// After consuming a notification the subscriber must call [`ack`] so the
/// WAL can flush the pending mask; missing the ack stalls the watcher,
/// not the WAL.
///
/// [`ack`]: WalWatcher::ack
pub struct WalWatcher {
    name: String,
    events: Endpoint<u8>,
    wal_pipe: Pipe<WalRequest>,
}

impl WalWatcher {
    pub(crate) fn new(name: String, events: Endpoint<u8>, wal_pipe: Pipe<WalRequest>) -> Self {
        Self { name, events, wal_pipe }
    }

    /// Watcher name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event mask. `None` on timeout, or when the WAL
    /// has shut down and the pipe is closed.
    pub fn wait_events(&self, timeout: Duration) -> Option<u8> {
        match self.events.recv_timeout(timeout) {
            Recv::Msg(events) => Some(events),
            Recv::Timeout | Recv::Closed => None,
        }
    }

    /// Non-blocking poll for an event mask.
    pub fn try_events(&self) -> Option<u8> {
        self.events.try_recv()
    }

    /// True once the WAL side is gone and no further event can arrive.
    pub fn is_closed(&self) -> bool {
        self.wal_pipe.push(WalRequest::Nop).is_err()
    }

    /// Acknowledge the last delivered notification.
    pub fn ack(&self) {
        let _ = self.wal_pipe.push(WalRequest::WatcherAck { name: self.name.clone() });
    }
}

/// WAL-thread side of one watcher.
pub(crate) struct WatcherSlot {
    pub name: String,
    pipe: Pipe<u8>,
    in_flight: bool,
    pending: u8,
}

impl WatcherSlot {
    pub fn new(name: String, pipe: Pipe<u8>) -> Self {
        Self { name, pipe, in_flight: false, pending: 0 }
    }

    /// Deliver events, coalescing while a notification is in flight.
    pub fn notify(&mut self, events: u8) {
        if events == 0 {
            return;
        }
        if self.in_flight {
            self.pending |= events;
            return;
        }
        if self.pipe.push(events).is_ok() {
            self.in_flight = true;
        }
    }

    /// The subscriber acknowledged; re-send anything that accumulated.
    pub fn ack(&mut self) {
        self.in_flight = false;
        if self.pending != 0 {
            let pending = self.pending;
            self.pending = 0;
            self.notify(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;

    fn slot() -> (WatcherSlot, Endpoint<u8>) {
        let (pipe, endpoint) = bus::pipe::<u8>("watcher");
        (WatcherSlot::new("test".to_string(), pipe), endpoint)
    }

    #[test]
    fn test_notify_delivers_mask() {
        let (mut slot, endpoint) = slot();
        slot.notify(WAL_EVENT_ROTATE);
        assert_eq!(endpoint.try_recv(), Some(WAL_EVENT_ROTATE));
    }

    #[test]
    fn test_events_coalesce_while_in_flight() {
        let (mut slot, endpoint) = slot();
        slot.notify(WAL_EVENT_ROTATE);
        // Not yet acknowledged: these two merge into one pending mask.
        slot.notify(WAL_EVENT_WRITE);
        slot.notify(WAL_EVENT_WRITE);
        assert_eq!(endpoint.try_recv(), Some(WAL_EVENT_ROTATE));
        assert_eq!(endpoint.try_recv(), None);

        slot.ack();
        assert_eq!(endpoint.try_recv(), Some(WAL_EVENT_WRITE));
    }

    #[test]
    fn test_ack_without_pending_sends_nothing() {
        let (mut slot, endpoint) = slot();
        slot.notify(WAL_EVENT_WRITE);
        assert_eq!(endpoint.try_recv(), Some(WAL_EVENT_WRITE));
        slot.ack();
        assert_eq!(endpoint.try_recv(), None);
    }

    #[test]
    fn test_zero_mask_is_ignored() {
        let (mut slot, endpoint) = slot();
        slot.notify(0);
        assert_eq!(endpoint.try_recv(), None);
    }
}
