//! Single-slot bridge between blocking operations and transport events
//!
//! At most one session operation waits for an acknowledgment at a time.
//! The waiter registers the event kind it expects before the request is
//! issued; the event router offers every acknowledgment to the slot and
//! the first matching event resolves the wait. A `Disconnected` event
//! resolves any waiter, so operations fail fast when the link dies
//! instead of running out their timeout.

use crate::transport::{EventKind, TransportEvent};
use std::sync::Mutex;
use tokio::sync::oneshot;

struct Waiter {
    expected: EventKind,
    tx: oneshot::Sender<TransportEvent>,
}

#[derive(Default)]
pub(crate) struct PendingSlot {
    inner: Mutex<Option<Waiter>>,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for an operation expecting `expected`.
    ///
    /// Returns `None` when another operation already holds the slot.
    pub fn register(&self, expected: EventKind) -> Option<oneshot::Receiver<TransportEvent>> {
        let mut guard = self.inner.lock().expect("pending slot lock poisoned");
        if guard.is_some() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *guard = Some(Waiter { expected, tx });
        Some(rx)
    }

    /// Offer an event to the current waiter, resolving and clearing the
    /// slot on a match. Returns whether the event was consumed.
    pub fn offer(&self, event: &TransportEvent) -> bool {
        let mut guard = self.inner.lock().expect("pending slot lock poisoned");
        let matches = guard.as_ref().is_some_and(|w| {
            w.expected == event.kind() || event.kind() == EventKind::Disconnected
        });
        if matches {
            if let Some(waiter) = guard.take() {
                // receiver may have given up already; that is fine
                let _ = waiter.tx.send(event.clone());
            }
        }
        matches
    }

    /// Abandon the current wait, usually after a timeout
    pub fn clear(&self) {
        self.inner.lock().expect("pending slot lock poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_event_resolves_waiter() {
        let slot = PendingSlot::new();
        let mut rx = slot.register(EventKind::SubAck).unwrap();

        assert!(slot.offer(&TransportEvent::SubAck));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::SubAck);
        // slot is free again
        assert!(slot.register(EventKind::PubAck).is_some());
    }

    #[test]
    fn test_slot_rejects_second_waiter() {
        let slot = PendingSlot::new();
        let _rx = slot.register(EventKind::ConnAck).unwrap();
        assert!(slot.register(EventKind::PubAck).is_none());
    }

    #[test]
    fn test_mismatched_event_is_not_consumed() {
        let slot = PendingSlot::new();
        let _rx = slot.register(EventKind::PubAck).unwrap();
        assert!(!slot.offer(&TransportEvent::SubAck));
        // waiter is still registered
        assert!(slot.register(EventKind::SubAck).is_none());
    }

    #[test]
    fn test_disconnect_resolves_any_waiter() {
        let slot = PendingSlot::new();
        let mut rx = slot.register(EventKind::PubAck).unwrap();

        assert!(slot.offer(&TransportEvent::Disconnected));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Disconnected);
    }

    #[test]
    fn test_clear_frees_slot_and_late_event_is_dropped() {
        let slot = PendingSlot::new();
        let _rx = slot.register(EventKind::PubAck).unwrap();
        slot.clear();

        assert!(!slot.offer(&TransportEvent::PubAck { message_id: 7 }));
        assert!(slot.register(EventKind::PubAck).is_some());
    }

    #[test]
    fn test_offer_without_waiter() {
        let slot = PendingSlot::new();
        assert!(!slot.offer(&TransportEvent::SubAck));
    }
}
