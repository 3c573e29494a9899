//! Bounded hand-off from the session task to the presentation layer.

use crate::domain::models::SessionEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::debug;

/// Producer side. Cloneable; posting never blocks and drops the event when
/// the consumer has fallen behind.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::Sender<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

/// Capacity taken out of the bus up front, so closing events are delivered
/// even when the consumer has fallen behind.
#[derive(Debug)]
pub struct ReservedSlots {
    permits: Vec<mpsc::OwnedPermit<SessionEvent>>,
    bus: EventBus,
}

/// Consumer side, drained by the UI on its own schedule.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: mpsc::Receiver<SessionEvent>,
    finished: bool,
}

impl EventBus {
    pub fn bounded(capacity: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventReceiver {
                receiver,
                finished: false,
            },
        )
    }

    /// Returns `false` if the event was dropped.
    pub fn post(&self, event: SessionEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Event bus full, dropped {:?} ({} total)", event, total);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn message(&self, text: impl Into<String>) {
        self.post(SessionEvent::Message(text.into()));
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.post(SessionEvent::Warn(text.into()));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.post(SessionEvent::Error(text.into()));
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hold back up to `count` slots. Fewer are held if the bus is already
    /// that full.
    pub fn reserve(&self, count: usize) -> ReservedSlots {
        let permits = (0..count)
            .map_while(|_| self.sender.clone().try_reserve_owned().ok())
            .collect();
        ReservedSlots {
            permits,
            bus: self.clone(),
        }
    }
}

impl ReservedSlots {
    /// Post into a held slot, or through the normal path once they are used up.
    pub fn post(&mut self, event: SessionEvent) -> bool {
        match self.permits.pop() {
            Some(permit) => {
                permit.send(event);
                true
            }
            None => self.bus.post(event),
        }
    }
}

impl EventReceiver {
    /// Next queued event without waiting. Yields [`SessionEvent::Shutdown`]
    /// exactly once, either when the sentinel arrives or when every producer
    /// is gone, and `None` forever after.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(SessionEvent::Shutdown) | Err(TryRecvError::Disconnected) => {
                self.finish();
                Some(SessionEvent::Shutdown)
            }
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Waiting variant of [`try_next`](Self::try_next).
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.recv().await {
            Some(SessionEvent::Shutdown) | None => {
                self.finish();
                Some(SessionEvent::Shutdown)
            }
            Some(event) => Some(event),
        }
    }

    /// Everything currently queued, in order.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (bus, mut rx) = EventBus::bounded(8);
        bus.message("one");
        bus.post(SessionEvent::Connected);
        bus.post(SessionEvent::Battery(50));
        assert_eq!(
            rx.drain(),
            vec![
                SessionEvent::Message("one".into()),
                SessionEvent::Connected,
                SessionEvent::Battery(50),
            ]
        );
    }

    #[test]
    fn test_full_bus_drops_newest() {
        let (bus, mut rx) = EventBus::bounded(2);
        assert!(bus.post(SessionEvent::Battery(1)));
        assert!(bus.post(SessionEvent::Battery(2)));
        assert!(!bus.post(SessionEvent::Battery(3)));
        assert_eq!(bus.dropped(), 1);
        assert_eq!(rx.try_next(), Some(SessionEvent::Battery(1)));
        assert_eq!(rx.try_next(), Some(SessionEvent::Battery(2)));
        assert_eq!(rx.try_next(), None);
    }

    #[test]
    fn test_shutdown_seen_once() {
        let (bus, mut rx) = EventBus::bounded(4);
        bus.post(SessionEvent::Disconnected);
        bus.post(SessionEvent::Shutdown);
        bus.post(SessionEvent::Battery(9));
        drop(bus);
        assert_eq!(
            rx.drain(),
            vec![SessionEvent::Disconnected, SessionEvent::Shutdown]
        );
        assert!(rx.is_finished());
        assert_eq!(rx.try_next(), None);
    }

    #[test]
    fn test_reserved_slots_survive_a_full_bus() {
        let (bus, mut rx) = EventBus::bounded(4);
        let mut closing = bus.reserve(2);
        assert!(bus.post(SessionEvent::Battery(1)));
        assert!(bus.post(SessionEvent::Battery(2)));
        assert!(!bus.post(SessionEvent::Battery(3)));
        assert!(closing.post(SessionEvent::Disconnected));
        assert!(closing.post(SessionEvent::Shutdown));
        drop(closing);
        drop(bus);
        assert_eq!(
            rx.drain(),
            vec![
                SessionEvent::Battery(1),
                SessionEvent::Battery(2),
                SessionEvent::Disconnected,
                SessionEvent::Shutdown,
            ]
        );
    }

    #[test]
    fn test_dropped_producers_end_the_stream() {
        let (bus, mut rx) = EventBus::bounded(4);
        bus.post(SessionEvent::Connected);
        drop(bus);
        assert_eq!(rx.try_next(), Some(SessionEvent::Connected));
        assert_eq!(rx.try_next(), Some(SessionEvent::Shutdown));
        assert_eq!(rx.try_next(), None);
    }
}
