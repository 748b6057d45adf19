//! Poll queue for events.

use crate::types::Event;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::time::{Duration, Instant};

/// Unbounded FIFO of events drained by polling.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Wait up to `timeout` for the next event. A zero timeout waits
    /// indefinitely. Returns a `Timeout` event if nothing arrives in time.
    pub fn next_event(&self, timeout: Duration) -> Event {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        self.recv_until(deadline).unwrap_or_else(Event::timeout)
    }

    /// Take the next event without blocking.
    pub fn try_next_event(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Discard every queued event. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub(crate) fn push(&self, event: Event) {
        // The queue holds its own receiver, so it can never be disconnected.
        let _ = self.sender.send(event);
    }

    /// Receive until `deadline` (`None` = no deadline).
    pub(crate) fn recv_until(&self, deadline: Option<Instant>) -> Option<Event> {
        match deadline {
            None => self.receiver.recv().ok(),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.receiver.recv_timeout(remaining) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
                }
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    #[test]
    fn test_timeout_sentinel() {
        let queue = EventQueue::new();
        let start = Instant::now();
        let event = queue.next_event(Duration::from_millis(50));
        assert!(event.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_fifo_and_purge() {
        let queue = EventQueue::new();
        assert!(queue.try_next_event().is_none());

        queue.push(Event::new(EventKind::Response, vec![]));
        queue.push(Event::new(EventKind::PartialResponse, vec![]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_next_event().unwrap().kind, EventKind::Response);

        queue.push(Event::new(EventKind::Response, vec![]));
        assert_eq!(queue.purge(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clones_share_queue() {
        let queue = EventQueue::new();
        let clone = queue.clone();
        clone.push(Event::new(EventKind::Response, vec![]));
        assert_eq!(queue.next_event(Duration::from_millis(10)).kind, EventKind::Response);
    }
}
