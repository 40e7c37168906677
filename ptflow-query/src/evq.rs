//! Fixed-size ring queues for pending events.

use ptflow_codec::{Error, Result};

use crate::event::Event;

/// Ring capacity in slots. One slot always stays unused so head == tail
/// means empty rather than full; legal traces never keep more than a
/// handful of events in flight per binding.
const SLOTS: usize = 8;

/// FIFO ring of events with a reserved gap slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventQueue {
    slots: [Option<Event>; SLOTS],
    head: usize,
    tail: usize,
}

impl EventQueue {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; SLOTS],
            head: 0,
            tail: 0,
        }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    const fn is_full(&self) -> bool {
        (self.tail + 1) % SLOTS == self.head
    }

    pub(crate) fn enqueue(&mut self, event: Event) -> Result<()> {
        if self.is_full() {
            return Err(Error::Internal);
        }
        self.slots[self.tail] = Some(event);
        self.tail = (self.tail + 1) % SLOTS;
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<Event> {
        if self.is_empty() {
            return None;
        }
        let event = self.slots[self.head].take();
        self.head = (self.head + 1) % SLOTS;
        event
    }

    pub(crate) fn discard_all(&mut self) {
        while self.dequeue().is_some() {}
    }

    pub(crate) fn any(&self, pred: impl Fn(&Event) -> bool) -> bool {
        let mut at = self.head;
        while at != self.tail {
            if self.slots[at].as_ref().is_some_and(&pred) {
                return true;
            }
            at = (at + 1) % SLOTS;
        }
        false
    }

    /// Keep only events matching `pred`, preserving their order.
    pub(crate) fn retain(&mut self, pred: impl Fn(&Event) -> bool) {
        let mut kept = Self::new();
        while let Some(event) = self.dequeue() {
            if pred(&event) {
                // Cannot fail, the drained ring held at most SLOTS - 1.
                let _ = kept.enqueue(event);
            }
        }
        *self = kept;
    }
}

/// One pending-event ring per binding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventQueues {
    /// Events released at the end of the boundary packet sequence
    pub(crate) psbend: EventQueue,
    /// Events completed by the next TIP-family packet
    pub(crate) tip: EventQueue,
    /// Events completed by the next FUP
    pub(crate) fup: EventQueue,
}

impl EventQueues {
    pub(crate) const fn new() -> Self {
        Self {
            psbend: EventQueue::new(),
            tip: EventQueue::new(),
            fup: EventQueue::new(),
        }
    }

    /// Drop pending transition events, keeping status updates.
    pub(crate) fn discard_transient(&mut self) {
        self.psbend.retain(|event| event.status_update);
        self.tip.retain(|event| event.status_update);
        self.fup.retain(|event| event.status_update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn paging(cr3: u64) -> Event {
        Event::new(EventKind::Paging { cr3 })
    }

    #[test]
    fn fifo_order() {
        let mut queue = EventQueue::new();
        for cr3 in 0..3 {
            queue.enqueue(paging(cr3)).unwrap();
        }
        for cr3 in 0..3 {
            assert_eq!(queue.dequeue(), Some(paging(cr3)));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn full_ring_rejects_without_overwriting() {
        let mut queue = EventQueue::new();
        for cr3 in 0..SLOTS as u64 - 1 {
            queue.enqueue(paging(cr3)).unwrap();
        }
        assert_eq!(queue.enqueue(paging(99)), Err(Error::Internal));
        for cr3 in 0..SLOTS as u64 - 1 {
            assert_eq!(queue.dequeue(), Some(paging(cr3)));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn ring_wraps_around() {
        let mut queue = EventQueue::new();
        for round in 0..4u64 {
            for offset in 0..5 {
                queue.enqueue(paging(round * 10 + offset)).unwrap();
            }
            for offset in 0..5 {
                assert_eq!(queue.dequeue(), Some(paging(round * 10 + offset)));
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn retain_keeps_order() {
        let mut queue = EventQueue::new();
        for cr3 in 0..6 {
            queue.enqueue(paging(cr3)).unwrap();
        }
        queue.retain(|event| matches!(event.kind, EventKind::Paging { cr3 } if cr3 % 2 == 0));
        assert_eq!(queue.dequeue(), Some(paging(0)));
        assert_eq!(queue.dequeue(), Some(paging(2)));
        assert_eq!(queue.dequeue(), Some(paging(4)));
        assert_eq!(queue.dequeue(), None);
    }
}
