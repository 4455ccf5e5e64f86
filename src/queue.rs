//! Per-port reordering buffer.
//!
//! Messages arrive in arbitrary order but carry sequence numbers; the queue
//! releases them strictly in order. It is blocked until the message with
//! sequence number `next_sequence_num` arrives, releases a run of
//! consecutive messages, then blocks again at the next gap.

use std::collections::binary_heap::PeekMut;
use std::collections::BinaryHeap;

use crate::event::{self, INITIAL_SEQUENCE_NUM};
use crate::message::Message;

/// A min-heap of user messages keyed by sequence number, plus the cursor of
/// the next expected number.
pub struct MessageQueue {
    heap: BinaryHeap<QueuedMessage>,
    next_sequence_num: u64,
    signalable: bool,
}

impl MessageQueue {
    /// A queue expecting `INITIAL_SEQUENCE_NUM` first.
    pub fn new() -> Self {
        Self::with_next_sequence_num(INITIAL_SEQUENCE_NUM)
    }

    /// A queue expecting `next_sequence_num` first. Used when a transferred
    /// port resumes a pipe mid-stream.
    pub fn with_next_sequence_num(next_sequence_num: u64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence_num,
            signalable: true,
        }
    }

    /// The sequence number the queue is waiting on.
    pub fn next_sequence_num(&self) -> u64 {
        self.next_sequence_num
    }

    /// While false, `has_next_message` reports false regardless of queue
    /// state. A freshly accepted transferred port stays unsignalable until
    /// the message that carried it reaches the user.
    pub fn set_signalable(&mut self, signalable: bool) {
        self.signalable = signalable;
    }

    /// Whether an in-order message is ready (and the queue is signalable).
    pub fn has_next_message(&self) -> bool {
        self.signalable && self.head_is_next()
    }

    /// Take ownership of a user message.
    ///
    /// Returns true when the head of the queue is deliverable in order after
    /// this push, i.e. a status signal should fire. Messages buffered behind
    /// a gap do not signal.
    pub fn accept_message(&mut self, message: Message) -> bool {
        let sequence_num = event::user_sequence_num(&message);
        self.heap.push(QueuedMessage {
            sequence_num,
            message,
        });
        self.signalable && self.head_is_next()
    }

    /// Pop the next in-order message, if one is ready and `selector` (when
    /// given) accepts it. The selector must be pure; it may not call back
    /// into the node.
    pub fn next_message_if(
        &mut self,
        selector: Option<&dyn Fn(&Message) -> bool>,
    ) -> Option<Message> {
        let head = self.heap.peek_mut()?;
        if head.sequence_num != self.next_sequence_num {
            return None;
        }
        if let Some(selector) = selector {
            if !selector(&head.message) {
                return None;
            }
        }
        self.next_sequence_num += 1;
        Some(PeekMut::pop(head).message)
    }

    fn head_is_next(&self) -> bool {
        self.heap
            .peek()
            .is_some_and(|head| head.sequence_num == self.next_sequence_num)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct QueuedMessage {
    sequence_num: u64,
    message: Message,
}

// Inverted ordering turns std's max-heap into the min-heap we want.
impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.sequence_num.cmp(&self.sequence_num)
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_num == other.sequence_num
    }
}

impl Eq for QueuedMessage {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{user_header_size, EventHeader, EventType, UserEventData};
    use crate::name::PortName;

    fn user_message(sequence_num: u64) -> Message {
        let mut message = Message::new(user_header_size(0), 0, 0);
        EventHeader {
            port_name: PortName::INVALID,
            event_type: EventType::User,
        }
        .write(&mut message);
        UserEventData {
            sequence_num,
            num_ports: 0,
        }
        .write(&mut message);
        message
    }

    #[test]
    fn releases_in_order() {
        let mut queue = MessageQueue::new();
        assert!(!queue.accept_message(user_message(3)));
        assert!(!queue.accept_message(user_message(2)));
        assert!(queue.accept_message(user_message(1)));

        for expected in 1..=3 {
            let message = queue.next_message_if(None).unwrap();
            assert_eq!(event::user_sequence_num(&message), expected);
        }
        assert!(queue.next_message_if(None).is_none());
        assert_eq!(queue.next_sequence_num(), 4);
    }

    #[test]
    fn blocks_on_gap() {
        let mut queue = MessageQueue::new();
        queue.accept_message(user_message(2));
        assert!(!queue.has_next_message());
        assert!(queue.next_message_if(None).is_none());

        queue.accept_message(user_message(1));
        assert!(queue.has_next_message());
    }

    #[test]
    fn signal_follows_head_deliverability() {
        let mut queue = MessageQueue::new();
        assert!(queue.accept_message(user_message(1)));
        queue.next_message_if(None).unwrap();

        // Out of order behind the gap at 2; nothing deliverable.
        assert!(!queue.accept_message(user_message(3)));
        // Filling the gap makes the head deliverable again.
        assert!(queue.accept_message(user_message(2)));
    }

    #[test]
    fn unsignalable_queue_reports_no_messages() {
        let mut queue = MessageQueue::new();
        queue.set_signalable(false);
        assert!(!queue.accept_message(user_message(1)));
        assert!(!queue.has_next_message());
        // Popping still works; only signaling is suppressed.
        assert!(queue.next_message_if(None).is_some());
    }

    #[test]
    fn selector_gates_delivery() {
        let mut queue = MessageQueue::new();
        queue.accept_message(user_message(1));

        let reject: &dyn Fn(&Message) -> bool = &|_| false;
        assert!(queue.next_message_if(Some(reject)).is_none());
        assert_eq!(queue.next_sequence_num(), 1);

        let accept: &dyn Fn(&Message) -> bool = &|_| true;
        assert!(queue.next_message_if(Some(accept)).is_some());
        assert_eq!(queue.next_sequence_num(), 2);
    }

    #[test]
    fn starts_mid_stream() {
        let mut queue = MessageQueue::with_next_sequence_num(5);
        queue.accept_message(user_message(4));
        assert!(!queue.has_next_message());
        queue.accept_message(user_message(5));
        assert!(queue.has_next_message());
    }
}
