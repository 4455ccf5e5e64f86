//! The per-endpoint record.
//!
//! A port is one half of a bidirectional pipe. The node's map owns the
//! record as `Arc<Port>`; operations in flight hold short-lived clones, so a
//! record erased from the map lives until the last handle drops. All mutable
//! state sits behind the per-port lock.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::event::INVALID_SEQUENCE_NUM;
use crate::message::Message;
use crate::name::{NodeName, PortName};
use crate::queue::MessageQueue;

/// Lifecycle state of a port record.
///
/// ```text
/// Uninitialized -> Receiving -> Buffering -> Proxying -> (erased)
///                      \-> Closed -> (erased)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PortState {
    /// Created without a peer; sends are parked until initialization.
    Uninitialized,
    /// The authoritative endpoint the user reads from.
    Receiving,
    /// Mid-transfer: the new location is not yet known to exist, outbound
    /// traffic is parked in the queue.
    Buffering,
    /// A forwarding stub awaiting removal.
    Proxying,
    /// Scheduled for erasure; inbound traffic is dropped.
    Closed,
}

/// Opaque embedder data attached to a port.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// A port record. Shared between the node's map and in-flight handles.
pub struct Port {
    pub(crate) inner: Mutex<PortInner>,
}

/// The mutable state of a port, guarded by the per-port lock.
pub(crate) struct PortInner {
    pub state: PortState,
    /// Current outbound destination.
    pub peer_node: NodeName,
    pub peer_port: PortName,
    /// Stamp for the next outgoing user message.
    pub next_sequence_num_to_send: u64,
    /// Highest sequence number still expected, once closure or a proxy ack
    /// fixed it. `INVALID_SEQUENCE_NUM` while unknown.
    pub last_sequence_num_to_receive: u64,
    pub message_queue: MessageQueue,
    /// Messages sent while Uninitialized, flushed on initialization.
    pub outgoing_messages: VecDeque<Message>,
    /// Ports taken by those parked messages; their peer node is rewritten
    /// when the destination becomes known.
    pub outgoing_ports: Vec<Arc<Port>>,
    /// Deferred message emitted exactly once when this proxy dissolves.
    pub send_on_proxy_removal: Option<(NodeName, Message)>,
    pub user_data: Option<UserData>,
    /// Armed once the terminal sequence number is known; the proxy erases
    /// itself after forwarding that message.
    pub remove_proxy_on_last_message: bool,
    pub peer_closed: bool,
}

impl Port {
    /// A fresh record in the given state with its sequence counters set.
    pub(crate) fn new(
        state: PortState,
        next_sequence_num_to_send: u64,
        next_sequence_num_to_receive: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PortInner {
                state,
                peer_node: NodeName::INVALID,
                peer_port: PortName::INVALID,
                next_sequence_num_to_send,
                last_sequence_num_to_receive: INVALID_SEQUENCE_NUM,
                message_queue: MessageQueue::with_next_sequence_num(next_sequence_num_to_receive),
                outgoing_messages: VecDeque::new(),
                outgoing_ports: Vec::new(),
                send_on_proxy_removal: None,
                user_data: None,
                remove_proxy_on_last_message: false,
                peer_closed: false,
            }),
        })
    }
}

impl PortInner {
    /// Whether further in-order messages are still expected.
    ///
    /// False exactly when the terminal sequence number is known (closure or
    /// proxy ack) and the queue has advanced past it.
    pub fn can_accept_more_messages(&self) -> bool {
        if self.peer_closed || self.remove_proxy_on_last_message {
            if self.last_sequence_num_to_receive == self.message_queue.next_sequence_num() - 1 {
                return false;
            }
        }
        true
    }
}

/// A clonable handle pairing a port's name with its record.
#[derive(Clone)]
pub struct PortRef {
    name: PortName,
    port: Arc<Port>,
}

impl PortRef {
    pub(crate) fn new(name: PortName, port: Arc<Port>) -> Self {
        Self { name, port }
    }

    /// The port's name on its hosting node.
    pub fn name(&self) -> PortName {
        self.name
    }

    pub(crate) fn port(&self) -> &Arc<Port> {
        &self.port
    }
}

impl std::fmt::Debug for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PortRef").field(&self.name).finish()
    }
}
