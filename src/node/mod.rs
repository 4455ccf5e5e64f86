//! The per-node routing core.
//!
//! A `Node` owns the map of ports hosted on this participant, implements the
//! public port operations, and handles the events of the inter-node
//! protocol, including the distributed proxy-removal dance that collapses
//! forwarding stubs left behind by port transfers.
//!
//! ## Locking
//!
//! Four locks exist: the send-with-ports batch lock (serializes multi-port
//! sends so embedded port locks may be taken in arbitrary order), the port
//! map lock, the per-port locks, and the local-loopback lock. The map lock
//! is only ever taken bare or after a port lock, never around one; outside
//! a batched send, at most one port lock is held at a time beyond the lock
//! of the port the operation entered through. The loopback lock is never
//! held across a port operation.

mod proxy;
mod transfer;
#[cfg(test)]
mod tests;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::delegate::{new_internal_message, NodeDelegate};
use crate::error::PortError;
use crate::event::{self, EventType, INITIAL_SEQUENCE_NUM};
use crate::message::{Message, PORT_NAME_SIZE};
use crate::name::{NodeName, PortName};
use crate::port::{Port, PortRef, PortState, UserData};

/// Observable state of a receiving port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortStatus {
    /// An in-order message is ready for `get_message`.
    pub has_messages: bool,
    /// The peer has closed its end.
    pub peer_closed: bool,
}

/// Same-node deliveries park here so a send never re-enters the node
/// synchronously. Whichever thread flips `delivering` drains the queue.
struct LocalMessageQueue {
    delivering: bool,
    messages: VecDeque<Message>,
}

/// A participant in the fabric: a named map of ports plus a delegate.
pub struct Node {
    name: NodeName,
    delegate: Arc<dyn NodeDelegate>,
    ports: Mutex<HashMap<PortName, Arc<Port>>>,
    /// Excludes other threads from locking multiple ports in arbitrary
    /// order during a multi-port send.
    send_with_ports: Mutex<()>,
    local: Mutex<LocalMessageQueue>,
}

impl Node {
    /// Create a node. The delegate must outlive every operation on it.
    pub fn new(name: NodeName, delegate: Arc<dyn NodeDelegate>) -> Self {
        Self {
            name,
            delegate,
            ports: Mutex::new(HashMap::new()),
            send_with_ports: Mutex::new(()),
            local: Mutex::new(LocalMessageQueue {
                delivering: false,
                messages: VecDeque::new(),
            }),
        }
    }

    /// This node's name.
    pub fn name(&self) -> NodeName {
        self.name
    }

    /// Number of port records currently hosted here, proxies included.
    pub fn port_count(&self) -> usize {
        self.ports.lock().unwrap().len()
    }

    /// Re-acquire a handle to a named port, e.g. one carried by a
    /// delivered message.
    pub fn get_port(&self, port_name: PortName) -> Result<PortRef, PortError> {
        self.lookup(port_name)
            .map(|port| PortRef::new(port_name, port))
            .ok_or(PortError::PortUnknown)
    }

    // === Port creation ===

    /// Create a port with no peer. It must be initialized before use;
    /// messages sent in the meantime are parked.
    pub fn create_uninitialized_port(&self) -> Result<PortRef, PortError> {
        let port_name = self.delegate.generate_random_port_name();
        let port = Port::new(
            PortState::Uninitialized,
            INITIAL_SEQUENCE_NUM,
            INITIAL_SEQUENCE_NUM,
        );
        self.add_port_with_name(port_name, Arc::clone(&port))?;
        Ok(PortRef::new(port_name, port))
    }

    /// Give an uninitialized port its peer and flush anything parked on it.
    pub fn initialize_port(
        &self,
        port_ref: &PortRef,
        peer_node: NodeName,
        peer_port: PortName,
    ) -> Result<(), PortError> {
        {
            let mut port = port_ref.port().inner.lock().unwrap();
            if port.state != PortState::Uninitialized {
                return Err(PortError::PortStateUnexpected);
            }
            port.state = PortState::Receiving;
            port.peer_node = peer_node;
            port.peer_port = peer_port;

            self.flush_outgoing_messages_locked(&mut port);
        }

        self.delegate.port_status_changed(port_ref);
        Ok(())
    }

    /// Create two connected receiving ports on this node.
    pub fn create_port_pair(&self) -> Result<(PortRef, PortRef), PortError> {
        let port0 = self.create_uninitialized_port()?;
        let port1 = self.create_uninitialized_port()?;
        self.initialize_port(&port0, self.name, port1.name())?;
        self.initialize_port(&port1, self.name, port0.name())?;
        Ok((port0, port1))
    }

    // === User data ===

    /// Attach embedder data to a port. Rejected once closed.
    pub fn set_user_data(&self, port_ref: &PortRef, user_data: UserData) -> Result<(), PortError> {
        let mut port = port_ref.port().inner.lock().unwrap();
        if port.state == PortState::Closed {
            return Err(PortError::PortStateUnexpected);
        }
        port.user_data = Some(user_data);
        Ok(())
    }

    /// Read back the embedder data attached to a port.
    pub fn get_user_data(&self, port_ref: &PortRef) -> Result<Option<UserData>, PortError> {
        let port = port_ref.port().inner.lock().unwrap();
        if port.state == PortState::Closed {
            return Err(PortError::PortStateUnexpected);
        }
        Ok(port.user_data.clone())
    }

    // === Reading ===

    /// Current status of a receiving port.
    pub fn get_status(&self, port_ref: &PortRef) -> Result<PortStatus, PortError> {
        let port = port_ref.port().inner.lock().unwrap();
        if port.state != PortState::Receiving {
            return Err(PortError::PortStateUnexpected);
        }
        Ok(PortStatus {
            has_messages: port.message_queue.has_next_message(),
            peer_closed: port.peer_closed,
        })
    }

    /// Pop the next in-order message, or `Ok(None)` when nothing is ready.
    ///
    /// Returns `Err(PeerClosed)` once the peer has closed and every message
    /// it sent has been read.
    pub fn get_message(&self, port_ref: &PortRef) -> Result<Option<Message>, PortError> {
        self.get_message_impl(port_ref, None)
    }

    /// Like [`get_message`](Self::get_message), gated by a pure selector.
    /// The selector may not call back into the node.
    pub fn get_message_if(
        &self,
        port_ref: &PortRef,
        selector: impl Fn(&Message) -> bool,
    ) -> Result<Option<Message>, PortError> {
        self.get_message_impl(port_ref, Some(&selector))
    }

    fn get_message_impl(
        &self,
        port_ref: &PortRef,
        selector: Option<&dyn Fn(&Message) -> bool>,
    ) -> Result<Option<Message>, PortError> {
        let message = {
            let mut port = port_ref.port().inner.lock().unwrap();

            // A port that has been sent away or closed is no longer
            // readable; the embedder holds a stale handle.
            if port.state != PortState::Receiving {
                return Err(PortError::PortStateUnexpected);
            }

            // Hand out queued messages until exhaustion before reporting
            // the closure.
            if !port.can_accept_more_messages() {
                return Err(PortError::PeerClosed);
            }

            port.message_queue.next_message_if(selector)
        };

        // Ports carried by the delivered message may signal from now on.
        if let Some(message) = &message {
            for i in 0..message.num_ports() {
                let name = message.port(i);
                match self.lookup(name) {
                    Some(new_port) => {
                        let mut inner = new_port.inner.lock().unwrap();
                        debug_assert_eq!(inner.state, PortState::Receiving);
                        inner.message_queue.set_signalable(true);
                    }
                    None => warn!(
                        port = ?name,
                        node = ?self.name,
                        "delivered message references a missing port"
                    ),
                }
            }
        }

        Ok(message)
    }

    // === Sending ===

    /// Allocate a user message with room for `num_ports` transferred ports.
    ///
    /// The header is pre-written; the caller fills the payload and port
    /// names and passes the message to [`send_message`](Self::send_message).
    pub fn alloc_message(&self, num_payload_bytes: usize, num_ports: usize) -> Message {
        let mut message = self.delegate.alloc_message(
            event::user_header_size(num_ports),
            num_payload_bytes,
            num_ports * PORT_NAME_SIZE,
        );
        event::EventHeader {
            port_name: PortName::INVALID,
            event_type: EventType::User,
        }
        .write(&mut message);
        event::UserEventData {
            sequence_num: event::INVALID_SEQUENCE_NUM,
            num_ports: num_ports as u32,
        }
        .write(&mut message);
        message
    }

    /// Send a message from a port toward its peer.
    ///
    /// Embedded ports are taken from this node as part of the send. On an
    /// uninitialized port the message parks until initialization. Same-node
    /// destinations go through the loopback queue rather than being
    /// delivered inline.
    pub fn send_message(&self, port_ref: &PortRef, message: Message) -> Result<(), PortError> {
        event::UserEventData::parse(&message)?;

        for i in 0..message.num_ports() {
            if message.port(i) == port_ref.name() {
                return Err(PortError::CannotSendSelf);
            }
        }

        let mut message = message;
        {
            let mut port = port_ref.port().inner.lock().unwrap();

            if port.state != PortState::Receiving && port.state != PortState::Uninitialized {
                return Err(PortError::PortStateUnexpected);
            }
            if port.state == PortState::Receiving && port.peer_closed {
                return Err(PortError::PeerClosed);
            }

            let mut ports_taken = Vec::new();
            self.will_send_message_locked(
                &mut port,
                port_ref.name(),
                &mut message,
                Some(&mut ports_taken),
            )?;

            if port.state == PortState::Uninitialized {
                port.outgoing_messages.push_back(message);
                port.outgoing_ports.append(&mut ports_taken);
                return Ok(());
            }

            debug_assert_eq!(port.state, PortState::Receiving);

            if port.peer_node != self.name {
                self.delegate.forward_message(port.peer_node, message);
                return Ok(());
            }
        }

        self.deliver_local_messages(message);
        Ok(())
    }

    /// Append to the loopback queue, and drain it if nobody else is. Any
    /// `accept_message` below may re-enter `send_message`; the re-entrant
    /// call only appends because the delivering flag is already held.
    fn deliver_local_messages(&self, message: Message) {
        let deliver = {
            let mut local = self.local.lock().unwrap();
            local.messages.push_back(message);
            !std::mem::replace(&mut local.delivering, true)
        };
        if !deliver {
            return;
        }

        loop {
            let next = {
                let mut local = self.local.lock().unwrap();
                match local.messages.pop_front() {
                    Some(message) => message,
                    None => {
                        local.delivering = false;
                        return;
                    }
                }
            };
            if let Err(error) = self.accept_message(next) {
                warn!(node = ?self.name, %error, "dropped local message");
            }
        }
    }

    // === Inter-node entry point ===

    /// Accept a message from the inter-node layer and dispatch it by event
    /// type. This is the counterpart of the delegate's `forward_message`.
    pub fn accept_message(&self, message: Message) -> Result<(), PortError> {
        let header = event::EventHeader::parse(&message)?;
        match header.event_type {
            EventType::User => self.on_user_message(header.port_name, message),
            EventType::PortAccepted => self.on_port_accepted(header.port_name),
            EventType::ObserveProxy => {
                let data = event::ObserveProxyData::parse(&message)?;
                self.on_observe_proxy(header.port_name, data)
            }
            EventType::ObserveProxyAck => {
                let last = event::parse_last_sequence_num(&message)?;
                self.on_observe_proxy_ack(header.port_name, last)
            }
            EventType::ObserveClosure => {
                let last = event::parse_last_sequence_num(&message)?;
                self.on_observe_closure(header.port_name, last)
            }
        }
    }

    // === Closure and node loss ===

    /// Close a receiving port: notify the peer of the last sequence number
    /// sent, then erase the record. Queued unread messages are dropped.
    pub fn close_port(&self, port_ref: &PortRef) -> Result<(), PortError> {
        let (peer_node, peer_port, last_sequence_num) = {
            let mut port = port_ref.port().inner.lock().unwrap();
            if port.state != PortState::Receiving {
                return Err(PortError::PortStateUnexpected);
            }
            port.state = PortState::Closed;

            // The peer consumes everything sent before the closure notice
            // takes effect.
            (
                port.peer_node,
                port.peer_port,
                port.next_sequence_num_to_send - 1,
            )
        };

        let mut message = new_internal_message(
            &*self.delegate,
            peer_port,
            EventType::ObserveClosure,
            event::LAST_SEQUENCE_NUM_DATA_SIZE,
        );
        event::write_last_sequence_num(&mut message, last_sequence_num);
        self.delegate.forward_message(peer_node, message);

        self.erase_port(port_ref.name());
        Ok(())
    }

    /// Communication with `node_name` is gone for good: peer-close every
    /// port pointing at it at the current queue frontier, and erase the
    /// ones with no local reader.
    pub fn lost_connection_to_node(&self, node_name: NodeName) -> Result<(), PortError> {
        debug!(node = ?self.name, lost = ?node_name, "observing lost connection");

        // Snapshot first: port locks are never taken under the map lock.
        let snapshot: Vec<(PortName, Arc<Port>)> = self
            .ports
            .lock()
            .unwrap()
            .iter()
            .map(|(name, port)| (*name, Arc::clone(port)))
            .collect();

        let mut ports_to_notify = Vec::new();

        for (port_name, port) in snapshot {
            let mut remove_port = false;
            {
                let mut inner = port.inner.lock().unwrap();
                if inner.peer_node == node_name {
                    // No more messages will arrive from this peer, nor will
                    // a PortAccepted for any pending transfer.
                    if !inner.peer_closed {
                        inner.peer_closed = true;
                        inner.last_sequence_num_to_receive =
                            inner.message_queue.next_sequence_num() - 1;

                        if inner.state == PortState::Receiving {
                            ports_to_notify.push(PortRef::new(port_name, Arc::clone(&port)));
                        }
                    }

                    if inner.state != PortState::Receiving {
                        remove_port = true;
                    }
                }
            }
            if remove_port {
                self.erase_port(port_name);
            }
        }

        for port_ref in ports_to_notify {
            self.delegate.port_status_changed(&port_ref);
        }

        Ok(())
    }

    // === Port map ===

    pub(in crate::node) fn add_port_with_name(
        &self,
        port_name: PortName,
        port: Arc<Port>,
    ) -> Result<(), PortError> {
        let mut ports = self.ports.lock().unwrap();
        match ports.entry(port_name) {
            // A collision means the name generator is defective.
            Entry::Occupied(_) => Err(PortError::PortExists),
            Entry::Vacant(entry) => {
                entry.insert(port);
                debug!(port = ?port_name, node = ?self.name, "created port");
                Ok(())
            }
        }
    }

    pub(in crate::node) fn erase_port(&self, port_name: PortName) {
        self.ports.lock().unwrap().remove(&port_name);
        debug!(port = ?port_name, node = ?self.name, "deleted port");
    }

    pub(in crate::node) fn lookup(&self, port_name: PortName) -> Option<Arc<Port>> {
        self.ports.lock().unwrap().get(&port_name).cloned()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("ports", &self.port_count())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Ok(ports) = self.ports.get_mut() {
            if !ports.is_empty() {
                warn!(node = ?self.name, ports = ports.len(), "unclean node shutdown");
            }
        }
    }
}
