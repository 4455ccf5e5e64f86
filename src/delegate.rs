//! The seam between the routing core and its embedder.

use crate::event;
use crate::message::Message;
use crate::name::{NodeName, PortName};
use crate::port::PortRef;

/// Capabilities the node requires from its embedder.
///
/// The delegate is injected at node construction and must outlive the node.
/// Calls arrive on whichever thread drives the triggering operation.
pub trait NodeDelegate: Send + Sync {
    /// Produce a fresh, globally unique port name.
    fn generate_random_port_name(&self) -> PortName;

    /// Allocate a message with the given region sizes.
    ///
    /// The default builds a plain heap-backed [`Message`]; embedders with
    /// their own storage strategy override this.
    fn alloc_message(
        &self,
        num_header_bytes: usize,
        num_payload_bytes: usize,
        num_ports_bytes: usize,
    ) -> Message {
        Message::new(num_header_bytes, num_payload_bytes, num_ports_bytes)
    }

    /// Hand a message to the inter-node layer, routed by its header's
    /// destination port.
    ///
    /// The node may call this while holding a port lock, so the delegate
    /// must not synchronously re-enter the node on the same thread. When
    /// `node` names the delegate's own node, it must loop the message back
    /// through [`Node::accept_message`](crate::Node::accept_message)
    /// asynchronously.
    fn forward_message(&self, node: NodeName, message: Message);

    /// The named port's observable status may have changed.
    ///
    /// Never re-entered: the node only fires this with no locks held.
    fn port_status_changed(&self, port: &PortRef);
}

/// Build a control message for `event_type`, addressed to `port_name`, with
/// room for `num_data_bytes` of payload after the header.
pub(crate) fn new_internal_message(
    delegate: &dyn NodeDelegate,
    port_name: PortName,
    event_type: event::EventType,
    num_data_bytes: usize,
) -> Message {
    let mut message = delegate.alloc_message(event::control_header_size(num_data_bytes), 0, 0);
    event::EventHeader {
        port_name,
        event_type,
    }
    .write(&mut message);
    message
}
