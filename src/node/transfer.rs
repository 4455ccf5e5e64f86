//! Port transfer: taking ports out of a message on the way out, and binding
//! them to the node on the way in.

use std::sync::{Arc, MutexGuard};

use tracing::{debug, warn};

use crate::delegate::new_internal_message;
use crate::error::PortError;
use crate::event::{self, EventType, INVALID_SEQUENCE_NUM};
use crate::message::Message;
use crate::name::{NodeName, PortName};
use crate::port::{Port, PortInner, PortRef, PortState};

use super::Node;

impl Node {
    /// Stamp a message and take its embedded ports, rewriting its header
    /// destination to the sending port's peer. Called with the sending
    /// port's lock held.
    ///
    /// On error nothing is transferred and the sequence counter is rolled
    /// back if this call stamped it.
    pub(in crate::node) fn will_send_message_locked(
        &self,
        port: &mut PortInner,
        port_name: PortName,
        message: &mut Message,
        ports_taken: Option<&mut Vec<Arc<Port>>>,
    ) -> Result<(), PortError> {
        // A proxy re-forwards messages that already carry a sequence
        // number; only a fresh send takes the next one.
        let stamped_here = event::user_sequence_num(message) == INVALID_SEQUENCE_NUM;
        if stamped_here {
            event::set_user_sequence_num(message, port.next_sequence_num_to_send);
            port.next_sequence_num_to_send += 1;
        }

        if message.num_ports() > 0 {
            if let Err(error) = self.take_message_ports_locked(port, message, ports_taken) {
                if stamped_here {
                    port.next_sequence_num_to_send -= 1;
                }
                return Err(error);
            }
        }

        debug!(
            seq = event::user_sequence_num(message),
            from = ?port_name,
            node = ?self.name,
            to = ?port.peer_port,
            to_node = ?port.peer_node,
            "sending message"
        );

        event::set_header_port_name(message, port.peer_port);
        Ok(())
    }

    /// Lock, verify, and rename every port embedded in `message`.
    ///
    /// Another thread could be trying to send an overlapping set of ports;
    /// the batch lock makes the intra-batch lock order irrelevant and
    /// guarantees the ports are ours before any state moves.
    fn take_message_ports_locked(
        &self,
        port: &PortInner,
        message: &mut Message,
        ports_taken: Option<&mut Vec<Arc<Port>>>,
    ) -> Result<(), PortError> {
        let num_ports = message.num_ports();

        let mut ports: Vec<Arc<Port>> = Vec::with_capacity(num_ports);
        let mut guards: Vec<MutexGuard<'_, PortInner>> = Vec::with_capacity(num_ports);

        {
            let _batch = self.send_with_ports.lock().unwrap();

            for i in 0..num_ports {
                ports.push(
                    self.lookup(message.port(i))
                        .ok_or(PortError::PortUnknown)?,
                );
            }

            for (i, taken) in ports.iter().enumerate() {
                let guard = taken.inner.lock().unwrap();
                if guard.state != PortState::Receiving {
                    return Err(PortError::PortStateUnexpected);
                }
                if message.port(i) == port.peer_port {
                    return Err(PortError::CannotSendPeer);
                }
                guards.push(guard);
            }
        }

        // Every embedded port is locked and Receiving; hand each one off.
        for (i, guard) in guards.iter_mut().enumerate() {
            let local_name = message.port(i);
            let (new_name, descriptor) =
                self.will_send_port_locked(&mut *guard, local_name, port.peer_node);
            descriptor.write(message, i);
            message.set_port(i, new_name);
        }

        drop(guards);

        if let Some(ports_taken) = ports_taken {
            *ports_taken = ports;
        }
        Ok(())
    }

    /// Rewrite one embedded port for travel: fresh name, descriptor of its
    /// old identity, and a local record left Buffering toward the new
    /// location. Called with the embedded port's lock held.
    fn will_send_port_locked(
        &self,
        port: &mut PortInner,
        local_name: PortName,
        to_node: NodeName,
    ) -> (PortName, event::PortDescriptor) {
        let new_name = self.delegate.generate_random_port_name();

        debug_assert_eq!(port.state, PortState::Receiving);
        // Nothing may reach the new peer until it is known to exist.
        port.state = PortState::Buffering;

        let descriptor = event::PortDescriptor {
            peer_node: port.peer_node,
            peer_port: port.peer_port,
            referring_node: self.name,
            referring_port: local_name,
            next_sequence_num_to_send: port.next_sequence_num_to_send,
            next_sequence_num_to_receive: port.message_queue.next_sequence_num(),
        };

        port.peer_node = to_node;
        port.peer_port = new_name;

        (new_name, descriptor)
    }

    /// Flush messages parked on a just-initialized port, and point the
    /// ports they took at the now-known destination. Called with the
    /// port's lock held.
    pub(in crate::node) fn flush_outgoing_messages_locked(&self, port: &mut PortInner) {
        debug_assert!(port.peer_node.is_valid());

        let outgoing_ports = std::mem::take(&mut port.outgoing_ports);
        for outgoing_port in outgoing_ports {
            outgoing_port.inner.lock().unwrap().peer_node = port.peer_node;
        }

        while let Some(mut message) = port.outgoing_messages.pop_front() {
            event::set_header_port_name(&mut message, port.peer_port);
            self.delegate.forward_message(port.peer_node, message);
        }
    }

    /// Bind a transferred port to this node and tell the referring port it
    /// may start proxying.
    fn accept_port(
        &self,
        port_name: PortName,
        descriptor: &event::PortDescriptor,
    ) -> Result<(), PortError> {
        let port = Port::new(
            PortState::Receiving,
            descriptor.next_sequence_num_to_send,
            descriptor.next_sequence_num_to_receive,
        );
        {
            let mut inner = port.inner.lock().unwrap();
            inner.peer_node = descriptor.peer_node;
            inner.peer_port = descriptor.peer_port;
            // Not signalable until the carrier message reaches the user.
            inner.message_queue.set_signalable(false);
        }

        self.add_port_with_name(port_name, port)?;

        self.delegate.forward_message(
            descriptor.referring_node,
            new_internal_message(
                &*self.delegate,
                descriptor.referring_port,
                EventType::PortAccepted,
                0,
            ),
        );
        Ok(())
    }

    /// Handle an arriving user message: bind its transferred ports, queue
    /// it, and if the target is a proxy, push it along.
    pub(in crate::node) fn on_user_message(
        &self,
        port_name: PortName,
        message: Message,
    ) -> Result<(), PortError> {
        let user = event::UserEventData::parse(&message)?;
        debug!(
            seq = user.sequence_num,
            port = ?port_name,
            node = ?self.name,
            num_ports = user.num_ports,
            "accepting user message"
        );

        let port = self.lookup(port_name);

        // Bind the transferred ports even when the target port is missing,
        // buffering, or proxying: a forwarded message re-takes them the
        // usual way, and an unacceptable carrier gets them closed below.
        let transferred: Vec<PortName> = (0..message.num_ports()).map(|i| message.port(i)).collect();
        for (i, name) in transferred.iter().enumerate() {
            let descriptor = event::PortDescriptor::parse(&message, i);
            self.accept_port(*name, &descriptor)?;
        }

        let mut has_next_message = false;
        let mut message_accepted = false;

        if let Some(port) = &port {
            let mut inner = port.inner.lock().unwrap();

            // Drop spurious traffic past the known end of the pipe.
            if inner.can_accept_more_messages() {
                message_accepted = true;
                has_next_message = inner.message_queue.accept_message(message);

                match inner.state {
                    PortState::Buffering => has_next_message = false,
                    PortState::Proxying => {
                        has_next_message = false;

                        // Forward in sequence order so the queue's cursor
                        // tracks what this proxy has seen; removal depends
                        // on knowing it has seen everything.
                        self.forward_messages_locked(&mut inner, port_name)?;
                        self.maybe_remove_proxy_locked(&mut inner, port_name);
                    }
                    _ => {}
                }
            }
        }

        if !message_accepted {
            debug!(port = ?port_name, node = ?self.name, "user message not accepted");
            // The ports bound above are orphaned; close them so their peers
            // find out and the fabric collects them.
            for name in transferred {
                match self.get_port(name) {
                    Ok(port_ref) => {
                        let _ = self.close_port(&port_ref);
                    }
                    Err(_) => {
                        warn!(port = ?name, node = ?self.name, "cannot close missing port")
                    }
                }
            }
        } else if has_next_message {
            if let Some(port) = port {
                self.delegate
                    .port_status_changed(&PortRef::new(port_name, port));
            }
        }

        Ok(())
    }
}
