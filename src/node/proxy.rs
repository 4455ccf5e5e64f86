//! The distributed proxy-removal protocol.
//!
//! A transferred port leaves behind a Proxying record that forwards traffic
//! to the new location. The proxy announces itself (`ObserveProxy`) so the
//! port feeding it rewires to the new location and reports the highest
//! sequence number the proxy will ever see (`ObserveProxyAck`). Once the
//! proxy's queue has advanced past that number, every in-flight message has
//! been forwarded and the record erases itself. A closed peer short-cuts
//! the dance: its `ObserveClosure` carries the terminal sequence number
//! instead.

use tracing::debug;

use crate::delegate::new_internal_message;
use crate::error::PortError;
use crate::event::{
    self, EventType, LAST_SEQUENCE_NUM_DATA_SIZE, OBSERVE_PROXY_DATA_SIZE, RESEND_SEQUENCE_NUM,
};
use crate::name::PortName;
use crate::port::{PortInner, PortRef, PortState};

use super::Node;

impl Node {
    /// The transferred port exists at its destination: switch from
    /// Buffering to Proxying, push the parked messages along, and start
    /// working toward removal.
    pub(in crate::node) fn on_port_accepted(&self, port_name: PortName) -> Result<(), PortError> {
        let port = self.lookup(port_name).ok_or(PortError::PortUnknown)?;
        let mut inner = port.inner.lock().unwrap();

        debug!(
            port = ?port_name,
            node = ?self.name,
            to = ?inner.peer_port,
            to_node = ?inner.peer_node,
            "port accepted"
        );

        if inner.state != PortState::Buffering {
            return Err(PortError::PortStateUnexpected);
        }
        inner.state = PortState::Proxying;

        self.forward_messages_locked(&mut inner, port_name)?;

        // Closure may have been observed while buffering; the terminal
        // sequence number is then already known and no ObserveProxy is
        // needed. The closure notice could not follow the destination port
        // before it existed, so it travels on now.
        if inner.remove_proxy_on_last_message {
            let mut forwarded = new_internal_message(
                &*self.delegate,
                inner.peer_port,
                EventType::ObserveClosure,
                LAST_SEQUENCE_NUM_DATA_SIZE,
            );
            event::write_last_sequence_num(&mut forwarded, inner.last_sequence_num_to_receive);
            self.delegate.forward_message(inner.peer_node, forwarded);

            self.maybe_remove_proxy_locked(&mut inner, port_name);
        } else {
            self.initiate_proxy_removal_locked(&inner, port_name);
        }
        Ok(())
    }

    /// A proxy somewhere on this port's pipe asks to be bypassed.
    pub(in crate::node) fn on_observe_proxy(
        &self,
        port_name: PortName,
        data: event::ObserveProxyData,
    ) -> Result<(), PortError> {
        // The port may have been closed locally already; the closure path
        // carries the terminal sequence number instead, so this event can
        // be ignored.
        let Some(port) = self.lookup(port_name) else {
            debug!(port = ?port_name, node = ?self.name, "ObserveProxy for unknown port");
            return Ok(());
        };

        debug!(
            port = ?port_name,
            node = ?self.name,
            proxy = ?data.proxy_port,
            proxy_node = ?data.proxy_node,
            proxy_to = ?data.proxy_to_port,
            proxy_to_node = ?data.proxy_to_node,
            "observing proxy"
        );

        let mut inner = port.inner.lock().unwrap();

        if inner.peer_node == data.proxy_node && inner.peer_port == data.proxy_port {
            if inner.state == PortState::Receiving {
                // Bypass the proxy and tell it the highest sequence number
                // it will ever need to forward.
                inner.peer_node = data.proxy_to_node;
                inner.peer_port = data.proxy_to_port;

                let mut ack = new_internal_message(
                    &*self.delegate,
                    data.proxy_port,
                    EventType::ObserveProxyAck,
                    LAST_SEQUENCE_NUM_DATA_SIZE,
                );
                event::write_last_sequence_num(&mut ack, inner.next_sequence_num_to_send - 1);
                self.delegate.forward_message(data.proxy_node, ack);
            } else {
                // As a proxy ourselves we cannot name a terminal sequence
                // number: other ports may still be routed to our peer now
                // that our own ObserveProxy is out. Defer an invalid ack
                // ("ask again") until this record itself dissolves;
                // answering immediately would bounce the event straight
                // back and spin.
                debug!(
                    proxy = ?data.proxy_port,
                    proxy_node = ?data.proxy_node,
                    "delaying ObserveProxyAck until own removal"
                );

                let mut ack = new_internal_message(
                    &*self.delegate,
                    data.proxy_port,
                    EventType::ObserveProxyAck,
                    LAST_SEQUENCE_NUM_DATA_SIZE,
                );
                event::write_last_sequence_num(&mut ack, RESEND_SEQUENCE_NUM);
                inner.send_on_proxy_removal = Some((data.proxy_node, ack));
            }
        } else {
            // Not our direct peer; pass the event along the chain until it
            // reaches the port that refers to the proxy.
            let mut forwarded = new_internal_message(
                &*self.delegate,
                inner.peer_port,
                EventType::ObserveProxy,
                OBSERVE_PROXY_DATA_SIZE,
            );
            data.write(&mut forwarded);
            self.delegate.forward_message(inner.peer_node, forwarded);
        }
        Ok(())
    }

    /// The bypass happened; `last_sequence_num` is the highest number this
    /// proxy will ever see, or the invalid sentinel meaning "ask again".
    pub(in crate::node) fn on_observe_proxy_ack(
        &self,
        port_name: PortName,
        last_sequence_num: u64,
    ) -> Result<(), PortError> {
        debug!(
            port = ?port_name,
            node = ?self.name,
            last_sequence_num,
            "observing proxy ack"
        );

        // The port may have observed closure first and already left.
        let port = self.lookup(port_name).ok_or(PortError::PortUnknown)?;
        let mut inner = port.inner.lock().unwrap();

        if inner.state != PortState::Proxying {
            return Err(PortError::PortStateUnexpected);
        }

        if last_sequence_num == RESEND_SEQUENCE_NUM {
            // The observer was itself a proxy at the time; ask again.
            self.initiate_proxy_removal_locked(&inner, port_name);
            return Ok(());
        }

        inner.remove_proxy_on_last_message = true;
        inner.last_sequence_num_to_receive = last_sequence_num;

        self.maybe_remove_proxy_locked(&mut inner, port_name);
        Ok(())
    }

    /// The peer end of this port's pipe closed after sending
    /// `last_sequence_num` messages in total.
    pub(in crate::node) fn on_observe_closure(
        &self,
        port_name: PortName,
        last_sequence_num: u64,
    ) -> Result<(), PortError> {
        // Fine if the port is already gone; it may have been closed locally.
        let Some(port) = self.lookup(port_name) else {
            return Ok(());
        };

        // The port should not expect messages beyond last_sequence_num.
        // For a proxy chain the notice is forwarded hop by hop and doubles
        // as the ObserveProxyAck the closed peer can no longer send.
        let mut notify = false;
        {
            let mut inner = port.inner.lock().unwrap();

            inner.peer_closed = true;
            inner.last_sequence_num_to_receive = last_sequence_num;

            debug!(
                port = ?port_name,
                node = ?self.name,
                state = ?inner.state,
                last_sequence_num,
                "observing closure"
            );

            if inner.state == PortState::Receiving {
                notify = true;
            } else {
                let next_node = inner.peer_node;
                let next_port = inner.peer_port;

                inner.remove_proxy_on_last_message = true;

                if inner.state == PortState::Proxying {
                    self.maybe_remove_proxy_locked(&mut inner, port_name);

                    let mut forwarded = new_internal_message(
                        &*self.delegate,
                        next_port,
                        EventType::ObserveClosure,
                        LAST_SEQUENCE_NUM_DATA_SIZE,
                    );
                    event::write_last_sequence_num(&mut forwarded, last_sequence_num);
                    self.delegate.forward_message(next_node, forwarded);
                }
            }
        }

        if notify {
            self.delegate.port_status_changed(&PortRef::new(port_name, port));
        }
        Ok(())
    }

    /// Drain the queue of a proxy in sequence order, re-stamping nothing:
    /// forwarded messages keep their numbers. Called with the port's lock
    /// held.
    pub(in crate::node) fn forward_messages_locked(
        &self,
        port: &mut PortInner,
        port_name: PortName,
    ) -> Result<(), PortError> {
        while let Some(mut message) = port.message_queue.next_message_if(None) {
            self.will_send_message_locked(port, port_name, &mut message, None)?;
            self.delegate.forward_message(port.peer_node, message);
        }
        Ok(())
    }

    /// Announce this proxy to the graph so the port feeding it can bypass
    /// it. An ObserveProxyAck (or an ObserveClosure, if the peer went away
    /// meanwhile) comes back eventually. Called with the port's lock held.
    pub(in crate::node) fn initiate_proxy_removal_locked(
        &self,
        port: &PortInner,
        port_name: PortName,
    ) {
        let mut message = new_internal_message(
            &*self.delegate,
            port.peer_port,
            EventType::ObserveProxy,
            OBSERVE_PROXY_DATA_SIZE,
        );
        event::ObserveProxyData {
            proxy_node: self.name,
            proxy_port: port_name,
            proxy_to_node: port.peer_node,
            proxy_to_port: port.peer_port,
        }
        .write(&mut message);

        self.delegate.forward_message(port.peer_node, message);
    }

    /// Erase this proxy if its terminal sequence number is known and the
    /// queue has advanced past it, firing any deferred message. Called with
    /// the port's lock held.
    pub(in crate::node) fn maybe_remove_proxy_locked(
        &self,
        port: &mut PortInner,
        port_name: PortName,
    ) {
        debug_assert_eq!(port.state, PortState::Proxying);

        // The ObserveProxyAck (or closure notice) must arrive first.
        if !port.remove_proxy_on_last_message {
            return;
        }

        if !port.can_accept_more_messages() {
            // Everything this proxy will ever see has been forwarded.
            debug!(port = ?port_name, node = ?self.name, "removing proxy");
            self.erase_port(port_name);

            if let Some((to_node, message)) = port.send_on_proxy_removal.take() {
                self.delegate.forward_message(to_node, message);
            }
        } else {
            debug!(
                port = ?port_name,
                node = ?self.name,
                next = port.message_queue.next_sequence_num(),
                last = port.last_sequence_num_to_receive,
                "proxy waiting for remaining messages"
            );
        }
    }
}
