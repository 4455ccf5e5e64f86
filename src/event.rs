//! Event wire layout.
//!
//! Every message routed through the fabric begins with an [`EventHeader`] in
//! its header region. User messages follow the header with a
//! [`UserEventData`] block and one [`PortDescriptor`] per transferred port;
//! control events carry a small fixed-size payload instead. All integers are
//! little-endian, names are raw 16-byte values.
//!
//! ```text
//! header region of a user message:
//! [ port_name:16 ][ type:4 ][ pad:4 ][ seq:8 ][ num_ports:4 ][ pad:4 ][ descriptor:88 ]...
//! ```

use crate::error::PortError;
use crate::message::Message;
use crate::name::{NodeName, PortName};

// ============================================================================
// Constants
// ============================================================================

/// Sequence number stamped on the first message of every fresh port.
pub const INITIAL_SEQUENCE_NUM: u64 = 1;

/// Sentinel for "no sequence number": a user message carries it until the
/// sending port stamps it.
pub const INVALID_SEQUENCE_NUM: u64 = 0;

/// Carried by an ObserveProxyAck to mean "re-send ObserveProxy": the
/// answering port was itself a proxy and cannot name a terminal sequence
/// number. Not zero, because zero is the truthful ack of a sender that has
/// never sent.
pub const RESEND_SEQUENCE_NUM: u64 = u64::MAX;

/// Size of the event header: port name + type + padding.
pub const EVENT_HEADER_SIZE: usize = 24;

/// Size of the user event data block: sequence number + port count + padding.
pub const USER_EVENT_DATA_SIZE: usize = 16;

/// Size of one port descriptor: four names + two sequence numbers + padding.
pub const PORT_DESCRIPTOR_SIZE: usize = 88;

/// Size of the ObserveProxy payload: four names.
pub const OBSERVE_PROXY_DATA_SIZE: usize = 64;

/// Size of the ObserveProxyAck and ObserveClosure payloads.
pub const LAST_SEQUENCE_NUM_DATA_SIZE: usize = 8;

const NAME_SIZE: usize = 16;

/// Header size of a user message carrying `num_ports` ports.
pub fn user_header_size(num_ports: usize) -> usize {
    EVENT_HEADER_SIZE + USER_EVENT_DATA_SIZE + num_ports * PORT_DESCRIPTOR_SIZE
}

/// Header size of a control message carrying `num_data_bytes` of payload.
pub fn control_header_size(num_data_bytes: usize) -> usize {
    EVENT_HEADER_SIZE + num_data_bytes
}

// ============================================================================
// Event types
// ============================================================================

/// Discriminant carried in every event header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EventType {
    /// A user message, possibly carrying transferred ports.
    User = 0,
    /// A transferred port exists at its destination; sent to the referring
    /// port so it can start proxying.
    PortAccepted = 1,
    /// A port announces it has become a proxy and asks to be bypassed.
    ObserveProxy = 2,
    /// The bypass happened; reports the highest sequence number the proxy
    /// will ever need to forward.
    ObserveProxyAck = 3,
    /// The peer closed; reports the last sequence number it sent.
    ObserveClosure = 4,
}

impl EventType {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(EventType::User),
            1 => Some(EventType::PortAccepted),
            2 => Some(EventType::ObserveProxy),
            3 => Some(EventType::ObserveProxyAck),
            4 => Some(EventType::ObserveClosure),
            _ => None,
        }
    }
}

// ============================================================================
// Event header
// ============================================================================

/// Routing fields at the front of every header region.
#[derive(Clone, Copy, Debug)]
pub struct EventHeader {
    /// Destination port at the receiving node.
    pub port_name: PortName,
    /// Event discriminant.
    pub event_type: EventType,
}

impl EventHeader {
    /// Parse the header region of a message.
    ///
    /// A truncated header is reported as `NotImplemented(u32::MAX)`, an
    /// unrecognized type as `NotImplemented(raw)`; both indicate a wire
    /// incompatibility.
    pub fn parse(message: &Message) -> Result<Self, PortError> {
        let header = message.header();
        if header.len() < EVENT_HEADER_SIZE {
            return Err(PortError::NotImplemented(u32::MAX));
        }
        let raw = read_u32(header, NAME_SIZE);
        let event_type = EventType::from_u32(raw).ok_or(PortError::NotImplemented(raw))?;
        Ok(Self {
            port_name: read_name(header, 0),
            event_type,
        })
    }

    /// Write this header into a message. Padding bytes stay zero.
    pub fn write(&self, message: &mut Message) {
        let header = message.header_mut();
        write_name(header, 0, self.port_name.as_bytes());
        write_u32(header, NAME_SIZE, self.event_type as u32);
    }
}

/// Rewrite only the destination port of an already-written header.
pub fn set_header_port_name(message: &mut Message, port_name: PortName) {
    write_name(message.header_mut(), 0, port_name.as_bytes());
}

// ============================================================================
// User event data
// ============================================================================

/// Block following the header of a `User` event.
#[derive(Clone, Copy, Debug)]
pub struct UserEventData {
    /// Position of this message on its pipe; `INVALID_SEQUENCE_NUM` until
    /// the sending port stamps it.
    pub sequence_num: u64,
    /// Number of port descriptors following this block.
    pub num_ports: u32,
}

impl UserEventData {
    /// Parse and validate the user block of a message.
    ///
    /// Checks that the header region holds the descriptors it claims and
    /// that the descriptor count matches the message's port-name region.
    pub fn parse(message: &Message) -> Result<Self, PortError> {
        let header = message.header();
        if header.len() < EVENT_HEADER_SIZE + USER_EVENT_DATA_SIZE {
            return Err(PortError::NotImplemented(EventType::User as u32));
        }
        let num_ports = read_u32(header, EVENT_HEADER_SIZE + 8);
        if header.len() < user_header_size(num_ports as usize)
            || num_ports as usize != message.num_ports()
        {
            return Err(PortError::NotImplemented(EventType::User as u32));
        }
        Ok(Self {
            sequence_num: read_u64(header, EVENT_HEADER_SIZE),
            num_ports,
        })
    }

    /// Write this block into a message.
    pub fn write(&self, message: &mut Message) {
        let header = message.header_mut();
        write_u64(header, EVENT_HEADER_SIZE, self.sequence_num);
        write_u32(header, EVENT_HEADER_SIZE + 8, self.num_ports);
    }
}

/// Read the sequence number of a validated user message.
pub fn user_sequence_num(message: &Message) -> u64 {
    read_u64(message.header(), EVENT_HEADER_SIZE)
}

/// Stamp the sequence number of a validated user message.
pub fn set_user_sequence_num(message: &mut Message, sequence_num: u64) {
    write_u64(message.header_mut(), EVENT_HEADER_SIZE, sequence_num);
}

// ============================================================================
// Port descriptors
// ============================================================================

/// Everything the destination needs to reconstruct a transferred port.
#[derive(Clone, Copy, Debug)]
pub struct PortDescriptor {
    /// The transferred port's current peer.
    pub peer_node: NodeName,
    pub peer_port: PortName,
    /// The port whose send carried this descriptor; target of PortAccepted.
    pub referring_node: NodeName,
    pub referring_port: PortName,
    /// Sequence counters the new record starts from.
    pub next_sequence_num_to_send: u64,
    pub next_sequence_num_to_receive: u64,
}

impl PortDescriptor {
    /// Parse descriptor `index` of a validated user message.
    pub fn parse(message: &Message, index: usize) -> Self {
        let header = message.header();
        let at = descriptor_offset(index);
        Self {
            peer_node: NodeName::from_bytes(read_name_bytes(header, at)),
            peer_port: read_name(header, at + NAME_SIZE),
            referring_node: NodeName::from_bytes(read_name_bytes(header, at + 2 * NAME_SIZE)),
            referring_port: read_name(header, at + 3 * NAME_SIZE),
            next_sequence_num_to_send: read_u64(header, at + 4 * NAME_SIZE),
            next_sequence_num_to_receive: read_u64(header, at + 4 * NAME_SIZE + 8),
        }
    }

    /// Write descriptor `index` of a user message. Padding stays zero.
    pub fn write(&self, message: &mut Message, index: usize) {
        let header = message.header_mut();
        let at = descriptor_offset(index);
        write_name(header, at, self.peer_node.as_bytes());
        write_name(header, at + NAME_SIZE, self.peer_port.as_bytes());
        write_name(header, at + 2 * NAME_SIZE, self.referring_node.as_bytes());
        write_name(header, at + 3 * NAME_SIZE, self.referring_port.as_bytes());
        write_u64(header, at + 4 * NAME_SIZE, self.next_sequence_num_to_send);
        write_u64(header, at + 4 * NAME_SIZE + 8, self.next_sequence_num_to_receive);
    }
}

fn descriptor_offset(index: usize) -> usize {
    EVENT_HEADER_SIZE + USER_EVENT_DATA_SIZE + index * PORT_DESCRIPTOR_SIZE
}

// ============================================================================
// Control event payloads
// ============================================================================

/// Payload of an ObserveProxy event: the proxy's identity and where it
/// forwards to.
#[derive(Clone, Copy, Debug)]
pub struct ObserveProxyData {
    pub proxy_node: NodeName,
    pub proxy_port: PortName,
    pub proxy_to_node: NodeName,
    pub proxy_to_port: PortName,
}

impl ObserveProxyData {
    /// Parse the payload of an ObserveProxy message.
    pub fn parse(message: &Message) -> Result<Self, PortError> {
        let header = message.header();
        if header.len() < EVENT_HEADER_SIZE + OBSERVE_PROXY_DATA_SIZE {
            return Err(PortError::NotImplemented(EventType::ObserveProxy as u32));
        }
        let at = EVENT_HEADER_SIZE;
        Ok(Self {
            proxy_node: NodeName::from_bytes(read_name_bytes(header, at)),
            proxy_port: read_name(header, at + NAME_SIZE),
            proxy_to_node: NodeName::from_bytes(read_name_bytes(header, at + 2 * NAME_SIZE)),
            proxy_to_port: read_name(header, at + 3 * NAME_SIZE),
        })
    }

    /// Write the payload of an ObserveProxy message.
    pub fn write(&self, message: &mut Message) {
        let header = message.header_mut();
        let at = EVENT_HEADER_SIZE;
        write_name(header, at, self.proxy_node.as_bytes());
        write_name(header, at + NAME_SIZE, self.proxy_port.as_bytes());
        write_name(header, at + 2 * NAME_SIZE, self.proxy_to_node.as_bytes());
        write_name(header, at + 3 * NAME_SIZE, self.proxy_to_port.as_bytes());
    }
}

/// Parse the `last_sequence_num` payload of an ObserveProxyAck or
/// ObserveClosure message.
pub fn parse_last_sequence_num(message: &Message) -> Result<u64, PortError> {
    let header = message.header();
    if header.len() < EVENT_HEADER_SIZE + LAST_SEQUENCE_NUM_DATA_SIZE {
        return Err(PortError::NotImplemented(EventType::ObserveProxyAck as u32));
    }
    Ok(read_u64(header, EVENT_HEADER_SIZE))
}

/// Write the `last_sequence_num` payload of an ObserveProxyAck or
/// ObserveClosure message.
pub fn write_last_sequence_num(message: &mut Message, last_sequence_num: u64) {
    write_u64(message.header_mut(), EVENT_HEADER_SIZE, last_sequence_num);
}

// ============================================================================
// Field access
// ============================================================================

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_name_bytes(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[at..at + 16]);
    buf
}

fn read_name(bytes: &[u8], at: usize) -> PortName {
    PortName::from_bytes(read_name_bytes(bytes, at))
}

fn write_name(bytes: &mut [u8], at: usize, name: &[u8; 16]) {
    bytes[at..at + 16].copy_from_slice(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut message = Message::new(user_header_size(0), 0, 0);
        EventHeader {
            port_name: PortName::from_bytes([7; 16]),
            event_type: EventType::User,
        }
        .write(&mut message);

        let header = EventHeader::parse(&message).unwrap();
        assert_eq!(header.port_name, PortName::from_bytes([7; 16]));
        assert_eq!(header.event_type, EventType::User);
    }

    #[test]
    fn header_layout_is_fixed() {
        let mut message = Message::new(control_header_size(LAST_SEQUENCE_NUM_DATA_SIZE), 0, 0);
        EventHeader {
            port_name: PortName::from_bytes([0xaa; 16]),
            event_type: EventType::ObserveClosure,
        }
        .write(&mut message);
        write_last_sequence_num(&mut message, 0x0102_0304_0506_0708);

        let header = message.header();
        assert_eq!(&header[..16], &[0xaa; 16]);
        assert_eq!(&header[16..20], &4u32.to_le_bytes());
        assert_eq!(&header[20..24], &[0; 4]);
        assert_eq!(&header[24..32], &0x0102_0304_0506_0708u64.to_le_bytes());
    }

    #[test]
    fn unknown_event_type_is_not_implemented() {
        let mut message = Message::new(EVENT_HEADER_SIZE, 0, 0);
        message.header_mut()[16..20].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            EventHeader::parse(&message).err(),
            Some(PortError::NotImplemented(9))
        );
    }

    #[test]
    fn descriptor_round_trip() {
        let mut message = Message::new(user_header_size(2), 0, 32);
        let descriptor = PortDescriptor {
            peer_node: NodeName::from_bytes([1; 16]),
            peer_port: PortName::from_bytes([2; 16]),
            referring_node: NodeName::from_bytes([3; 16]),
            referring_port: PortName::from_bytes([4; 16]),
            next_sequence_num_to_send: 17,
            next_sequence_num_to_receive: 5,
        };
        descriptor.write(&mut message, 1);

        let parsed = PortDescriptor::parse(&message, 1);
        assert_eq!(parsed.peer_node, descriptor.peer_node);
        assert_eq!(parsed.peer_port, descriptor.peer_port);
        assert_eq!(parsed.referring_node, descriptor.referring_node);
        assert_eq!(parsed.referring_port, descriptor.referring_port);
        assert_eq!(parsed.next_sequence_num_to_send, 17);
        assert_eq!(parsed.next_sequence_num_to_receive, 5);
    }

    #[test]
    fn user_data_validates_port_count() {
        // Claims two ports in the header but carries storage for one.
        let mut message = Message::new(user_header_size(2), 0, 16);
        EventHeader {
            port_name: PortName::INVALID,
            event_type: EventType::User,
        }
        .write(&mut message);
        UserEventData {
            sequence_num: 1,
            num_ports: 2,
        }
        .write(&mut message);

        assert!(UserEventData::parse(&message).is_err());
    }

    #[test]
    fn observe_proxy_round_trip() {
        let mut message = Message::new(control_header_size(OBSERVE_PROXY_DATA_SIZE), 0, 0);
        let data = ObserveProxyData {
            proxy_node: NodeName::from_bytes([1; 16]),
            proxy_port: PortName::from_bytes([2; 16]),
            proxy_to_node: NodeName::from_bytes([3; 16]),
            proxy_to_port: PortName::from_bytes([4; 16]),
        };
        data.write(&mut message);

        let parsed = ObserveProxyData::parse(&message).unwrap();
        assert_eq!(parsed.proxy_node, data.proxy_node);
        assert_eq!(parsed.proxy_port, data.proxy_port);
        assert_eq!(parsed.proxy_to_node, data.proxy_to_node);
        assert_eq!(parsed.proxy_to_port, data.proxy_to_port);
    }
}
