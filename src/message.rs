//! The opaque message carrier.
//!
//! A message is one contiguous buffer split into three regions:
//!
//! ```text
//! [ header ][ payload ][ port names ]
//! ```
//!
//! The header region holds routing fields written by the node (see
//! [`event`](crate::event) for the bit-exact layout). The payload region
//! belongs to the user. The port-name region lists the current names of the
//! ports being transferred inside the message, one 16-byte name per port.
//!
//! Region sizes are fixed at allocation. Ownership is linear: a message
//! handed to `send_message` travels through the fabric and into the
//! receiving port's queue, and ownership passes back to the caller on a
//! successful `get_message`.

use crate::name::PortName;

/// Bytes occupied by one port name in the port-name region.
pub const PORT_NAME_SIZE: usize = 16;

/// An owned message buffer with header, payload, and port-name regions.
pub struct Message {
    data: Vec<u8>,
    num_header_bytes: usize,
    num_payload_bytes: usize,
    num_ports_bytes: usize,
}

impl Message {
    /// Allocate a zeroed message with the given region sizes.
    pub fn new(num_header_bytes: usize, num_payload_bytes: usize, num_ports_bytes: usize) -> Self {
        Self {
            data: vec![0u8; num_header_bytes + num_payload_bytes + num_ports_bytes],
            num_header_bytes,
            num_payload_bytes,
            num_ports_bytes,
        }
    }

    /// Size of the header region in bytes.
    pub fn num_header_bytes(&self) -> usize {
        self.num_header_bytes
    }

    /// Size of the payload region in bytes.
    pub fn num_payload_bytes(&self) -> usize {
        self.num_payload_bytes
    }

    /// Size of the port-name region in bytes.
    pub fn num_ports_bytes(&self) -> usize {
        self.num_ports_bytes
    }

    /// Number of ports transferred inside this message.
    pub fn num_ports(&self) -> usize {
        self.num_ports_bytes / PORT_NAME_SIZE
    }

    /// The header region.
    pub fn header(&self) -> &[u8] {
        &self.data[..self.num_header_bytes]
    }

    /// The header region, mutable.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.num_header_bytes]
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.num_header_bytes..self.num_header_bytes + self.num_payload_bytes]
    }

    /// The payload region, mutable.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.num_header_bytes;
        &mut self.data[start..start + self.num_payload_bytes]
    }

    /// Name of the `index`-th transferred port.
    ///
    /// Panics if `index >= num_ports()`.
    pub fn port(&self, index: usize) -> PortName {
        let start = self.port_offset(index);
        let mut bytes = [0u8; PORT_NAME_SIZE];
        bytes.copy_from_slice(&self.data[start..start + PORT_NAME_SIZE]);
        PortName::from_bytes(bytes)
    }

    /// Write the name of the `index`-th transferred port.
    ///
    /// Panics if `index >= num_ports()`.
    pub fn set_port(&mut self, index: usize, name: PortName) {
        let start = self.port_offset(index);
        self.data[start..start + PORT_NAME_SIZE].copy_from_slice(name.as_bytes());
    }

    fn port_offset(&self, index: usize) -> usize {
        assert!(index < self.num_ports(), "port index out of range");
        self.num_header_bytes + self.num_payload_bytes + index * PORT_NAME_SIZE
    }
}
