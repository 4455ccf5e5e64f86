//! portmesh: a capability-style port routing fabric.
//!
//! Nodes host named ports; a pair of ports forms a bidirectional pipe that
//! delivers messages strictly in order. A port travels to another node by
//! being embedded in a message. The record left behind becomes a proxy that
//! forwards in-flight traffic, and a distributed removal protocol collapses
//! the proxy once the fabric can prove every message it will ever see has
//! been forwarded. A user holding either end of a pipe never observes loss,
//! duplication, or reordering, and never learns the peer moved.
//!
//! The crate is the routing core only: the inter-node byte channel, process
//! bootstrap, and the public handle API live in the embedder, which plugs in
//! through [`NodeDelegate`].

pub mod delegate;
pub mod error;
pub mod event;
pub mod message;
pub mod name;
pub mod node;
pub mod port;
pub mod queue;

// Re-export name types
pub use name::{NodeName, PortName};

// Re-export error types
pub use error::PortError;

// Re-export message and event types
pub use event::{EventType, INITIAL_SEQUENCE_NUM, INVALID_SEQUENCE_NUM, RESEND_SEQUENCE_NUM};
pub use message::Message;

// Re-export queue types
pub use queue::MessageQueue;

// Re-export port types
pub use port::{PortRef, UserData};

// Re-export node types
pub use node::{Node, PortStatus};

// Re-export the delegate seam
pub use delegate::NodeDelegate;
