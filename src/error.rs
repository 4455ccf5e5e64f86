//! Error taxonomy shared by every node operation.

use thiserror::Error;

/// Errors returned by [`Node`](crate::Node) operations.
///
/// All variants are recoverable: a failed operation never unwinds internal
/// state beyond what its documentation says (a failed multi-port send rolls
/// the sequence counter back, nothing else moves).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PortError {
    /// Lookup failed: stale reference, or the port was transferred away
    /// and erased.
    #[error("port unknown")]
    PortUnknown,

    /// Name collision on insertion. Indicates a defective name generator.
    #[error("port already exists")]
    PortExists,

    /// Operation attempted against a port in the wrong lifecycle state.
    #[error("port state unexpected")]
    PortStateUnexpected,

    /// The message contains the sending port itself.
    #[error("message cannot carry the port it is sent from")]
    CannotSendSelf,

    /// The peer has closed; no more messages can be sent or read.
    #[error("peer port is closed")]
    PeerClosed,

    /// The message contains the sending port's peer.
    #[error("message cannot carry the sending port's peer")]
    CannotSendPeer,

    /// Unrecognized event type on the wire.
    #[error("unrecognized event type: {0}")]
    NotImplemented(u32),
}
