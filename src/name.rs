//! Opaque 128-bit identifiers for nodes and ports.
//!
//! Names carry no structure: equality, hashing, and an all-zero "invalid"
//! sentinel are the only operations the fabric relies on. Fresh port names
//! are produced by the embedder through [`NodeDelegate`], which must make
//! them globally unique; 128 random bits make collisions negligible.
//!
//! [`NodeDelegate`]: crate::NodeDelegate

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a participant in the fabric.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeName([u8; 16]);

/// Identifier of an endpoint hosted on a node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortName([u8; 16]);

macro_rules! name_impl {
    ($name:ident) => {
        impl $name {
            /// The all-zero sentinel. Never names a live entity.
            pub const INVALID: $name = $name([0u8; 16]);

            /// Create a name from a 16-byte array.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// Generate a fresh random name.
            pub fn random() -> Self {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Return the raw bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            /// Whether this name is anything other than the invalid sentinel.
            pub fn is_valid(&self) -> bool {
                *self != Self::INVALID
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex_encode(&self.0[..8]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex_encode(&self.0))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

name_impl!(NodeName);
name_impl!(PortName);

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
