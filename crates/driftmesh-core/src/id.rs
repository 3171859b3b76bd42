//! Fixed-size 32-byte identifiers.
//!
//! Peers, clusters, subclusters and packets are all named by 32 bytes. On
//! the wire they travel raw; in configuration and persisted state they are
//! 64 lowercase hex characters.

use crate::error::IdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of every identifier in bytes
pub const ID_SIZE: usize = 32;

/// Length of every identifier in hex characters
pub const ID_HEX_LEN: usize = ID_SIZE * 2;

fn parse_hex_id(encoded: &str) -> Result<[u8; ID_SIZE], IdError> {
    if encoded.len() != ID_HEX_LEN {
        return Err(IdError::InvalidLength {
            expected: ID_HEX_LEN,
            actual: encoded.len(),
        });
    }
    if let Some(c) = encoded.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(IdError::InvalidCharacter(c));
    }

    let mut bytes = [0u8; ID_SIZE];
    hex::decode_to_slice(encoded, &mut bytes).map_err(|_| IdError::InvalidLength {
        expected: ID_HEX_LEN,
        actual: encoded.len(),
    })?;
    Ok(bytes)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; ID_SIZE]);

        impl $name {
            /// Wrap raw bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            /// Raw bytes
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            /// Lowercase hex encoding (64 characters)
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from exactly 64 hex characters.
            ///
            /// # Errors
            ///
            /// Returns [`IdError`] for the wrong length or a non-hex character.
            pub fn from_hex(encoded: &str) -> Result<Self, IdError> {
                parse_hex_id(encoded).map(Self)
            }

            /// First eight hex characters, for log lines
            #[must_use]
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.short())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl From<[u8; ID_SIZE]> for $name {
            fn from(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }
        }
    };
}

define_id!(
    /// Peer identifier: the node's Ed25519 public key
    PeerId
);

define_id!(
    /// Cluster identifier: the shared namespace every packet carries
    ClusterId
);

define_id!(
    /// Subcluster identifier: the public key derived from the subcluster secret
    SubclusterId
);

define_id!(
    /// Packet identifier: BLAKE3 hash of the packet message
    PacketId
);

impl ClusterId {
    /// Derive a cluster id from a human readable name
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(driftmesh_crypto::hash::hash(name.as_bytes()))
    }
}

impl PacketId {
    /// Content address of a message
    #[must_use]
    pub fn of(message: &[u8]) -> Self {
        Self(driftmesh_crypto::hash::hash(message))
    }

    /// Dedup/rate bucket (high nibble of the first byte)
    #[must_use]
    pub const fn bucket(&self) -> usize {
        (self.0[0] >> 4) as usize
    }
}
