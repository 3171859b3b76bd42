//! Error types for packet decoding and identifier parsing.

use thiserror::Error;

/// Errors that can occur while building or parsing packets
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer too short to contain the header
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    /// Unsupported protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown packet kind tag
    #[error("unknown packet kind: 0x{0:02X}")]
    UnknownKind(u8),

    /// Body could not be decoded
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Message exceeds the single-packet bound
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Allowed size
        max: usize,
    },
}

impl From<bincode::Error> for PacketError {
    fn from(e: bincode::Error) -> Self {
        PacketError::Malformed(e.to_string())
    }
}

/// Errors produced when parsing hex identifiers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Wrong number of hex characters
    #[error("invalid id length: expected {expected} hex characters, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Character outside the hex alphabet
    #[error("invalid hex character {0:?} in id")]
    InvalidCharacter(char),
}
