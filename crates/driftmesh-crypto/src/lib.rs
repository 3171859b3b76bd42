//! # driftmesh Crypto
//!
//! Cryptographic primitives for the driftmesh transport.
//!
//! This crate provides:
//! - Node identity keys (the source of every peer id)
//! - Deterministic subcluster key derivation from a shared secret
//! - `XChaCha20-Poly1305` sealing of application payloads
//! - Ed25519 signatures over packet ids
//! - BLAKE3 content hashing and context-bound key derivation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Sealing | XChaCha20-Poly1305 | 256-bit key |
//! | Signatures | Ed25519 | 128-bit |
//! | Content hash | BLAKE3 | 128-bit collision |
//! | KDF | keyed BLAKE3 with context | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod identity;
pub mod seal;

pub use error::CryptoError;
pub use identity::Identity;
pub use seal::SubclusterKeys;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const XCHACHA_TAG_SIZE: usize = 16;

/// Bytes added by sealing (nonce prefix plus tag)
pub const SEAL_OVERHEAD: usize = XCHACHA_NONCE_SIZE + XCHACHA_TAG_SIZE;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
