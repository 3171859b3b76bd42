//! BLAKE3 content hashing and context-bound key derivation.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Hash several parts as one message without concatenating them first.
#[must_use]
pub fn hash_parts(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// BLAKE3 key derivation bound to a fixed context string.
///
/// Two derivations with different contexts never yield related keys,
/// even when fed the same input key material.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        blake3::derive_key(self.context, ikm)
    }
}
