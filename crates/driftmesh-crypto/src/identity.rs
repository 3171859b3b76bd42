//! Node identity keys.
//!
//! Every node owns one Ed25519 keypair. The 32-byte public key is the
//! node's peer id on the wire.

use crate::CryptoError;
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;

/// Long-lived node identity (Ed25519 signing key).
///
/// The secret key is zeroized on drop by `ed25519-dalek`.
#[derive(Clone)]
pub struct Identity {
    signing: ed25519_dalek::SigningKey,
}

impl Identity {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret seed.
    #[must_use]
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Restore an identity from a hex-encoded secret seed.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not hex or not exactly 32 bytes.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let seed: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;
        Ok(Self::from_bytes(&seed))
    }

    /// Export the secret seed (handle with care).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Export the secret seed as hex (handle with care).
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Public key bytes, used as the peer id.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message with the identity key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against a raw public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] for a malformed key and
/// [`CryptoError::InvalidSignature`] when verification fails.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(public_key)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
