//! Subcluster key material.
//!
//! Every holder of the same shared secret derives the same Ed25519 keypair
//! and the same sealing key, so the subcluster id (the public key) needs no
//! directory service.
//!
//! Sealed layout: `nonce (24) || XChaCha20-Poly1305 ciphertext || tag (16)`.

use crate::hash::Kdf;
use crate::identity;
use crate::{CryptoError, SEAL_OVERHEAD, XCHACHA_NONCE_SIZE};
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use ed25519_dalek::Signer;
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SIGNING_CONTEXT: Kdf = Kdf::new("driftmesh 2024 subcluster signing key");
const SEALING_CONTEXT: Kdf = Kdf::new("driftmesh 2024 subcluster sealing key");

#[derive(Zeroize, ZeroizeOnDrop)]
struct SealingKey([u8; 32]);

/// Keys derived from one subcluster shared secret.
pub struct SubclusterKeys {
    signing: ed25519_dalek::SigningKey,
    sealing: SealingKey,
}

impl SubclusterKeys {
    /// Derive the subcluster keys from a shared secret.
    #[must_use]
    pub fn derive(shared_secret: &[u8]) -> Self {
        let mut seed = SIGNING_CONTEXT.derive_key(shared_secret);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self {
            signing,
            sealing: SealingKey(SEALING_CONTEXT.derive_key(shared_secret)),
        }
    }

    /// Public key of the subcluster; doubles as the subcluster id.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Encrypt `plaintext` under the subcluster sealing key.
    ///
    /// `aad` is authenticated but not encrypted.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.sealing.0).into());
        let ciphertext = cipher
            .encrypt(
                chacha20poly1305::XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(XCHACHA_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a buffer produced by [`SubclusterKeys::seal`].
    ///
    /// # Errors
    ///
    /// Fails if the buffer is truncated or authentication fails.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::SealedTooShort(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(XCHACHA_NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.sealing.0).into());
        cipher
            .decrypt(
                chacha20poly1305::XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Sign a message with the subcluster key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Verify a signature made by this subcluster's key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if verification fails.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        identity::verify(&self.public_key(), message, signature)
    }
}

impl std::fmt::Debug for SubclusterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubclusterKeys")
            .field("public_key", &hex::encode(self.public_key()))
            .field("sealing", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_secret_same_id() {
        let a = SubclusterKeys::derive(b"lobby-42");
        let b = SubclusterKeys::derive(b"lobby-42");
        let c = SubclusterKeys::derive(b"lobby-43");
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_seal_open() {
        let keys = SubclusterKeys::derive(b"secret");
        let sealed = keys.seal(b"hello", b"aad").unwrap();
        assert_eq!(sealed.len(), 5 + SEAL_OVERHEAD);
        assert_eq!(keys.open(&sealed, b"aad").unwrap(), b"hello");
    }

    #[test]
    fn test_open_with_other_secret_fails() {
        let keys = SubclusterKeys::derive(b"secret");
        let other = SubclusterKeys::derive(b"other");
        let sealed = keys.seal(b"hello", b"").unwrap();
        assert_eq!(other.open(&sealed, b""), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let keys = SubclusterKeys::derive(b"secret");
        let sealed = keys.seal(b"hello", b"one").unwrap();
        assert_eq!(keys.open(&sealed, b"two"), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_open_rejects_truncated() {
        let keys = SubclusterKeys::derive(b"secret");
        assert_eq!(keys.open(&[0u8; 10], b""), Err(CryptoError::SealedTooShort(10)));
    }

    #[test]
    fn test_sign_verify() {
        let keys = SubclusterKeys::derive(b"secret");
        let sig = keys.sign(b"packet id");
        assert!(keys.verify(b"packet id", &sig).is_ok());
        assert!(keys.verify(b"other id", &sig).is_err());
    }

    #[test]
    fn test_nonces_differ() {
        let keys = SubclusterKeys::derive(b"secret");
        let a = keys.seal(b"same", b"").unwrap();
        let b = keys.seal(b"same", b"").unwrap();
        assert_ne!(a, b);
    }
}
