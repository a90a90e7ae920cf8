//! Key agreement and key wrapping for key distribution.
//!
//! Provides ephemeral X25519 key agreement against a member's sealer and
//! ChaCha20-Poly1305 wrapping of key secrets.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey};

use cojson_core::{SealerId, SealerSecret};

use crate::error::{PermsError, Result};

/// A shared secret derived from X25519 key agreement.
#[derive(Clone)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Wrap raw agreement output.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Agreement between a member's sealer secret and an ephemeral public key.
    pub fn agree(sealer: &SealerSecret, ephemeral_public: &SealerId) -> Self {
        Self(sealer.diffie_hellman(ephemeral_public))
    }

    /// Derive a wrapping key from this shared secret, bound to `context`.
    pub fn derive_wrap_key(&self, context: &[u8]) -> WrapKey {
        use blake3::Hasher;
        let mut hasher = Hasher::new_derive_key("cojson-seal-v0 wrap key");
        hasher.update(&self.0);
        hasher.update(context);
        WrapKey(*hasher.finalize().as_bytes())
    }
}

/// A 256-bit ChaCha20-Poly1305 key used only to wrap other keys.
#[derive(Clone)]
pub struct WrapKey([u8; 32]);

impl WrapKey {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt data with this key.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &WrapNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| PermsError::Encryption(e.to_string()))?;

        cipher
            .encrypt(Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| PermsError::Encryption(e.to_string()))
    }

    /// Decrypt data with this key.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &WrapNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| PermsError::Decryption(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| PermsError::Decryption(e.to_string()))
    }
}

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapNonce(pub [u8; 12]);

impl WrapNonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Ephemeral key pair for one-time key agreement.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: SealerId,
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = SealerId::from_bytes(*PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> SealerId {
        self.public
    }

    /// Perform key agreement with a member's sealer.
    ///
    /// Consumes the ephemeral secret (can only be used once).
    pub fn diffie_hellman(self, sealer: &SealerId) -> SharedKey {
        let shared = self.secret.diffie_hellman(&sealer.to_dalek());
        SharedKey(*shared.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_key_agreement() {
        // Bob has a sealer
        let bob = SealerSecret::generate();

        // Alice creates an ephemeral key
        let alice_ephemeral = EphemeralKeyPair::generate();
        let alice_public = alice_ephemeral.public_key();
        let alice_shared = alice_ephemeral.diffie_hellman(&bob.id());

        // Bob derives the same secret from Alice's ephemeral public
        let bob_shared = SharedKey::agree(&bob, &alice_public);

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_wrap_unwrap() {
        let wrap = SharedKey::from_bytes([7; 32]).derive_wrap_key(b"ctx");
        let nonce = WrapNonce::generate();

        let ciphertext = wrap.encrypt(b"key material", &nonce).unwrap();
        assert_ne!(ciphertext, b"key material");
        assert_eq!(wrap.decrypt(&ciphertext, &nonce).unwrap(), b"key material");
    }

    #[test]
    fn test_wrap_key_bound_to_context() {
        let shared = SharedKey::from_bytes([0x42; 32]);

        let key1 = shared.derive_wrap_key(b"context-a");
        let key2 = shared.derive_wrap_key(b"context-a");
        let key3 = shared.derive_wrap_key(b"context-b");

        assert_eq!(key1.as_bytes(), key2.as_bytes());
        assert_ne!(key1.as_bytes(), key3.as_bytes());
    }
}
