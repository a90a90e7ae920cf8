//! Key reveals sealed to one member.
//!
//! `<keyId>_for_<member>` entries hold the key secret sealed to the member's
//! sealer with a fresh ephemeral X25519 key. The value is
//! `sealed_U<hex(cbor(SealedKey))>`.

use serde::{Deserialize, Serialize};

use cojson_core::{KeyId, KeySecret, RawCoId, SealerId, SealerSecret};

use crate::crypto::{EphemeralKeyPair, SharedKey, WrapNonce};
use crate::error::{PermsError, Result};

/// Prefix of sealed values.
pub const SEALED_PREFIX: &str = "sealed_U";

/// A key secret sealed to one sealer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Ephemeral X25519 public key (sender's side of ECDH).
    pub ephemeral_public: [u8; 32],

    /// Nonce used for encryption.
    pub nonce: [u8; 12],

    /// The key secret, encrypted with the derived wrap key.
    pub ciphertext: Vec<u8>,
}

fn context(group: &RawCoId, key_id: &KeyId) -> Vec<u8> {
    format!("{group}|{key_id}").into_bytes()
}

impl SealedKey {
    /// Seal `key` for the holder of `to`, bound to the group and key id.
    pub fn seal(key: &KeySecret, key_id: &KeyId, group: &RawCoId, to: &SealerId) -> Result<Self> {
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();
        let wrap = ephemeral
            .diffie_hellman(to)
            .derive_wrap_key(&context(group, key_id));

        let nonce = WrapNonce::generate();
        let ciphertext = wrap.encrypt(key.as_bytes(), &nonce)?;

        Ok(Self {
            ephemeral_public: *ephemeral_public.as_bytes(),
            nonce: nonce.0,
            ciphertext,
        })
    }

    /// Open with the recipient's sealer secret.
    pub fn open(&self, key_id: &KeyId, group: &RawCoId, sealer: &SealerSecret) -> Result<KeySecret> {
        let ephemeral = SealerId::from_bytes(self.ephemeral_public);
        let wrap = SharedKey::agree(sealer, &ephemeral).derive_wrap_key(&context(group, key_id));
        let key_bytes = wrap.decrypt(&self.ciphertext, &WrapNonce(self.nonce))?;

        let arr: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| {
            PermsError::Decryption(format!(
                "invalid key length: expected 32, got {}",
                key_bytes.len()
            ))
        })?;
        Ok(KeySecret::from_bytes(arr))
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| PermsError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::Serialization(e.to_string()))
    }

    /// Text form stored in the group.
    pub fn to_text(&self) -> Result<String> {
        Ok(format!("{SEALED_PREFIX}{}", hex::encode(self.to_bytes()?)))
    }

    /// Parse the text form.
    pub fn from_text(text: &str) -> Result<Self> {
        let body = text
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| PermsError::Serialization("missing sealed prefix".into()))?;
        let bytes = hex::decode(body).map_err(|e| PermsError::Serialization(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}
