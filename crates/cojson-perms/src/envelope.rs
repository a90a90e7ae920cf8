//! Key-for-key envelopes.
//!
//! `<oldKeyId>_for_<newKeyId>` entries hold the old key secret encrypted
//! under the new one, so whoever holds the current key can walk back to
//! every earlier key. The same envelope carries write keys under the read
//! key (`<writeKeyId>_for_<readKeyId>`).

use cojson_core::{KeyId, KeySecret};

use crate::error::{PermsError, Result};

fn nonce_material(inner: &KeyId, outer: &KeyId) -> Vec<u8> {
    format!("{inner}|{outer}").into_bytes()
}

/// `inner` encrypted under `outer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEnvelope {
    pub inner: KeyId,
    pub outer: KeyId,
    pub encrypted: String,
}

impl KeyEnvelope {
    /// Encrypt `inner_key` under `outer_key`.
    pub fn wrap(
        inner: KeyId,
        inner_key: &KeySecret,
        outer: KeyId,
        outer_key: &KeySecret,
    ) -> Result<Self> {
        let encrypted = outer_key.encrypt(
            inner_key.to_secret_string().as_bytes(),
            &nonce_material(&inner, &outer),
        )?;
        Ok(Self {
            inner,
            outer,
            encrypted,
        })
    }

    /// Decrypt with the outer key.
    pub fn unwrap_with(&self, outer_key: &KeySecret) -> Result<KeySecret> {
        let plaintext = outer_key.decrypt(&self.encrypted, &nonce_material(&self.inner, &self.outer))?;
        let text = String::from_utf8(plaintext).map_err(|e| PermsError::Decryption(e.to_string()))?;
        Ok(KeySecret::from_secret_string(&text)?)
    }

    /// The group map key this envelope is stored under.
    pub fn map_key(&self) -> String {
        format!("{}_for_{}", self.inner, self.outer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let (old_id, old) = (KeyId::generate(), KeySecret::generate());
        let (new_id, new) = (KeyId::generate(), KeySecret::generate());

        let envelope = KeyEnvelope::wrap(old_id, &old, new_id, &new).unwrap();
        assert_eq!(envelope.map_key(), format!("{old_id}_for_{new_id}"));
        assert_eq!(envelope.unwrap_with(&new).unwrap(), old);
    }

    #[test]
    fn test_wrong_outer_key_fails() {
        let envelope = KeyEnvelope::wrap(
            KeyId::generate(),
            &KeySecret::generate(),
            KeyId::generate(),
            &KeySecret::generate(),
        )
        .unwrap();
        assert!(envelope.unwrap_with(&KeySecret::generate()).is_err());
    }
}
