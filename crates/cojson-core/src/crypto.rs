//! Cryptographic primitives for cojson.
//!
//! Wraps Ed25519 signing, X25519 sealer keys, ChaCha20-Poly1305 symmetric
//! keys and BLAKE3 hashing with strong types. Every public value has a
//! prefixed textual form (`signer_z…`, `sealer_z…`, `key_z…`) which is also
//! its serde representation.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

pub(crate) fn parse_prefixed<const N: usize>(
    s: &str,
    prefix: &str,
    kind: &'static str,
) -> Result<[u8; N], CryptoError> {
    let malformed = || CryptoError::Malformed {
        kind,
        value: s.to_string(),
    };
    let hex_part = s.strip_prefix(prefix).ok_or_else(malformed)?;
    let bytes = hex::decode(hex_part).map_err(|_| malformed())?;
    bytes.try_into().map_err(|_| malformed())
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Declares a fixed-size public value with a prefixed hex text form.
macro_rules! prefixed_bytes {
    ($(#[$doc:meta])* $name:ident, $len:expr, $prefix:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Textual prefix of this value.
            pub const PREFIX: &'static str = $prefix;

            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Convert to hex string (without prefix).
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}{}", $prefix, self.to_hex())
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::CryptoError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                $crate::crypto::parse_prefixed::<$len>(s, $prefix, stringify!($name)).map(Self)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::std::result::Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use prefixed_bytes;

prefixed_bytes!(
    /// An Ed25519 verifying key.
    SignerId,
    32,
    "signer_z"
);

prefixed_bytes!(
    /// An Ed25519 signature over a session hash.
    Signature,
    64,
    "signature_z"
);

prefixed_bytes!(
    /// An X25519 public key that secrets can be sealed to.
    SealerId,
    32,
    "sealer_z"
);

prefixed_bytes!(
    /// Identifier of a symmetric key epoch.
    KeyId,
    16,
    "key_z"
);

// ─────────────────────────────────────────────────────────────────────────────
// Hashing
// ─────────────────────────────────────────────────────────────────────────────

/// A 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the BLAKE3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

impl From<blake3::Hash> for Blake3Hash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signing
// ─────────────────────────────────────────────────────────────────────────────

impl SignerId {
    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// An Ed25519 signing key.
#[derive(Clone)]
pub struct SignerSecret {
    signing_key: SigningKey,
}

impl SignerSecret {
    /// Textual prefix of the secret.
    pub const PREFIX: &'static str = "signerSecret_z";

    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        Self { signing_key }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The public signer id.
    pub fn id(&self) -> SignerId {
        SignerId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Raw seed bytes.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerSecret({:?})", self.id())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sealing keys
// ─────────────────────────────────────────────────────────────────────────────

impl SealerId {
    /// Convert to an x25519-dalek public key.
    pub fn to_dalek(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

/// An X25519 static secret used to open sealed key reveals.
#[derive(Clone)]
pub struct SealerSecret([u8; 32]);

impl SealerSecret {
    /// Textual prefix of the secret.
    pub const PREFIX: &'static str = "sealerSecret_z";

    /// Generate a new random secret.
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The public sealer id.
    pub fn id(&self) -> SealerId {
        SealerId(*PublicKey::from(&StaticSecret::from(self.0)).as_bytes())
    }

    /// X25519 key agreement with a peer's public key.
    pub fn diffie_hellman(&self, peer: &SealerId) -> [u8; 32] {
        *StaticSecret::from(self.0)
            .diffie_hellman(&peer.to_dalek())
            .as_bytes()
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerSecret({:?})", self.id())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────────────────────────────────────

/// Public identity of an agent: one sealer plus one signer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub sealer: SealerId,
    pub signer: SignerId,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &self.signer.to_hex()[..16])
    }
}

impl FromStr for AgentId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s.split_once('/').ok_or_else(|| CryptoError::Malformed {
            kind: "AgentId",
            value: s.to_string(),
        })?;
        Ok(Self {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Secret half of an agent.
#[derive(Clone, Debug)]
pub struct AgentSecret {
    pub sealer: SealerSecret,
    pub signer: SignerSecret,
}

impl AgentSecret {
    /// Generate a fresh agent.
    pub fn generate() -> Self {
        Self {
            sealer: SealerSecret::generate(),
            signer: SignerSecret::generate(),
        }
    }

    /// Deterministic agent from a seed, for tests and fixtures.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let sealer_seed = blake3::derive_key("cojson-agent-v0 sealer", seed);
        let signer_seed = blake3::derive_key("cojson-agent-v0 signer", seed);
        Self {
            sealer: SealerSecret::from_bytes(sealer_seed),
            signer: SignerSecret::from_seed(&signer_seed),
        }
    }

    /// The public agent id.
    pub fn id(&self) -> AgentId {
        AgentId {
            sealer: self.sealer.id(),
            signer: self.signer.id(),
        }
    }

    /// Export both secrets as text.
    pub fn to_secret_string(&self) -> String {
        format!(
            "{}{}/{}{}",
            SealerSecret::PREFIX,
            hex::encode(self.sealer.as_bytes()),
            SignerSecret::PREFIX,
            hex::encode(self.signer.seed())
        )
    }

    /// Parse the output of [`AgentSecret::to_secret_string`].
    pub fn from_secret_string(s: &str) -> Result<Self, CryptoError> {
        let (sealer, signer) = s.split_once('/').ok_or_else(|| CryptoError::Malformed {
            kind: "AgentSecret",
            value: "<redacted>".into(),
        })?;
        let sealer = parse_prefixed::<32>(sealer, SealerSecret::PREFIX, "SealerSecret")?;
        let signer = parse_prefixed::<32>(signer, SignerSecret::PREFIX, "SignerSecret")?;
        Ok(Self {
            sealer: SealerSecret::from_bytes(sealer),
            signer: SignerSecret::from_seed(&signer),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Symmetric keys
// ─────────────────────────────────────────────────────────────────────────────

impl KeyId {
    /// Generate a fresh random key id.
    pub fn generate() -> Self {
        Self(random_bytes())
    }
}

/// Prefix of ciphertexts produced by [`KeySecret::encrypt`].
pub const ENCRYPTED_PREFIX: &str = "encrypted_U";

/// A 256-bit ChaCha20-Poly1305 key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret([u8; 32]);

impl KeySecret {
    /// Textual prefix of the secret.
    pub const PREFIX: &'static str = "keySecret_z";

    /// Generate a new random key.
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Text form, as stored in `<keyId>_for_everyone` entries.
    pub fn to_secret_string(&self) -> String {
        format!("{}{}", Self::PREFIX, hex::encode(self.0))
    }

    /// Parse the text form.
    pub fn from_secret_string(s: &str) -> Result<Self, CryptoError> {
        parse_prefixed::<32>(s, Self::PREFIX, "KeySecret").map(Self)
    }

    /// Encrypt `plaintext`, binding the ciphertext to `nonce_material`.
    ///
    /// The nonce is derived from `nonce_material`, so the same material must
    /// never be reused with the same key for different plaintexts.
    pub fn encrypt(&self, plaintext: &[u8], nonce_material: &[u8]) -> Result<String, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let nonce = derive_nonce(nonce_material);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        Ok(format!("{}{}", ENCRYPTED_PREFIX, hex::encode(ciphertext)))
    }

    /// Decrypt a value produced by [`KeySecret::encrypt`].
    pub fn decrypt(&self, encrypted: &str, nonce_material: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let body = encrypted
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| CryptoError::Decryption("missing prefix".into()))?;
        let ciphertext =
            hex::decode(body).map_err(|e| CryptoError::Decryption(e.to_string()))?;
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        let nonce = derive_nonce(nonce_material);
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(..)")
    }
}

fn derive_nonce(material: &[u8]) -> [u8; 12] {
    let mut hasher = blake3::Hasher::new_derive_key("cojson-nonce-v0");
    hasher.update(material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
    nonce
}
