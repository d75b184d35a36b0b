//! # Author Keystore
//!
//! In-memory registry mapping author ids to Ed25519 key material. Packets
//! delegate signing and verification here, so a packet's `author_id` must
//! resolve in whichever keystore is used to sign or check it.
//!
//! ## Key Material
//!
//! - **Secret**: a full signing key; can sign and verify
//! - **Public**: a verifying key only; can verify, signing fails with
//!   [`KeystoreError::MissingSecretKey`]
//!
//! The keystore is populated from trusted material at startup and treated as
//! read-only afterwards. Registering an id that already exists replaces the
//! previous key.
//!
//! ## Verification Semantics
//!
//! An inauthentic signature is an expected condition, not an error:
//! [`Keystore::verify`] returns `Ok(false)`. Errors are reserved for an
//! unknown author or a signature that is structurally not Ed25519 (wrong
//! length).

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of an Ed25519 secret seed or public key in bytes.
pub const KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeystoreError {
    #[error("unknown author {0:?}")]
    UnknownAuthor(String),
    #[error("key material is not a valid Ed25519 {0}")]
    InvalidKeyKind(&'static str),
    #[error("author {0:?} has no secret key registered")]
    MissingSecretKey(String),
    #[error("signature must be {SIGNATURE_LENGTH} bytes, got {0}")]
    MalformedSignature(usize),
}

/// Ed25519 key material registered for one author.
#[derive(Clone)]
pub enum AuthorKey {
    Secret(SigningKey),
    Public(VerifyingKey),
}

impl AuthorKey {
    /// Generate a fresh signing key from the OS RNG.
    pub fn generate() -> Self {
        Self::Secret(SigningKey::generate(&mut OsRng))
    }

    /// Build a signing key from a 32-byte seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeystoreError> {
        let seed: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeystoreError::InvalidKeyKind("secret key"))?;
        Ok(Self::Secret(SigningKey::from_bytes(&seed)))
    }

    /// Build a verifying key from a 32-byte compressed Edwards point.
    pub fn from_public_bytes(bytes: &[u8]) -> Result<Self, KeystoreError> {
        VerifyingKey::try_from(bytes)
            .map(Self::Public)
            .map_err(|_| KeystoreError::InvalidKeyKind("public key"))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        match self {
            Self::Secret(signing) => signing.verifying_key(),
            Self::Public(verifying) => *verifying,
        }
    }

    /// Public half of this key, safe to hand to verifying-only keystores.
    pub fn public(&self) -> Self {
        Self::Public(self.verifying_key())
    }

    pub fn has_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }
}

impl From<SigningKey> for AuthorKey {
    fn from(key: SigningKey) -> Self {
        Self::Secret(key)
    }
}

impl From<VerifyingKey> for AuthorKey {
    fn from(key: VerifyingKey) -> Self {
        Self::Public(key)
    }
}

impl std::fmt::Debug for AuthorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorKey")
            .field("public", &hex::encode(self.verifying_key().as_bytes()))
            .field("secret", &self.has_secret())
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Keystore {
    keys: HashMap<String, AuthorKey>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` for `author_id`, replacing any previous key.
    pub fn add_key(&mut self, author_id: impl Into<String>, key: impl Into<AuthorKey>) {
        self.keys.insert(author_id.into(), key.into());
    }

    /// Register a raw 32-byte public key.
    pub fn add_public_key_bytes(
        &mut self,
        author_id: impl Into<String>,
        bytes: &[u8],
    ) -> Result<(), KeystoreError> {
        let key = AuthorKey::from_public_bytes(bytes)?;
        self.add_key(author_id, key);
        Ok(())
    }

    /// Register a raw 32-byte secret seed.
    pub fn add_secret_key_bytes(
        &mut self,
        author_id: impl Into<String>,
        bytes: &[u8],
    ) -> Result<(), KeystoreError> {
        let key = AuthorKey::from_secret_bytes(bytes)?;
        self.add_key(author_id, key);
        Ok(())
    }

    pub fn contains(&self, author_id: &str) -> bool {
        self.keys.contains_key(author_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn authors(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn public_key(&self, author_id: &str) -> Option<VerifyingKey> {
        self.keys.get(author_id).map(AuthorKey::verifying_key)
    }

    fn key(&self, author_id: &str) -> Result<&AuthorKey, KeystoreError> {
        self.keys
            .get(author_id)
            .ok_or_else(|| KeystoreError::UnknownAuthor(author_id.to_string()))
    }

    /// Sign `data` (RFC 8032 Ed25519) with the key registered for `author_id`.
    pub fn sign(&self, author_id: &str, data: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], KeystoreError> {
        match self.key(author_id)? {
            AuthorKey::Secret(signing) => Ok(signing.sign(data).to_bytes()),
            AuthorKey::Public(_) => Err(KeystoreError::MissingSecretKey(author_id.to_string())),
        }
    }

    /// Check `signature` over `data` against the key registered for `author_id`.
    ///
    /// Returns `Ok(false)` when the signature is well-formed but not authentic.
    pub fn verify(&self, author_id: &str, data: &[u8], signature: &[u8]) -> Result<bool, KeystoreError> {
        let verifying = self.key(author_id)?.verifying_key();
        let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| KeystoreError::MalformedSignature(signature.len()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        Ok(verifying.verify(data, &sig).is_ok())
    }
}
