//! # Identities and Addresses
//!
//! This module defines the core identity types used throughout Mycorrhizal:
//!
//! - [`Address`]: 128-bit node identifier, `sha256(signing_pub)[0..16]`
//! - [`Identity`]: long-term Ed25519 signing + X25519 encryption keypairs
//! - [`PublicIdentity`]: the public halves, as learned from announces
//! - [`Keystore`]: optional persistence seam for the 128-byte identity blob
//!
//! ## Identity Model
//!
//! A node's identity is two keypairs. The Ed25519 pair authenticates
//! (announces, packet signatures); the X25519 pair receives end-to-end
//! encrypted traffic. The address is a pure function of the signing public
//! key, so anyone holding an announce can check that the claimed address
//! belongs to the claimed key.
//!
//! ## Security Invariants
//!
//! - `identity.address() == sha256(identity.signing_public())[0..16]`
//! - Loading a persisted identity recomputes the address from the stored
//!   public key; a blob whose keys are inconsistent is rejected
//! - The persisted layout is exactly
//!   `sign_priv(32) || sign_pub(32) || enc_priv(32) || enc_pub(32)`

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::{self, SignatureError, ADDRESS_SIZE};

/// Serialized identity blob length: four 32-byte keys.
pub const IDENTITY_BLOB_SIZE: usize = 128;

// ============================================================================
// Address
// ============================================================================

/// 128-bit cryptographic node address.
///
/// Derived as `sha256(signing_pub)[0..16]`; displayed as 32 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    pub const fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice; fails unless exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ADDRESS_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse from 32 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines: first 8 hex characters.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for identity construction and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    /// Blob is not exactly 128 bytes.
    InvalidLength,
    /// The stored Ed25519 public key does not match the private key.
    KeyMismatch,
    /// A stored key is not a valid curve point / scalar.
    InvalidKey,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidLength => {
                write!(f, "identity blob must be {IDENTITY_BLOB_SIZE} bytes")
            }
            IdentityError::KeyMismatch => write!(f, "stored public key does not match private key"),
            IdentityError::InvalidKey => write!(f, "stored key material is invalid"),
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// PublicIdentity
// ============================================================================

/// The public half of a remote node's identity, as carried in announces.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    signing_public: [u8; 32],
    encryption_public: [u8; 32],
}

impl PublicIdentity {
    pub fn new(signing_public: [u8; 32], encryption_public: [u8; 32]) -> Self {
        Self {
            signing_public,
            encryption_public,
        }
    }

    /// Address derived from the signing public key.
    pub fn address(&self) -> Address {
        Address(crypto::derive_address(&self.signing_public))
    }

    pub fn signing_public(&self) -> &[u8; 32] {
        &self.signing_public
    }

    pub fn encryption_public(&self) -> &[u8; 32] {
        &self.encryption_public
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let verifying_key = VerifyingKey::from_bytes(&self.signing_public)
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        verifying_key
            .verify_strict(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }

    /// The 64-byte announce payload: `signing_pub(32) || encryption_pub(32)`.
    pub fn to_announce_payload(&self) -> [u8; 64] {
        let mut payload = [0u8; 64];
        payload[..32].copy_from_slice(&self.signing_public);
        payload[32..].copy_from_slice(&self.encryption_public);
        payload
    }

    /// Parse the leading 64 bytes of an announce payload.
    pub fn from_announce_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < 64 {
            return None;
        }
        let mut signing_public = [0u8; 32];
        let mut encryption_public = [0u8; 32];
        signing_public.copy_from_slice(&payload[..32]);
        encryption_public.copy_from_slice(&payload[32..64]);
        Some(Self {
            signing_public,
            encryption_public,
        })
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentity({})", self.address().short())
    }
}

// ============================================================================
// Identity
// ============================================================================

/// A node's long-term identity: signing and encryption keypairs.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    encryption_secret: StaticSecret,
    encryption_public: X25519PublicKey,
}

impl Identity {
    /// Generate a fresh identity with the system CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let encryption_secret = StaticSecret::random_from_rng(OsRng);
        let encryption_public = X25519PublicKey::from(&encryption_secret);
        Self {
            signing_key,
            encryption_secret,
            encryption_public,
        }
    }

    /// This identity's address.
    pub fn address(&self) -> Address {
        Address(crypto::derive_address(self.signing_key.verifying_key().as_bytes()))
    }

    pub fn signing_public(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    pub fn encryption_public(&self) -> [u8; 32] {
        *self.encryption_public.as_bytes()
    }

    /// The static X25519 secret, needed to decrypt channel traffic.
    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    /// Sign a message with the long-term signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// The shareable public half of this identity.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity::new(self.signing_public(), self.encryption_public())
    }

    /// Serialize for persistence:
    /// `sign_priv(32) || sign_pub(32) || enc_priv(32) || enc_pub(32)`.
    pub fn to_bytes(&self) -> [u8; IDENTITY_BLOB_SIZE] {
        let mut blob = [0u8; IDENTITY_BLOB_SIZE];
        blob[0..32].copy_from_slice(self.signing_key.as_bytes());
        blob[32..64].copy_from_slice(self.signing_key.verifying_key().as_bytes());
        blob[64..96].copy_from_slice(&self.encryption_secret.to_bytes());
        blob[96..128].copy_from_slice(self.encryption_public.as_bytes());
        blob
    }

    /// Load a persisted identity, recomputing and checking derived material.
    pub fn from_bytes(blob: &[u8]) -> Result<Self, IdentityError> {
        if blob.len() != IDENTITY_BLOB_SIZE {
            return Err(IdentityError::InvalidLength);
        }

        let sign_priv: [u8; 32] = blob[0..32].try_into().expect("slice length checked");
        let sign_pub: [u8; 32] = blob[32..64].try_into().expect("slice length checked");
        let enc_priv: [u8; 32] = blob[64..96].try_into().expect("slice length checked");
        let enc_pub: [u8; 32] = blob[96..128].try_into().expect("slice length checked");

        let signing_key = SigningKey::from_bytes(&sign_priv);
        if signing_key.verifying_key().as_bytes() != &sign_pub {
            return Err(IdentityError::KeyMismatch);
        }

        let encryption_secret = StaticSecret::from(enc_priv);
        let encryption_public = X25519PublicKey::from(&encryption_secret);
        if encryption_public.as_bytes() != &enc_pub {
            return Err(IdentityError::KeyMismatch);
        }

        Ok(Self {
            signing_key,
            encryption_secret,
            encryption_public,
        })
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.address().short())
    }
}

// ============================================================================
// Keystore
// ============================================================================

/// Persistence seam for the node identity.
///
/// The core mandates the 128-byte blob layout but not the storage location;
/// implementations write flash, a file, or nothing at all. I/O failures are
/// the implementation's to describe, hence `anyhow` at this boundary.
pub trait Keystore: Send + Sync {
    /// Load the stored identity blob, or `None` if nothing is stored.
    fn load(&self) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store the identity blob, replacing any previous one.
    fn store(&self, blob: &[u8]) -> anyhow::Result<()>;
}

/// Load an identity from `keystore`, or generate one and persist it.
///
/// A stored blob that fails validation is treated as absent: a fresh identity
/// is generated and written back.
pub fn load_or_generate(keystore: &dyn Keystore) -> anyhow::Result<Identity> {
    if let Some(blob) = keystore.load()? {
        match Identity::from_bytes(&blob) {
            Ok(identity) => {
                tracing::info!(address = %identity.address(), "loaded persisted identity");
                return Ok(identity);
            }
            Err(err) => {
                tracing::warn!(error = %err, "stored identity invalid, generating a new one");
            }
        }
    }

    let identity = Identity::generate();
    keystore.store(&identity.to_bytes())?;
    tracing::info!(address = %identity.address(), "generated new identity");
    Ok(identity)
}
