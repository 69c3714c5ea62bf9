//! # Cryptographic Primitives
//!
//! This module provides the cryptographic building blocks for Mycorrhizal:
//!
//! - **Addressing**: SHA-256 truncation of an Ed25519 public key
//! - **End-to-end encryption**: ephemeral-static X25519 + HKDF-SHA256 +
//!   ChaCha20-Poly1305 for 1:1 channels
//! - **Group encryption**: shared-key ChaCha20-Poly1305 for colonies
//! - **Frame digests**: BLAKE3 over raw frame bytes for the dedupe window
//!
//! ## Security Model
//!
//! - Identity = keypair; the 128-bit address is `sha256(signing_pub)[0..16]`
//! - Packet signatures are Ed25519 over a canonical header view (see
//!   [`crate::packet`])
//! - Channel encryption is ephemeral-static: forward-secret against
//!   compromise of ephemeral state only, not against static key compromise
//! - Colony security is exactly group-key possession; any key holder can
//!   read, write, and join

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

/// Byte length of a node address.
pub const ADDRESS_SIZE: usize = 16;

/// Byte length of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Byte length of the AEAD nonce.
pub const NONCE_SIZE: usize = 12;

/// Byte length of the ChaCha20-Poly1305 authentication tag.
pub const AEAD_TAG_SIZE: usize = 16;

/// Byte length of a group key.
pub const GROUP_KEY_SIZE: usize = 32;

/// Minimum length of a channel ciphertext: ephemeral key + nonce + tag.
pub const CHANNEL_OVERHEAD: usize = 32 + NONCE_SIZE + AEAD_TAG_SIZE;

/// HKDF info label for channel key derivation. Domain-separates channel keys
/// from any other use of the same shared secret.
const E2EE_INFO: &[u8] = b"mycorrhizal_e2ee_v1";

// ============================================================================
// Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing on a packet that requires one.
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Error type for encryption/decryption failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext shorter than the fixed framing it must carry.
    TooShort,
    /// AEAD decryption failed (tag mismatch or corrupted ciphertext).
    DecryptionFailed,
    /// AEAD encryption failed.
    EncryptionFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::TooShort => write!(f, "ciphertext too short"),
            CryptoError::DecryptionFailed => write!(f, "decryption failed"),
            CryptoError::EncryptionFailed => write!(f, "encryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Hashing
// ============================================================================

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive a 128-bit address from an Ed25519 signing public key.
///
/// The address is a pure function of the key: `sha256(signing_pub)[0..16]`.
pub fn derive_address(signing_public_key: &[u8; 32]) -> [u8; ADDRESS_SIZE] {
    let digest = sha256(signing_public_key);
    let mut address = [0u8; ADDRESS_SIZE];
    address.copy_from_slice(&digest[..ADDRESS_SIZE]);
    address
}

/// Truncated payload integrity hash carried in the packet header:
/// `sha256(payload)[0..8]`.
pub fn payload_hash(payload: &[u8]) -> [u8; 8] {
    let digest = sha256(payload);
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&digest[..8]);
    hash
}

/// Content digest of a raw frame, used as the dedupe-window key.
///
/// BLAKE3 here is an in-memory identifier only; nothing on the wire depends
/// on it.
pub fn frame_digest(frame: &[u8]) -> [u8; 32] {
    *blake3::hash(frame).as_bytes()
}

// ============================================================================
// Channel Encryption (ephemeral-static X25519 + ChaCha20-Poly1305)
// ============================================================================

/// Encrypt `plaintext` to a recipient's static X25519 public key.
///
/// Protocol (per message):
/// 1. Generate an ephemeral X25519 keypair
/// 2. `ss = X25519(e_priv, recipient_pub)`
/// 3. `k = HKDF-SHA256(ss, info = "mycorrhizal_e2ee_v1", L = 32)`
/// 4. Random 12-byte nonce, ChaCha20-Poly1305 with empty AAD
///
/// Output layout: `ephemeral_pub(32) || nonce(12) || ciphertext`.
pub fn encrypt_to_key(
    plaintext: &[u8],
    recipient_public: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(*recipient_public));
    let key = derive_channel_key(shared_secret.as_bytes());

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(32 + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a channel payload with our static X25519 private key.
///
/// Expects the `ephemeral_pub(32) || nonce(12) || ciphertext` layout produced
/// by [`encrypt_to_key`].
pub fn decrypt_with_key(
    encrypted: &[u8],
    recipient_secret: &StaticSecret,
) -> Result<Vec<u8>, CryptoError> {
    if encrypted.len() < CHANNEL_OVERHEAD {
        return Err(CryptoError::TooShort);
    }

    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&encrypted[..32]);
    let nonce = &encrypted[32..32 + NONCE_SIZE];
    let ciphertext = &encrypted[32 + NONCE_SIZE..];

    let shared_secret = recipient_secret.diffie_hellman(&X25519PublicKey::from(ephemeral_public));
    let key = derive_channel_key(shared_secret.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn derive_channel_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(E2EE_INFO, &mut key)
        .expect("HKDF expand: 32 <= 255 * 32");
    key
}

// ============================================================================
// Group Encryption (shared symmetric key)
// ============================================================================

/// Generate a fresh 32-byte group key.
pub fn generate_group_key() -> [u8; GROUP_KEY_SIZE] {
    let mut key = [0u8; GROUP_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt a group message with the shared key.
///
/// Output layout: `nonce(12) || ciphertext+tag`.
pub fn encrypt_group(
    plaintext: &[u8],
    group_key: &[u8; GROUP_KEY_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(group_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a group message produced by [`encrypt_group`].
pub fn decrypt_group(
    encrypted: &[u8],
    group_key: &[u8; GROUP_KEY_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    if encrypted.len() < NONCE_SIZE + AEAD_TAG_SIZE {
        return Err(CryptoError::TooShort);
    }

    let nonce = &encrypted[..NONCE_SIZE];
    let ciphertext = &encrypted[NONCE_SIZE..];

    let cipher = ChaCha20Poly1305::new(Key::from_slice(group_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
