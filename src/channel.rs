//! # Channels (1:1 Encrypted Conversations)
//!
//! A [`Channel`] is a direct conversation with one remote node, end-to-end
//! encrypted with the ephemeral-static construction from [`crate::crypto`]:
//! a fresh X25519 keypair per message, HKDF-SHA256 key derivation, and
//! ChaCha20-Poly1305. The outer DATA packet is signed, so the recipient can
//! attribute the message to us through its identity cache.
//!
//! Inbound traffic is not demultiplexed per channel on the wire — the
//! application feeds payloads it receives via `on_data` into
//! [`Channel::decrypt`].

use crate::crypto::{self, CryptoError};
use crate::identity::{Address, PublicIdentity};
use crate::node::{Node, SendError};
use crate::packet::FLAG_ENCRYPTED;

/// A 1:1 encrypted conversation with a remote node.
///
/// Holds a cheap [`Node`] handle; dropping the channel affects nothing on
/// the wire.
pub struct Channel {
    node: Node,
    remote: PublicIdentity,
}

impl Channel {
    pub fn new(node: Node, remote: PublicIdentity) -> Self {
        Self { node, remote }
    }

    pub fn remote_address(&self) -> Address {
        self.remote.address()
    }

    /// Encrypt `message` to the remote node and send it as a signed DATA
    /// packet.
    pub fn send(&self, message: &[u8]) -> Result<(), SendError> {
        let encrypted = crypto::encrypt_to_key(message, self.remote.encryption_public())
            .map_err(SendError::Crypto)?;
        self.node
            .send_data_with_flags(self.remote_address(), encrypted, true, FLAG_ENCRYPTED)
    }

    /// Decrypt a payload received from the remote node.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt_with_key(payload, self.node.identity().encryption_secret())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel(remote={})", self.remote_address().short())
    }
}

impl Node {
    /// Open an encrypted 1:1 channel to a node whose identity we hold.
    pub fn open_channel(&self, remote: PublicIdentity) -> Channel {
        Channel::new(self.clone(), remote)
    }
}
