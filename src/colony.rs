//! # Colonies (Group Conversations)
//!
//! A colony is a group conversation keyed by a shared 32-byte symmetric key.
//! The colony id is `sha256(group_key)[0..16]`, so the id proves nothing to
//! outsiders but lets members demultiplex inbound traffic: a DATA payload
//! whose first 16 bytes match a known colony id belongs to that colony.
//!
//! Message payload layout: `colony_id(16) || nonce(12) || ciphertext+tag`.
//!
//! ## Security Property
//!
//! Group-key possession *is* membership. Any sender whose message decrypts
//! under the group key is auto-added to the member set. Key distribution is
//! the invitation: `COLONY_INVITE:<hex colony_id>:<hex group_key>:<name>`,
//! shared out-of-band or as an in-band plaintext payload.

use std::collections::HashMap;

use crate::crypto::{self, CryptoError, GROUP_KEY_SIZE};
use crate::identity::{Address, PublicIdentity};

/// Text prefix of an invitation payload.
pub const INVITE_PREFIX: &str = "COLONY_INVITE:";

/// 16-byte colony identifier: `sha256(group_key)[0..16]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColonyId([u8; 16]);

impl ColonyId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Derive the id of a group key.
    pub fn of_key(group_key: &[u8; GROUP_KEY_SIZE]) -> Self {
        let digest = crypto::sha256(group_key);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for ColonyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ColonyId({})", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for ColonyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Everything a new member needs to join: the key, its id, and a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColonyKeyMaterial {
    pub colony_id: ColonyId,
    pub group_key: [u8; GROUP_KEY_SIZE],
    pub name: String,
}

impl ColonyKeyMaterial {
    /// Build key material from a key and a display name; the id is derived.
    pub fn new(group_key: [u8; GROUP_KEY_SIZE], name: impl Into<String>) -> Self {
        Self {
            colony_id: ColonyId::of_key(&group_key),
            group_key,
            name: name.into(),
        }
    }

    /// Render the textual invitation.
    pub fn to_invite(&self) -> String {
        format!(
            "{INVITE_PREFIX}{}:{}:{}",
            self.colony_id.to_hex(),
            hex::encode(self.group_key),
            self.name
        )
    }

    /// Parse an invitation. The embedded id must match the key, otherwise
    /// the invite is rejected.
    pub fn parse_invite(text: &str) -> Option<Self> {
        let rest = text.strip_prefix(INVITE_PREFIX)?;
        let mut parts = rest.splitn(3, ':');
        let id_hex = parts.next()?;
        let key_hex = parts.next()?;
        let name = parts.next()?;

        let id = ColonyId::from_slice(&hex::decode(id_hex).ok()?)?;
        let key_bytes = hex::decode(key_hex).ok()?;
        let group_key: [u8; GROUP_KEY_SIZE] = key_bytes.try_into().ok()?;

        if ColonyId::of_key(&group_key) != id {
            return None;
        }
        Some(Self {
            colony_id: id,
            group_key,
            name: name.to_string(),
        })
    }
}

/// One known member of a colony.
#[derive(Debug, Clone, Default)]
pub struct Member {
    /// Public identity when the identity cache had one at join time.
    pub identity: Option<PublicIdentity>,
    /// Display name; falls back to short hex when absent.
    pub display_name: Option<String>,
}

/// Group conversation state. Sending goes through the owning
/// [`Node`](crate::Node), which fans the encrypted payload out to members.
pub struct Colony {
    colony_id: ColonyId,
    group_key: [u8; GROUP_KEY_SIZE],
    name: String,
    members: HashMap<Address, Member>,
}

impl Colony {
    /// Create a fresh colony with a newly generated group key.
    pub fn create(name: impl Into<String>) -> Self {
        let group_key = crypto::generate_group_key();
        Self {
            colony_id: ColonyId::of_key(&group_key),
            group_key,
            name: name.into(),
            members: HashMap::new(),
        }
    }

    /// Join an existing colony from shared key material.
    pub fn from_key_material(material: ColonyKeyMaterial) -> Self {
        Self {
            colony_id: material.colony_id,
            group_key: material.group_key,
            name: material.name,
            members: HashMap::new(),
        }
    }

    pub fn colony_id(&self) -> ColonyId {
        self.colony_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key material for inviting new members.
    pub fn key_material(&self) -> ColonyKeyMaterial {
        ColonyKeyMaterial {
            colony_id: self.colony_id,
            group_key: self.group_key,
            name: self.name.clone(),
        }
    }

    /// The textual invitation for this colony.
    pub fn invite(&self) -> String {
        self.key_material().to_invite()
    }

    /// Record a member (idempotent; a later call may fill in identity/name).
    pub fn add_member(
        &mut self,
        address: Address,
        identity: Option<PublicIdentity>,
        display_name: Option<String>,
    ) {
        let member = self.members.entry(address).or_default();
        if identity.is_some() {
            member.identity = identity;
        }
        if display_name.is_some() {
            member.display_name = display_name;
        }
    }

    pub fn is_member(&self, address: &Address) -> bool {
        self.members.contains_key(address)
    }

    /// Addresses of all known members.
    pub fn member_addresses(&self) -> Vec<Address> {
        self.members.keys().copied().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Best-effort display name for a sender.
    pub fn member_name(&self, address: &Address) -> String {
        self.members
            .get(address)
            .and_then(|m| m.display_name.clone())
            .unwrap_or_else(|| format!("{}...", address.short()))
    }

    /// Encrypt an outbound group message:
    /// `colony_id(16) || nonce(12) || ciphertext`.
    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let encrypted = crypto::encrypt_group(plaintext, &self.group_key)?;
        let mut payload = Vec::with_capacity(16 + encrypted.len());
        payload.extend_from_slice(self.colony_id.as_bytes());
        payload.extend_from_slice(&encrypted);
        Ok(payload)
    }

    /// Decrypt an inbound payload whose leading 16 bytes matched our id.
    pub fn decrypt_message(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < 16 {
            return Err(CryptoError::TooShort);
        }
        crypto::decrypt_group(&payload[16..], &self.group_key)
    }
}

impl std::fmt::Debug for Colony {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Colony(name='{}', id={}, members={})",
            self.name,
            hex::encode(&self.colony_id.0[..4]),
            self.members.len()
        )
    }
}
