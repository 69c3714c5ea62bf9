//! # Wire Packet Codec
//!
//! The single wire entity of the stack. Layout (big-endian integers):
//!
//! ```text
//! Offset  Size  Field
//!   0      1    flags
//!   1      1    ttl
//!   2      1    hop_count
//!   3      1    type
//!   4     16    destination address
//!  20      2    payload_length
//!  22      8    payload_hash  (sha256(payload)[0..8])
//!  30      2    reserved      (zero on send, ignored on receive)
//!  32      N    payload
//!  32+N   64    signature     (iff flags & SIGNED)
//! ```
//!
//! There is no source field: sender identity is proven by the signature (or
//! by ability to encrypt), never stated in plaintext.
//!
//! ## Signature Coverage
//!
//! Signatures cover a *canonical* view of the frame: the header with `ttl`
//! and `hop_count` zeroed, followed by the payload. Forwarders mutate exactly
//! those two bytes, so a signature made by the originator verifies at every
//! hop. This is the one policy this implementation speaks; there is no
//! hop-0-only dialect.

use crate::crypto::{self, SignatureError, SIGNATURE_SIZE};
use crate::identity::{Address, Identity, PublicIdentity};

/// Fixed header length.
pub const HEADER_SIZE: usize = 32;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

// ----------------------------------------------------------------------------
// Flags (high nibble; low nibble reserved)
// ----------------------------------------------------------------------------

/// Payload is encrypted.
pub const FLAG_ENCRYPTED: u8 = 0x80;

/// Frame carries a trailing 64-byte Ed25519 signature.
pub const FLAG_SIGNED: u8 = 0x40;

/// High-priority traffic.
pub const FLAG_PRIORITY: u8 = 0x20;

/// Payload is one fragment of a larger transfer.
pub const FLAG_FRAGMENTED: u8 = 0x10;

// ============================================================================
// Packet Type
// ============================================================================

/// Wire packet types. DATA and ANNOUNCE carry the protocol; the rest are
/// reserved type codes kept stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x01,
    Announce = 0x02,
    PathRequest = 0x03,
    PathResponse = 0x04,
    Ack = 0x05,
    Keepalive = 0x06,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Data),
            0x02 => Some(PacketType::Announce),
            0x03 => Some(PacketType::PathRequest),
            0x04 => Some(PacketType::PathResponse),
            0x05 => Some(PacketType::Ack),
            0x06 => Some(PacketType::Keepalive),
            _ => None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for frame decoding. Frames failing any of these checks are
/// dropped by the node; the error never reaches user callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a header.
    Truncated,
    /// Declared payload length exceeds the buffer.
    PayloadOutOfBounds,
    /// `sha256(payload)[0..8]` does not match the header.
    IntegrityMismatch,
    /// SIGNED flag set but fewer than 64 bytes follow the payload.
    SignatureTruncated,
    /// Unassigned packet type byte.
    UnknownType(u8),
    /// Payload exceeds the 64 KiB - 1 wire limit (encode side).
    PayloadTooLarge,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "frame shorter than header"),
            FrameError::PayloadOutOfBounds => write!(f, "declared payload exceeds frame"),
            FrameError::IntegrityMismatch => write!(f, "payload hash mismatch"),
            FrameError::SignatureTruncated => write!(f, "signature missing or truncated"),
            FrameError::UnknownType(t) => write!(f, "unknown packet type {t:#04x}"),
            FrameError::PayloadTooLarge => write!(f, "payload exceeds {MAX_PAYLOAD_SIZE} bytes"),
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Packet
// ============================================================================

/// A decoded (or to-be-encoded) wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u8,
    pub ttl: u8,
    pub hop_count: u8,
    pub packet_type: PacketType,
    pub destination: Address,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// New packet with `ttl` hops of life and no flags set.
    pub fn new(packet_type: PacketType, destination: Address, payload: Vec<u8>, ttl: u8) -> Self {
        Self {
            flags: 0,
            ttl,
            hop_count: 0,
            packet_type,
            destination,
            payload,
            signature: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.flags & FLAG_SIGNED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_fragmented(&self) -> bool {
        self.flags & FLAG_FRAGMENTED != 0
    }

    pub fn is_priority(&self) -> bool {
        self.flags & FLAG_PRIORITY != 0
    }

    /// Advance one hop: bump the hop counter, burn one TTL unit.
    pub fn increment_hop(&mut self) {
        self.hop_count = self.hop_count.saturating_add(1);
        self.ttl = self.ttl.saturating_sub(1);
    }

    /// True once the TTL is exhausted.
    pub fn is_expired(&self) -> bool {
        self.ttl == 0
    }

    /// Sign with `identity`: sets the SIGNED flag and attaches a signature
    /// over the canonical view.
    pub fn sign(&mut self, identity: &Identity) {
        self.flags |= FLAG_SIGNED;
        let view = self.signing_view();
        self.signature = Some(identity.sign(&view));
    }

    /// Verify the attached signature against `public_identity`.
    pub fn verify(&self, public_identity: &PublicIdentity) -> Result<(), SignatureError> {
        let signature = match &self.signature {
            Some(sig) => &sig[..],
            None => return Err(SignatureError::Missing),
        };
        public_identity.verify(&self.signing_view(), signature)
    }

    /// The signed region: header with `ttl` and `hop_count` zeroed, then the
    /// payload.
    fn signing_view(&self) -> Vec<u8> {
        let mut view = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.write_header(&mut view, true);
        view.extend_from_slice(&self.payload);
        view
    }

    fn write_header(&self, out: &mut Vec<u8>, canonical: bool) {
        out.push(self.flags);
        out.push(if canonical { 0 } else { self.ttl });
        out.push(if canonical { 0 } else { self.hop_count });
        out.push(self.packet_type as u8);
        out.extend_from_slice(self.destination.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&crypto::payload_hash(&self.payload));
        out.extend_from_slice(&[0u8; 2]); // reserved
    }

    /// Serialize for transmission: header, payload, then the signature when
    /// the SIGNED flag is set.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge);
        }
        let sig_len = if self.is_signed() { SIGNATURE_SIZE } else { 0 };
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len() + sig_len);
        self.write_header(&mut out, false);
        out.extend_from_slice(&self.payload);
        if self.is_signed() {
            match &self.signature {
                Some(sig) => out.extend_from_slice(sig),
                None => return Err(FrameError::SignatureTruncated),
            }
        }
        Ok(out)
    }

    /// Parse a received frame.
    ///
    /// Checks, in order: header presence, declared payload bounds, payload
    /// integrity hash, signature presence when flagged. Bytes past the end of
    /// the frame proper are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated);
        }

        let flags = data[0];
        let ttl = data[1];
        let hop_count = data[2];
        let packet_type = PacketType::from_u8(data[3]).ok_or(FrameError::UnknownType(data[3]))?;
        let destination =
            Address::from_slice(&data[4..20]).expect("slice is exactly ADDRESS_SIZE");
        let payload_length = u16::from_be_bytes([data[20], data[21]]) as usize;
        let declared_hash = &data[22..30];
        // data[30..32] reserved, ignored

        let payload_end = HEADER_SIZE + payload_length;
        if data.len() < payload_end {
            return Err(FrameError::PayloadOutOfBounds);
        }
        let payload = data[HEADER_SIZE..payload_end].to_vec();

        if crypto::payload_hash(&payload) != declared_hash[..] {
            return Err(FrameError::IntegrityMismatch);
        }

        let signature = if flags & FLAG_SIGNED != 0 {
            let sig_end = payload_end + SIGNATURE_SIZE;
            if data.len() < sig_end {
                return Err(FrameError::SignatureTruncated);
            }
            let mut sig = [0u8; SIGNATURE_SIZE];
            sig.copy_from_slice(&data[payload_end..sig_end]);
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            flags,
            ttl,
            hop_count,
            packet_type,
            destination,
            payload,
            signature,
        })
    }
}
