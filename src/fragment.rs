//! # Fragmentation and Reassembly
//!
//! Payloads up to 64 KiB travel as sequences of DATA packets carrying the
//! FRAGMENTED flag. Each fragment payload is:
//!
//! ```text
//!   0     16   transfer_id
//!  16      1   index
//!  17      1   flags (bit 0 = FINAL)
//!  18      M   chunk bytes (zero-length only for a pure FINAL marker)
//! ```
//!
//! The FINAL flag pins the fragment count: `expected = index + 1`. A FINAL
//! fragment with an empty chunk is a pure marker — it sets the count without
//! contributing bytes. Fragments arrive in any order, duplicates overwrite
//! (the network is loss-prone, not Byzantine), and a transfer that stalls for
//! 60 s is collected silently.
//!
//! Reassembled streams may begin with a metadata prefix
//! `meta_len:u16 || key=value\n...` (keys seen in practice: `size`,
//! `filename`, `mime_type`).

use std::collections::{BTreeMap, HashMap};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace};

use crate::crypto;
use crate::identity::Address;

/// Fragment payload header length: transfer_id(16) + index(1) + flags(1).
pub const FRAGMENT_HEADER_SIZE: usize = 18;

/// Largest fragment count a transfer may use (index is one byte).
pub const MAX_FRAGMENTS: usize = 256;

/// Largest transfer the protocol will carry.
pub const MAX_TRANSFER_SIZE: usize = 64 * 1024;

/// Last fragment of the transfer.
pub const FRAGMENT_FLAG_FINAL: u8 = 0x01;

/// Transfer metadata: newline-separated `key=value` pairs on the wire.
pub type Metadata = BTreeMap<String, String>;

// ============================================================================
// Transfer ID
// ============================================================================

/// Opaque 16-byte transfer identifier.
///
/// Senders derive it as `sha256(data || timestamp_ms || random(8))[0..16]`;
/// receivers treat it as a pure key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId([u8; 16]);

impl TransferId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn derive(data: &[u8], timestamp_ms: u64, salt: &[u8; 8]) -> Self {
        let mut material = Vec::with_capacity(data.len() + 16);
        material.extend_from_slice(data);
        material.extend_from_slice(&timestamp_ms.to_be_bytes());
        material.extend_from_slice(salt);
        let digest = crypto::sha256(&material);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }
}

impl std::fmt::Debug for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransferId({})", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Sender-side fragmentation failures; returned synchronously, nothing is
/// transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentError {
    /// Data exceeds [`MAX_TRANSFER_SIZE`].
    Oversize { size: usize },
    /// Data would need more than [`MAX_FRAGMENTS`] fragments at the
    /// configured fragment size.
    TooManyFragments { needed: usize },
    /// Inbound fragment payload shorter than its header.
    TooShort,
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentError::Oversize { size } => {
                write!(f, "transfer of {size} bytes exceeds {MAX_TRANSFER_SIZE}")
            }
            FragmentError::TooManyFragments { needed } => {
                write!(f, "transfer needs {needed} fragments, limit {MAX_FRAGMENTS}")
            }
            FragmentError::TooShort => write!(f, "fragment shorter than header"),
        }
    }
}

impl std::error::Error for FragmentError {}

// ============================================================================
// Fragmenter (send side)
// ============================================================================

/// A parsed inbound fragment, borrowing its chunk from the packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub transfer_id: TransferId,
    pub index: u8,
    pub is_final: bool,
    pub data: &'a [u8],
}

/// Splits outbound data into fragment payloads.
pub struct Fragmenter;

impl Fragmenter {
    /// Fragment `data` (with an optional metadata prefix) into payloads of at
    /// most `frag_data_size` chunk bytes each. The last fragment carries the
    /// FINAL flag.
    pub fn fragment(
        data: &[u8],
        metadata: &Metadata,
        frag_data_size: usize,
        timestamp_ms: u64,
    ) -> Result<(Vec<Vec<u8>>, TransferId), FragmentError> {
        if data.len() > MAX_TRANSFER_SIZE {
            return Err(FragmentError::Oversize { size: data.len() });
        }

        let mut salt = [0u8; 8];
        OsRng.fill_bytes(&mut salt);
        let transfer_id = TransferId::derive(data, timestamp_ms, &salt);

        let stream = if metadata.is_empty() {
            data.to_vec()
        } else {
            let mut stream = encode_metadata(metadata);
            stream.extend_from_slice(data);
            stream
        };

        let frag_data_size = frag_data_size.max(1);
        let total = stream.len().div_ceil(frag_data_size).max(1);
        if total > MAX_FRAGMENTS {
            return Err(FragmentError::TooManyFragments { needed: total });
        }

        let mut fragments = Vec::with_capacity(total);
        for i in 0..total {
            let start = i * frag_data_size;
            let end = (start + frag_data_size).min(stream.len());
            let flags = if i == total - 1 { FRAGMENT_FLAG_FINAL } else { 0 };

            let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + (end - start));
            payload.extend_from_slice(transfer_id.as_bytes());
            payload.push(i as u8);
            payload.push(flags);
            payload.extend_from_slice(&stream[start..end]);
            fragments.push(payload);
        }

        Ok((fragments, transfer_id))
    }

    /// Parse an inbound fragment payload.
    pub fn parse(payload: &[u8]) -> Result<Fragment<'_>, FragmentError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::TooShort);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&payload[..16]);
        Ok(Fragment {
            transfer_id: TransferId::from_bytes(id),
            index: payload[16],
            is_final: payload[17] & FRAGMENT_FLAG_FINAL != 0,
            data: &payload[FRAGMENT_HEADER_SIZE..],
        })
    }
}

/// Render the metadata prefix: `meta_len:u16 || key=value\n...`.
fn encode_metadata(metadata: &Metadata) -> Vec<u8> {
    let body = metadata
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    let body = body.into_bytes();
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Split a reassembled stream into (metadata, data).
///
/// Lenient by design: a stream without a plausible prefix is returned whole
/// with empty metadata.
pub fn extract_metadata(stream: &[u8]) -> (Metadata, &[u8]) {
    if stream.len() < 2 {
        return (Metadata::new(), stream);
    }
    let meta_len = u16::from_be_bytes([stream[0], stream[1]]) as usize;
    if meta_len == 0 || stream.len() < 2 + meta_len {
        return (Metadata::new(), stream);
    }

    let Ok(body) = std::str::from_utf8(&stream[2..2 + meta_len]) else {
        return (Metadata::new(), stream);
    };

    let mut metadata = Metadata::new();
    for line in body.split('\n') {
        if let Some((key, value)) = line.split_once('=') {
            metadata.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    (metadata, &stream[2 + meta_len..])
}

// ============================================================================
// Transfer State (receive side)
// ============================================================================

/// Reassembly state for one in-flight transfer.
///
/// Fragments live in a 256-slot sparse array; a bitset tracks which indices
/// have arrived, making the missing-fragments query constant time per word.
pub struct TransferState {
    pub transfer_id: TransferId,
    pub sender: Option<Address>,
    pub start_time_ms: u64,
    slots: Box<[Option<Vec<u8>>]>,
    received_bits: [u64; MAX_FRAGMENTS / 64],
    received_count: u16,
    final_received: bool,
    expected_count: Option<u16>,
}

impl TransferState {
    fn new(transfer_id: TransferId, sender: Option<Address>, now_ms: u64) -> Self {
        Self {
            transfer_id,
            sender,
            start_time_ms: now_ms,
            slots: (0..MAX_FRAGMENTS).map(|_| None).collect(),
            received_bits: [0; MAX_FRAGMENTS / 64],
            received_count: 0,
            final_received: false,
            expected_count: None,
        }
    }

    /// Record one fragment. A FINAL marker with an empty chunk only pins the
    /// expected count; it is not stored.
    pub fn add_fragment(&mut self, index: u8, data: &[u8], is_final: bool) {
        if is_final {
            self.final_received = true;
            self.expected_count = Some(index as u16 + 1);
        }
        if is_final && data.is_empty() {
            trace!(
                transfer = %self.transfer_id,
                expected = index as u16 + 1,
                received = self.received_count,
                "final marker received"
            );
            return;
        }

        let slot = index as usize;
        if !self.is_received(index) {
            self.received_bits[slot / 64] |= 1u64 << (slot % 64);
            self.received_count += 1;
        }
        // Duplicates overwrite: last write wins.
        self.slots[slot] = Some(data.to_vec());
    }

    fn is_received(&self, index: u8) -> bool {
        let slot = index as usize;
        self.received_bits[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    pub fn is_complete(&self) -> bool {
        match self.expected_count {
            Some(expected) => self.final_received && self.received_count == expected,
            None => false,
        }
    }

    /// Fraction complete, as a percentage. Before the FINAL marker fixes the
    /// total, the estimate assumes five fragments seen so far is 100%.
    pub fn progress(&self) -> f64 {
        match self.expected_count {
            Some(expected) if expected > 0 => {
                (self.received_count as f64 / expected as f64) * 100.0
            }
            _ => self.received_count as f64 * 20.0,
        }
    }

    /// Indices still outstanding; empty until the FINAL marker arrives.
    pub fn missing_indices(&self) -> Vec<u8> {
        let Some(expected) = self.expected_count else {
            return Vec::new();
        };
        (0..expected)
            .filter(|&i| !self.is_received(i as u8))
            .map(|i| i as u8)
            .collect()
    }

    /// Concatenate fragments in index order. Only valid once complete.
    fn reassemble(&self) -> Vec<u8> {
        let expected = self.expected_count.unwrap_or(0) as usize;
        let mut out = Vec::new();
        for slot in self.slots.iter().take(expected) {
            if let Some(chunk) = slot {
                out.extend_from_slice(chunk);
            }
        }
        out
    }
}

// ============================================================================
// Transfer Manager
// ============================================================================

/// A finished transfer, handed to the node for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub transfer_id: TransferId,
    pub data: Vec<u8>,
    pub metadata: Metadata,
    pub sender: Option<Address>,
}

/// What one inbound fragment did to its transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    Progress { transfer_id: TransferId, percent: f64 },
    Completed(CompletedTransfer),
}

/// Tracks concurrent in-flight reassemblies with a capacity cap and a
/// per-transfer timeout.
pub struct TransferManager {
    transfers: HashMap<TransferId, TransferState>,
    max_concurrent: usize,
    transfer_timeout_ms: u64,
}

impl TransferManager {
    pub fn new(max_concurrent: usize, transfer_timeout_ms: u64) -> Self {
        Self {
            transfers: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
            transfer_timeout_ms,
        }
    }

    /// Feed one fragment payload through the state machine.
    pub fn handle_fragment(
        &mut self,
        payload: &[u8],
        sender: Option<Address>,
        now_ms: u64,
    ) -> Result<FragmentOutcome, FragmentError> {
        let fragment = Fragmenter::parse(payload)?;
        let transfer_id = fragment.transfer_id;

        if !self.transfers.contains_key(&transfer_id) {
            self.sweep_expired(now_ms);
            if self.transfers.len() >= self.max_concurrent {
                self.evict_oldest();
            }
            self.transfers
                .insert(transfer_id, TransferState::new(transfer_id, sender, now_ms));
        }

        let transfer = self
            .transfers
            .get_mut(&transfer_id)
            .expect("inserted above");
        transfer.add_fragment(fragment.index, fragment.data, fragment.is_final);

        if transfer.is_complete() {
            let stream = transfer.reassemble();
            let (metadata, data) = extract_metadata(&stream);
            let completed = CompletedTransfer {
                transfer_id,
                data: data.to_vec(),
                metadata,
                sender: transfer.sender,
            };
            self.transfers.remove(&transfer_id);
            debug!(
                transfer = %transfer_id,
                bytes = completed.data.len(),
                "transfer complete"
            );
            Ok(FragmentOutcome::Completed(completed))
        } else {
            let percent = transfer.progress();
            Ok(FragmentOutcome::Progress {
                transfer_id,
                percent,
            })
        }
    }

    /// Garbage-collect transfers past the timeout. Returns how many died.
    pub fn sweep_expired(&mut self, now_ms: u64) -> usize {
        let timeout = self.transfer_timeout_ms;
        let before = self.transfers.len();
        self.transfers.retain(|id, t| {
            let alive = now_ms.saturating_sub(t.start_time_ms) <= timeout;
            if !alive {
                debug!(transfer = %id, "transfer timed out");
            }
            alive
        });
        before - self.transfers.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .transfers
            .values()
            .min_by_key(|t| t.start_time_ms)
            .map(|t| t.transfer_id)
        {
            debug!(transfer = %oldest, "evicting oldest transfer at capacity");
            self.transfers.remove(&oldest);
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT_MS: u64 = 60_000;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn fragment_sizes_and_final_flag() {
        let data = vec![0x5A; 1000];
        let (fragments, _) =
            Fragmenter::fragment(&data, &Metadata::new(), 140, 1_000).expect("fragment");

        assert_eq!(fragments.len(), 8); // ceil(1000 / 140)
        for (i, frag) in fragments.iter().enumerate() {
            let parsed = Fragmenter::parse(frag).unwrap();
            assert_eq!(parsed.index as usize, i);
            assert_eq!(parsed.is_final, i == fragments.len() - 1);
        }
        // 7 full fragments + remainder
        assert_eq!(fragments[6].len(), FRAGMENT_HEADER_SIZE + 140);
        assert_eq!(fragments[7].len(), FRAGMENT_HEADER_SIZE + 1000 - 7 * 140);
    }

    #[test]
    fn oversize_and_too_many_fragments_fail_synchronously() {
        let big = vec![0u8; MAX_TRANSFER_SIZE + 1];
        assert!(matches!(
            Fragmenter::fragment(&big, &Metadata::new(), 140, 0),
            Err(FragmentError::Oversize { .. })
        ));

        let data = vec![0u8; 257 * 140];
        assert!(matches!(
            Fragmenter::fragment(&data, &Metadata::new(), 140, 0),
            Err(FragmentError::TooManyFragments { .. })
        ));
    }

    #[test]
    fn transfer_ids_differ_across_sends_of_same_data() {
        let data = b"identical data";
        let (_, id1) = Fragmenter::fragment(data, &Metadata::new(), 140, 1).unwrap();
        let (_, id2) = Fragmenter::fragment(data, &Metadata::new(), 140, 1).unwrap();
        // Same data and timestamp, but an 8-byte random salt separates them.
        assert_ne!(id1, id2);
    }

    #[test]
    fn metadata_round_trip() {
        let metadata = meta(&[("filename", "a.bin"), ("size", "1500"), ("mime_type", "x/y")]);
        let mut stream = encode_metadata(&metadata);
        stream.extend_from_slice(b"payload bytes");

        let (parsed, rest) = extract_metadata(&stream);
        assert_eq!(parsed, metadata);
        assert_eq!(rest, b"payload bytes");
    }

    #[test]
    fn metadata_extraction_is_lenient() {
        // Too short, zero length, and length past the end all pass through.
        assert_eq!(extract_metadata(b"x").1, b"x");
        assert_eq!(extract_metadata(&[0, 0, b'a']).1, &[0, 0, b'a'][..]);
        assert_eq!(extract_metadata(&[0xFF, 0xFF, b'a']).1, &[0xFF, 0xFF, b'a'][..]);
    }

    fn run_reassembly(order: &[usize], fragments: &[Vec<u8>]) -> Option<CompletedTransfer> {
        let mut manager = TransferManager::new(5, TIMEOUT_MS);
        let mut completed = None;
        for &i in order {
            match manager.handle_fragment(&fragments[i], None, 1_000).unwrap() {
                FragmentOutcome::Completed(done) => completed = Some(done),
                FragmentOutcome::Progress { .. } => {}
            }
        }
        completed
    }

    #[test]
    fn reassembly_in_order() {
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        let metadata = meta(&[("filename", "a.bin"), ("size", "1500")]);
        let (fragments, _) = Fragmenter::fragment(&data, &metadata, 140, 7).unwrap();

        let order: Vec<usize> = (0..fragments.len()).collect();
        let done = run_reassembly(&order, &fragments).expect("complete");
        assert_eq!(done.data, data);
        assert_eq!(done.metadata, metadata);
    }

    #[test]
    fn reassembly_in_permuted_order() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();
        let (fragments, _) = Fragmenter::fragment(&data, &Metadata::new(), 140, 7).unwrap();
        let n = fragments.len();

        // Final first, then evens descending, then odds ascending.
        let mut order = vec![n - 1];
        order.extend((0..n - 1).rev().filter(|i| i % 2 == 0));
        order.extend((0..n - 1).filter(|i| i % 2 == 1));

        let done = run_reassembly(&order, &fragments).expect("complete");
        assert_eq!(done.data, data);
    }

    #[test]
    fn duplicate_fragments_overwrite_without_double_count() {
        let data = vec![3u8; 500];
        let (fragments, _) = Fragmenter::fragment(&data, &Metadata::new(), 140, 7).unwrap();

        let mut order: Vec<usize> = (0..fragments.len()).collect();
        order.insert(1, 0); // replay fragment 0
        order.insert(3, 1); // replay fragment 1

        let done = run_reassembly(&order, &fragments).expect("complete");
        assert_eq!(done.data, data);
    }

    #[test]
    fn empty_final_marker_pins_count_without_storing() {
        let mut state = TransferState::new(TransferId::from_bytes([1; 16]), None, 0);
        state.add_fragment(0, b"abc", false);
        state.add_fragment(2, b"", true); // pure marker: expect 3 fragments
        assert!(!state.is_complete());
        assert_eq!(state.missing_indices(), vec![1, 2]);

        state.add_fragment(1, b"def", false);
        state.add_fragment(2, b"ghi", false);
        assert!(state.is_complete());
        assert_eq!(state.reassemble(), b"abcdefghi");
    }

    #[test]
    fn concurrent_transfer_cap_evicts_oldest() {
        let mut manager = TransferManager::new(2, TIMEOUT_MS);

        let make = |tag: u8, now: u64, mgr: &mut TransferManager| {
            let mut payload = vec![tag; 16];
            payload.push(0); // index
            payload.push(0); // flags: not final, keeps transfer open
            payload.extend_from_slice(b"chunk");
            mgr.handle_fragment(&payload, None, now).unwrap();
        };

        make(1, 100, &mut manager);
        make(2, 200, &mut manager);
        make(3, 300, &mut manager); // evicts transfer 1 (oldest)

        assert_eq!(manager.active_transfers(), 2);
    }

    #[test]
    fn stalled_transfers_expire() {
        let mut manager = TransferManager::new(5, TIMEOUT_MS);
        let mut payload = vec![9u8; 16];
        payload.push(0);
        payload.push(0);
        payload.extend_from_slice(b"chunk");
        manager.handle_fragment(&payload, None, 1_000).unwrap();

        assert_eq!(manager.sweep_expired(1_000 + TIMEOUT_MS), 0);
        assert_eq!(manager.sweep_expired(1_001 + TIMEOUT_MS), 1);
        assert_eq!(manager.active_transfers(), 0);
    }
}
