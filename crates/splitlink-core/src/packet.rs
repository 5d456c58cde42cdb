//! Packetizer — splits a payload into bounded, base64-armored packets.
//!
//! Two modes, matching the two things a source can ship:
//!
//! - **Byte-string mode** (split layer 0): the raw input file is sliced
//!   into consecutive `max_packet_bytes` chunks, each armored separately.
//!   The element count is the total armored character count.
//! - **Numeric mode**: the flattened element sequence is walked in
//!   permuted order and grouped into blocks of [`SPLIT_BLOCK_ELEMENTS`];
//!   each block becomes one packet. Block i carries permuted elements
//!   `[i*L, (i+1)*L)`, which is what lets the receiver invert the
//!   permutation from the sequence number alone.
//!
//! Splitting is deterministic: the same payload, mode, and seed always
//! produce byte-identical packet boundaries.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::permute::permutation;
use crate::settings::SplitMode;

/// Elements per numeric-mode packet.
pub const SPLIT_BLOCK_ELEMENTS: usize = 2000;

/// A packet payload ready for the wire, paired with its dense sequence
/// number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub payload: String,
}

/// The packetizer's output: the packet sequence plus the counts the
/// ResultSummary declares ahead of the transfer.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    pub packets: Vec<Packet>,
    pub packet_count: u32,
    pub element_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("max packet size must be non-zero")]
    ZeroPacketSize,

    #[error("packet payload is not valid base64: {0}")]
    BadArmor(#[from] base64::DecodeError),

    #[error("block payload is truncated ({0} trailing bytes)")]
    TruncatedBlock(usize),

    #[error("block header declares {declared} elements but {actual} are present")]
    BlockCountMismatch { declared: usize, actual: usize },
}

// ── Byte-string mode ──────────────────────────────────────────────────────────

/// Slice raw bytes into armored chunks of at most `max_packet_bytes` input
/// bytes each. The last chunk may be shorter.
pub fn split_bytes(data: &[u8], max_packet_bytes: usize) -> Result<SplitPlan, SplitError> {
    if max_packet_bytes == 0 {
        return Err(SplitError::ZeroPacketSize);
    }

    let mut packets = Vec::with_capacity(data.len().div_ceil(max_packet_bytes));
    let mut element_count = 0u64;
    for (i, chunk) in data.chunks(max_packet_bytes).enumerate() {
        let payload = BASE64.encode(chunk);
        element_count += payload.len() as u64;
        packets.push(Packet {
            sequence: i as u32,
            payload,
        });
    }

    Ok(SplitPlan {
        packet_count: packets.len() as u32,
        element_count,
        packets,
    })
}

/// Invert [`split_bytes`]: decode the armored chunks in sequence order and
/// concatenate. Missing chunks (None) are skipped — byte-mode transfers
/// only complete at 100%, so this path only sees gaps on a timed-out
/// window.
pub fn join_bytes(chunks: &[Option<String>]) -> Result<Vec<u8>, SplitError> {
    let mut data = Vec::new();
    for chunk in chunks.iter().flatten() {
        data.extend_from_slice(&BASE64.decode(chunk)?);
    }
    Ok(data)
}

// ── Numeric mode ──────────────────────────────────────────────────────────────

/// Group flattened elements into permuted-order blocks, one packet per
/// block.
pub fn split_elements(values: &[f32], mode: SplitMode, seed: u64) -> SplitPlan {
    let n = values.len();
    let table = permutation(mode, seed, n);

    let mut packets = Vec::with_capacity(n.div_ceil(SPLIT_BLOCK_ELEMENTS).max(1));
    let mut block = Vec::with_capacity(SPLIT_BLOCK_ELEMENTS.min(n));
    for start in (0..n).step_by(SPLIT_BLOCK_ELEMENTS) {
        block.clear();
        for &idx in &table[start..(start + SPLIT_BLOCK_ELEMENTS).min(n)] {
            block.push(values[idx]);
        }
        packets.push(Packet {
            sequence: (start / SPLIT_BLOCK_ELEMENTS) as u32,
            payload: encode_block(&block),
        });
    }

    SplitPlan {
        packet_count: packets.len() as u32,
        element_count: n as u64,
        packets,
    }
}

/// Encode one element block: `[u32 LE count][f32 LE × count]`, armored.
pub fn encode_block(values: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(4 + values.len() * 4);
    bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode one armored element block.
pub fn decode_block(armored: &str) -> Result<Vec<f32>, SplitError> {
    let bytes = BASE64.decode(armored)?;
    if bytes.len() < 4 {
        return Err(SplitError::TruncatedBlock(bytes.len()));
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() % 4 != 0 {
        return Err(SplitError::TruncatedBlock(body.len() % 4));
    }
    let actual = body.len() / 4;
    if declared != actual {
        return Err(SplitError::BlockCountMismatch { declared, actual });
    }

    Ok(body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
