//! Content hashing: quickXorHash, sha1, sha256
//!
//! Personal OneDrive drives verify content with Microsoft's quickXorHash; a
//! non-cryptographic 160-bit checksum. Business drives report sha1Hash
//! and/or sha256Hash instead. [`HashStream`] computes all three in one pass
//! so a single read of the file yields whatever the remote side can compare
//! against.
//!
//! ## quickXorHash
//!
//! The input is treated as a bit stream folded into a 160-bit lane: each
//! byte is XORed in at a position that advances by 11 bits per byte, wrapping
//! at 160. The total input length is XORed into the final 8 bytes. The
//! result is the 20-byte lane, base64-encoded.

use base64::Engine as _;
use sha1::{Digest as _, Sha1};
use sha2::Sha256;

use crate::domain::item::ContentHashes;

/// Width of the hash lane in bits
const WIDTH_IN_BITS: usize = 160;

/// Bit advance per input byte
const SHIFT: usize = 11;

// ============================================================================
// QuickXorHasher
// ============================================================================

/// Streaming quickXorHash state
///
/// The 160-bit lane is held as three u64 cells; the third cell only uses its
/// low 32 bits, matching the reference layout, with overflow bits discarded
/// at finalization.
#[derive(Debug, Clone)]
pub struct QuickXorHasher {
    data: [u64; 3],
    shift_so_far: usize,
    length: u64,
}

impl QuickXorHasher {
    /// Create a fresh hasher
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0; 3],
            shift_so_far: 0,
            length: 0,
        }
    }

    /// Absorb a block of input
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let cell = self.shift_so_far / 64;
            let offset = self.shift_so_far % 64;
            let cell_bits = if cell == 2 { 32 } else { 64 };

            self.data[cell] ^= (b as u64) << offset;
            if offset > cell_bits - 8 {
                // The byte straddles a cell boundary; spill the high bits
                // into the next cell (wrapping from the last back to the first).
                let next = if cell == 2 { 0 } else { cell + 1 };
                let low = cell_bits - offset;
                self.data[next] ^= (b as u64) >> low;
            }

            self.shift_so_far = (self.shift_so_far + SHIFT) % WIDTH_IN_BITS;
        }
        self.length = self.length.wrapping_add(bytes.len() as u64);
    }

    /// Finish and return the raw 20-byte digest
    #[must_use]
    pub fn finalize_bytes(self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..8].copy_from_slice(&self.data[0].to_le_bytes());
        out[8..16].copy_from_slice(&self.data[1].to_le_bytes());
        out[16..20].copy_from_slice(&self.data[2].to_le_bytes()[..4]);

        // Fold the input length into the trailing 8 bytes
        let length_bytes = self.length.to_le_bytes();
        for (i, lb) in length_bytes.iter().enumerate() {
            out[12 + i] ^= lb;
        }
        out
    }

    /// Finish and return the base64 form the Graph API reports
    #[must_use]
    pub fn finalize_base64(self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.finalize_bytes())
    }
}

impl Default for QuickXorHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot quickXorHash of a byte slice, base64-encoded
#[must_use]
pub fn quick_xor_hash(data: &[u8]) -> String {
    let mut hasher = QuickXorHasher::new();
    hasher.update(data);
    hasher.finalize_base64()
}

// ============================================================================
// HashStream
// ============================================================================

/// Computes quickXorHash, sha1, and sha256 over a single pass of input
///
/// Used when downloading (verify against whichever hash the remote supplied)
/// and when scanning local files (populate the cache with everything a
/// future comparison might need).
pub struct HashStream {
    quick_xor: QuickXorHasher,
    sha1: Sha1,
    sha256: Sha256,
    bytes_seen: u64,
}

impl HashStream {
    /// Create a fresh stream
    #[must_use]
    pub fn new() -> Self {
        Self {
            quick_xor: QuickXorHasher::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            bytes_seen: 0,
        }
    }

    /// Absorb a block of input into all three hashers
    pub fn update(&mut self, bytes: &[u8]) {
        self.quick_xor.update(bytes);
        self.sha1.update(bytes);
        self.sha256.update(bytes);
        self.bytes_seen += bytes.len() as u64;
    }

    /// Total bytes absorbed so far
    #[must_use]
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Finish and return the complete hash set
    #[must_use]
    pub fn finalize(self) -> ContentHashes {
        ContentHashes {
            quick_xor: Some(self.quick_xor.finalize_base64()),
            sha1: Some(hex_upper(&self.sha1.finalize())),
            sha256: Some(hex_upper(&self.sha256.finalize())),
        }
    }
}

impl Default for HashStream {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot full hash set of a byte slice
#[must_use]
pub fn hash_all(data: &[u8]) -> ContentHashes {
    let mut stream = HashStream::new();
    stream.update(data);
    stream.finalize()
}

/// Uppercase hex, the form the Graph API uses for sha1Hash/sha256Hash
fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_xor_empty() {
        // 20 zero bytes in base64
        assert_eq!(quick_xor_hash(b""), "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    }

    #[test]
    fn test_quick_xor_single_byte() {
        // 'a' = 0x61 lands in byte 0; length 1 is XORed at byte 12
        assert_eq!(quick_xor_hash(b"a"), "YQAAAAAAAAAAAAAAAQAAAAAAAAA=");
    }

    #[test]
    fn test_quick_xor_chunked_equals_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();

        let one_shot = quick_xor_hash(&data);

        let mut hasher = QuickXorHasher::new();
        for chunk in data.chunks(977) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize_base64(), one_shot);
    }

    #[test]
    fn test_quick_xor_length_sensitivity() {
        // Same XOR pattern, different lengths: must differ because the
        // length is folded into the tail
        let a = quick_xor_hash(&[0u8; 160]);
        let b = quick_xor_hash(&[0u8; 320]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_quick_xor_content_sensitivity() {
        assert_ne!(quick_xor_hash(b"hello world"), quick_xor_hash(b"hello worle"));
    }

    #[test]
    fn test_quick_xor_output_length() {
        // 20 bytes -> 28 base64 chars with one pad
        let h = quick_xor_hash(b"some content");
        assert_eq!(h.len(), 28);
        assert!(h.ends_with('='));
    }

    #[test]
    fn test_sha_hashes_well_known_vectors() {
        let hashes = hash_all(b"abc");
        assert_eq!(
            hashes.sha1.as_deref(),
            Some("A9993E364706816ABA3E25717850C26C9CD0D89D")
        );
        assert_eq!(
            hashes.sha256.as_deref(),
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")
        );
    }

    #[test]
    fn test_hash_stream_tracks_length() {
        let mut stream = HashStream::new();
        stream.update(b"12345");
        stream.update(b"678");
        assert_eq!(stream.bytes_seen(), 8);
    }

    #[test]
    fn test_hash_all_is_comparable_to_itself() {
        let a = hash_all(b"same bytes");
        let b = hash_all(b"same bytes");
        assert_eq!(a.matches(&b), Some(true));
    }

    #[test]
    fn test_hash_all_detects_difference() {
        let a = hash_all(b"same bytes");
        let b = hash_all(b"other bytes");
        assert_eq!(a.matches(&b), Some(false));
    }
}
