//! 160-bit object identity.
//!
//! [`ObjectId`] is the SHA-1 name of a Git object, held as five 32-bit
//! words rather than a 20-byte array so that the hottest comparison and
//! hashing paths (used by [`crate::oid_map::ObjectIdMap`] during pack and
//! revision walks) avoid a byte-at-a-time loop.

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Write};

use crate::error::{OdbError, Result};

/// Number of raw bytes in a SHA-1 object id.
pub const RAW_LEN: usize = 20;
/// Number of hex characters in the textual form of an object id.
pub const HEX_LEN: usize = 40;

/// Immutable 160-bit SHA-1 object identity.
///
/// Stored as five big-endian 32-bit words (`w1..w5`); `w1` is the natural
/// hash key, equality compares all five words, and ordering is unsigned
/// lexicographic on the underlying bytes (equivalent to comparing the
/// words in order, since each word preserves byte order within itself).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId {
    w1: u32,
    w2: u32,
    w3: u32,
    w4: u32,
    w5: u32,
}

impl ObjectId {
    /// The all-zero id, used as a sentinel and as the base case in some
    /// delta/ref-resolution paths.
    pub const NULL: ObjectId = ObjectId { w1: 0, w2: 0, w3: 0, w4: 0, w5: 0 };

    /// Build an id from 20 raw bytes starting at `off`.
    pub fn from_raw(bytes: &[u8], off: usize) -> Self {
        let b = &bytes[off..off + RAW_LEN];
        Self {
            w1: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            w2: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            w3: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            w4: u32::from_be_bytes([b[12], b[13], b[14], b[15]]),
            w5: u32::from_be_bytes([b[16], b[17], b[18], b[19]]),
        }
    }

    /// Build an id from an owned 20-byte array.
    pub fn from_bytes(bytes: [u8; RAW_LEN]) -> Self {
        Self::from_raw(&bytes, 0)
    }

    /// Build an id from a completed SHA-1 digest.
    pub fn from_sha1(digest: sha1::digest::Output<sha1::Sha1>) -> Self {
        let mut bytes = [0u8; RAW_LEN];
        bytes.copy_from_slice(&digest);
        Self::from_bytes(bytes)
    }

    /// Parse a 40-character lower-case hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        if !Self::is_hex_id(s) {
            return Err(OdbError::CorruptObject(format!("not a valid object id: {s}")));
        }
        let mut bytes = [0u8; RAW_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).unwrap();
        }
        Ok(Self::from_bytes(bytes))
    }

    /// True if `s` is exactly 40 lower-case hex digits.
    pub fn is_hex_id(s: &str) -> bool {
        s.len() == HEX_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// The first word, used as the hash key by [`crate::oid_map::ObjectIdMap`].
    pub fn hash_word(&self) -> u32 {
        self.w1
    }

    /// The first byte, used to index pack index fan-out tables.
    pub fn first_byte(&self) -> u8 {
        (self.w1 >> 24) as u8
    }

    pub fn as_bytes(&self) -> [u8; RAW_LEN] {
        let mut out = [0u8; RAW_LEN];
        out[0..4].copy_from_slice(&self.w1.to_be_bytes());
        out[4..8].copy_from_slice(&self.w2.to_be_bytes());
        out[8..12].copy_from_slice(&self.w3.to_be_bytes());
        out[12..16].copy_from_slice(&self.w4.to_be_bytes());
        out[16..20].copy_from_slice(&self.w5.to_be_bytes());
        out
    }

    /// 40-character lower-case hex form.
    pub fn name(&self) -> String {
        let bytes = self.as_bytes();
        let mut s = String::with_capacity(HEX_LEN);
        for b in bytes {
            use fmt::Write as _;
            write!(s, "{b:02x}").unwrap();
        }
        s
    }

    pub fn copy_raw_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.as_bytes())
    }

    pub fn copy_hex_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(self.name().as_bytes())
    }

    /// The loose-object path fragment `<first2>/<remaining38>`.
    pub fn loose_path(&self) -> (String, String) {
        let name = self.name();
        (name[..2].to_owned(), name[2..].to_owned())
    }

    fn words(&self) -> [u32; 5] {
        [self.w1, self.w2, self.w3, self.w4, self.w5]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.name())
    }
}

impl std::hash::Hash for ObjectId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Equality covers all five words; hashing only the first is
        // sufficient and keeps the common case (std collections, not the
        // segmented `ObjectIdMap`) to a single word read.
        state.write_u32(self.w1);
    }
}

/// A truncated [`ObjectId`] prefix, as produced by `git rev-parse` style
/// abbreviation. `nibbles` is the number of significant hex digits, in
/// `[2, 40]`; only the top `nibbles * 4` bits of the underlying words are
/// meaningful.
#[derive(Clone, Copy)]
pub struct AbbreviatedObjectId {
    words: [u32; 5],
    nibbles: u8,
}

impl AbbreviatedObjectId {
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() < 2 || s.len() > HEX_LEN {
            return Err(OdbError::CorruptObject(format!(
                "abbreviated id must be 2-40 hex digits, got {}",
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(OdbError::CorruptObject(format!("not valid hex: {s}")));
        }

        let mut padded = s.to_owned();
        padded.push_str(&"0".repeat(HEX_LEN - s.len()));
        let full = ObjectId::from_hex(&padded)?;
        Ok(Self { words: full.words(), nibbles: s.len() as u8 })
    }

    pub fn nibbles(&self) -> u8 {
        self.nibbles
    }

    /// The first byte, for indexing pack index fan-out tables the same
    /// way [`ObjectId::first_byte`] does. Every abbreviation carries at
    /// least 2 significant nibbles, so this byte is always fully known.
    pub fn first_byte(&self) -> u8 {
        (self.words[0] >> 24) as u8
    }

    /// The full id this abbreviation would denote if its insignificant
    /// tail nibbles were all zero. Used as a representative id when an
    /// abbreviation resolves to no match at all.
    pub fn zero_padded(&self) -> ObjectId {
        ObjectId { w1: self.words[0], w2: self.words[1], w3: self.words[2], w4: self.words[3], w5: self.words[4] }
    }

    /// Compare this prefix against a full id, considering only the
    /// significant nibbles.
    pub fn prefix_compare(&self, full: &ObjectId) -> Ordering {
        let significant_bits = self.nibbles as u32 * 4;
        let full_words = full.words();
        for i in 0..5 {
            let word_start = i as u32 * 32;
            if significant_bits <= word_start {
                break;
            }
            let bits_in_word = (significant_bits - word_start).min(32);
            let mask: u32 = if bits_in_word == 32 {
                u32::MAX
            } else {
                u32::MAX << (32 - bits_in_word)
            };
            let a = self.words[i] & mask;
            let b = full_words[i] & mask;
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    pub fn matches(&self, full: &ObjectId) -> bool {
        self.prefix_compare(full) == Ordering::Equal
    }
}

impl fmt::Display for AbbreviatedObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = ObjectId { w1: self.words[0], w2: self.words[1], w3: self.words[2], w4: self.words[3], w5: self.words[4] };
        f.write_str(&full.name()[..self.nibbles as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = ObjectId::from_hex("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        assert_eq!(id.name(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(ObjectId::from_hex(&id.name()).unwrap(), id);
    }

    #[test]
    fn is_hex_id_roundtrips() {
        let s = "ce013625030ba8dba906f756967f9e9ca394464a";
        assert!(ObjectId::is_hex_id(s));
        assert!(ObjectId::from_hex(s).is_ok());
        assert!(!ObjectId::is_hex_id("too-short"));
        assert!(!ObjectId::is_hex_id(&s.to_uppercase()));
    }

    #[test]
    fn ordering_is_byte_lexicographic() {
        let a = ObjectId::from_hex("000000000000000000000000000000000000000a").unwrap();
        let b = ObjectId::from_hex("000000000000000000000000000000000000000b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn abbreviation_prefix_matches() {
        let empty_tree = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
        let id = ObjectId::from_hex(empty_tree).unwrap();

        let abbrev = AbbreviatedObjectId::from_hex("4b825d").unwrap();
        assert!(abbrev.matches(&id));

        let other = ObjectId::from_hex("000000000000000000000000000000000000000a").unwrap();
        assert!(!abbrev.matches(&other));
    }

    #[test]
    fn abbreviation_prefix_compare_orders_correctly() {
        let id = ObjectId::from_hex("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let abbrev = AbbreviatedObjectId::from_hex("ce0136").unwrap();
        assert_eq!(abbrev.prefix_compare(&id), Ordering::Equal);

        let lower = AbbreviatedObjectId::from_hex("ce0135").unwrap();
        assert_eq!(lower.prefix_compare(&id), Ordering::Less);

        let higher = AbbreviatedObjectId::from_hex("ce0137").unwrap();
        assert_eq!(higher.prefix_compare(&id), Ordering::Greater);
    }
}
