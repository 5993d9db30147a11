//! WAL segment and record formats.
//!
//! WAL segments are named `wal-NNNNNN.log` where `NNNNNN` is a
//! zero-padded segment number.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (16 bytes)          │
//! ├────────────────────────────────────┤
//! │ Entry 1                            │
//! ├────────────────────────────────────┤
//! │ Entry 2                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Entry Layout (packed, little-endian)
//!
//! ```text
//! ┌─────────┬──────────┬─────────────┬─────────────┬─────┬───────┬───────────┐
//! │ seq (8) │ kind (1) │ key_len (4) │ val_len (4) │ key │ value │ crc32 (4) │
//! └─────────┴──────────┴─────────────┴─────────────┴─────┴───────┴───────────┘
//! ```
//!
//! The CRC is computed over the entire entry with the CRC field zeroed,
//! which on this layout is simply the CRC of everything before it.
//! Encoding is explicit field-by-field; no struct is ever written
//! directly, so alignment padding cannot leak into the format.

use concord_core::error::{Error, Result};
use concord_core::types::OpKind;
use crc32fast::Hasher;

/// Magic bytes identifying a WAL segment file: "CKWL"
pub const SEGMENT_MAGIC: [u8; 4] = *b"CKWL";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Fixed prefix of every entry: seq + kind + key_len + val_len
pub const ENTRY_FIXED_SIZE: usize = 8 + 1 + 4 + 4;

/// WAL segment header (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "CKWL"
    pub magic: [u8; 4],
    /// Format version for forward compatibility
    pub format_version: u32,
    /// Segment number (monotonically increasing)
    pub segment_number: u64,
}

impl SegmentHeader {
    /// Header for a new segment.
    pub fn new(segment_number: u64) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_number,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_number.to_le_bytes());
        bytes
    }

    /// Deserialize and validate magic/version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(Error::Corruption("truncated segment header".into()));
        }
        let header = SegmentHeader {
            magic: bytes[0..4].try_into().expect("sliced to width"),
            format_version: u32::from_le_bytes(bytes[4..8].try_into().expect("sliced to width")),
            segment_number: u64::from_le_bytes(bytes[8..16].try_into().expect("sliced to width")),
        };
        if header.magic != SEGMENT_MAGIC {
            return Err(Error::Corruption("bad segment magic".into()));
        }
        if header.format_version != SEGMENT_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported segment format version {}",
                header.format_version
            )));
        }
        Ok(header)
    }
}

/// One WAL entry.
///
/// `value` is `None` for kinds that carry no value (Delete and the
/// transaction markers); an empty `Some` is a legal empty value and the
/// two are distinguished by the op kind on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Strictly monotonic sequence number
    pub seq: u64,
    /// Operation kind
    pub kind: OpKind,
    /// Key bytes
    pub key: Vec<u8>,
    /// Value bytes, when the kind carries one
    pub value: Option<Vec<u8>>,
}

impl WalEntry {
    /// Whether this op kind carries a value payload.
    fn kind_has_value(kind: OpKind) -> bool {
        matches!(kind, OpKind::Put | OpKind::Update)
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let value = self.value.as_deref().unwrap_or(&[]);
        let mut out =
            Vec::with_capacity(ENTRY_FIXED_SIZE + self.key.len() + value.len() + 4);
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(value);
        let mut hasher = Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    /// Deserialize one entry from the front of `bytes`.
    ///
    /// Returns `(entry, bytes_consumed)`. `Ok(None)` means the buffer
    /// holds only part of an entry (a torn tail after a crash); a CRC
    /// mismatch is `Corruption`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        if bytes.len() < ENTRY_FIXED_SIZE {
            return Ok(None);
        }
        let seq = u64::from_le_bytes(bytes[0..8].try_into().expect("sliced to width"));
        let kind_code = bytes[8];
        let key_len =
            u32::from_le_bytes(bytes[9..13].try_into().expect("sliced to width")) as usize;
        let val_len =
            u32::from_le_bytes(bytes[13..17].try_into().expect("sliced to width")) as usize;
        let total = ENTRY_FIXED_SIZE + key_len + val_len + 4;
        if bytes.len() < total {
            return Ok(None);
        }
        let kind = OpKind::from_u8(kind_code)
            .ok_or_else(|| Error::Corruption(format!("unknown wal op kind {}", kind_code)))?;

        let body = &bytes[..total - 4];
        let stored_crc =
            u32::from_le_bytes(bytes[total - 4..total].try_into().expect("sliced to width"));
        let mut hasher = Hasher::new();
        hasher.update(body);
        let computed = hasher.finalize();
        if computed != stored_crc {
            return Err(Error::Corruption(format!(
                "wal entry checksum mismatch at seq {}: stored {:08x}, computed {:08x}",
                seq, stored_crc, computed
            )));
        }

        let key = bytes[ENTRY_FIXED_SIZE..ENTRY_FIXED_SIZE + key_len].to_vec();
        let value_bytes = bytes[ENTRY_FIXED_SIZE + key_len..total - 4].to_vec();
        let value = if Self::kind_has_value(kind) {
            Some(value_bytes)
        } else {
            None
        };
        Ok(Some((WalEntry { seq, kind, key, value }, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_segment_header_roundtrip() {
        let header = SegmentHeader::new(42);
        let parsed = SegmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_segment_header_rejects_bad_magic() {
        let mut bytes = SegmentHeader::new(1).to_bytes();
        bytes[0] = b'X';
        assert!(SegmentHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = WalEntry {
            seq: 7,
            kind: OpKind::Put,
            key: b"user:1001".to_vec(),
            value: Some(b"zhang".to_vec()),
        };
        let bytes = entry.to_bytes();
        let (parsed, consumed) = WalEntry::from_bytes(&bytes).unwrap().unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_delete_entry_has_no_value() {
        let entry = WalEntry {
            seq: 8,
            kind: OpKind::Delete,
            key: b"k".to_vec(),
            value: None,
        };
        let (parsed, _) = WalEntry::from_bytes(&entry.to_bytes()).unwrap().unwrap();
        assert_eq!(parsed.value, None);
    }

    #[test]
    fn test_empty_value_is_distinct_from_none() {
        let entry = WalEntry {
            seq: 9,
            kind: OpKind::Put,
            key: b"k".to_vec(),
            value: Some(Vec::new()),
        };
        let (parsed, _) = WalEntry::from_bytes(&entry.to_bytes()).unwrap().unwrap();
        assert_eq!(parsed.value, Some(Vec::new()));
    }

    #[test]
    fn test_torn_tail_is_not_corruption() {
        let entry = WalEntry {
            seq: 1,
            kind: OpKind::Put,
            key: b"key".to_vec(),
            value: Some(b"value".to_vec()),
        };
        let bytes = entry.to_bytes();
        for cut in 0..bytes.len() {
            let result = WalEntry::from_bytes(&bytes[..cut]).unwrap();
            assert!(result.is_none(), "partial entry at {} parsed", cut);
        }
    }

    #[test]
    fn test_flipped_bit_is_corruption() {
        let entry = WalEntry {
            seq: 1,
            kind: OpKind::Put,
            key: b"key".to_vec(),
            value: Some(b"value".to_vec()),
        };
        let mut bytes = entry.to_bytes();
        bytes[20] ^= 0x40;
        assert!(WalEntry::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_entries_parse_in_sequence() {
        let entries = vec![
            WalEntry {
                seq: 1,
                kind: OpKind::Put,
                key: b"a".to_vec(),
                value: Some(b"1".to_vec()),
            },
            WalEntry {
                seq: 2,
                kind: OpKind::Delete,
                key: b"a".to_vec(),
                value: None,
            },
            WalEntry {
                seq: 3,
                kind: OpKind::TxnCommit,
                key: Vec::new(),
                value: None,
            },
        ];
        let mut buf = Vec::new();
        for e in &entries {
            buf.extend_from_slice(&e.to_bytes());
        }
        let mut offset = 0;
        for expected in &entries {
            let (parsed, consumed) = WalEntry::from_bytes(&buf[offset..]).unwrap().unwrap();
            assert_eq!(&parsed, expected);
            offset += consumed;
        }
        assert_eq!(offset, buf.len());
    }

    proptest! {
        #[test]
        fn prop_entry_roundtrip(
            seq in any::<u64>(),
            key in proptest::collection::vec(any::<u8>(), 0..128),
            value in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let entry = WalEntry { seq, kind: OpKind::Put, key, value: Some(value) };
            let bytes = entry.to_bytes();
            let (parsed, consumed) = WalEntry::from_bytes(&bytes).unwrap().unwrap();
            prop_assert_eq!(parsed, entry);
            prop_assert_eq!(consumed, bytes.len());
        }
    }
}
