//! Packed on-disk block header.
//!
//! Every typed block (SSTable data/index blocks and serialized bloom
//! filters) starts with this 24-byte header:
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────────┬─────────┬─────────────┬──────────┐
//! │ type (4) │ compressed (4) │ uncompressed (4) │ crc (4) │ entries (4) │ rsvd (4) │
//! └──────────┴────────────────┴──────────────────┴─────────┴─────────────┴──────────┘
//! ```
//!
//! All fields are little-endian and the layout is byte-exact: encoding is
//! explicit field-by-field, never a struct cast, so no target can smuggle
//! alignment padding into the format. The CRC covers the header bytes with
//! the CRC field zeroed, followed by the payload.
//!
//! For bloom blocks, `reserved` stores the filter's exact bit count; the
//! bit count is never inferred from payload length on reload.

use concord_core::error::{Error, Result};
use crc32fast::Hasher;

/// Size of the packed block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Block payload type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    /// Sorted key/value records
    Data = 1,
    /// First-key index over data blocks
    Index = 2,
    /// Serialized bloom filter
    Bloom = 3,
}

impl BlockType {
    /// Decode an on-disk type tag.
    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(BlockType::Data),
            2 => Some(BlockType::Index),
            3 => Some(BlockType::Bloom),
            _ => None,
        }
    }
}

/// Packed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload type
    pub block_type: BlockType,
    /// Payload size as stored on disk
    pub compressed_size: u32,
    /// Payload size after decoding (equal until a compressor exists)
    pub uncompressed_size: u32,
    /// CRC32 over header-with-zeroed-crc plus payload
    pub crc32: u32,
    /// Entries in the payload (records, index entries, or inserted keys)
    pub entry_count: u32,
    /// Type-specific field; bloom blocks store the exact bit count here
    pub reserved: u32,
}

impl BlockHeader {
    /// Serialize to exactly [`BLOCK_HEADER_SIZE`] bytes.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&(self.block_type as u32).to_le_bytes());
        bytes[4..8].copy_from_slice(&self.compressed_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.entry_count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        bytes
    }

    /// Deserialize from exactly [`BLOCK_HEADER_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(Error::Corruption("truncated block header".into()));
        }
        let tag = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let block_type = BlockType::from_u32(tag)
            .ok_or_else(|| Error::Corruption(format!("unknown block type {}", tag)))?;
        Ok(BlockHeader {
            block_type,
            compressed_size: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            uncompressed_size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            crc32: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            entry_count: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            reserved: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }
}

/// Frame a payload into `header ++ payload` with the CRC filled in.
pub fn seal_block(
    block_type: BlockType,
    entry_count: u32,
    reserved: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut header = BlockHeader {
        block_type,
        compressed_size: payload.len() as u32,
        uncompressed_size: payload.len() as u32,
        crc32: 0,
        entry_count,
        reserved,
    };
    header.crc32 = block_crc(&header, payload);
    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse and verify a framed block; returns the header and payload slice.
pub fn open_block(bytes: &[u8]) -> Result<(BlockHeader, &[u8])> {
    let header = BlockHeader::from_bytes(bytes)?;
    let end = BLOCK_HEADER_SIZE + header.compressed_size as usize;
    if bytes.len() < end {
        return Err(Error::Corruption(format!(
            "block payload truncated: want {} bytes, have {}",
            end,
            bytes.len()
        )));
    }
    let payload = &bytes[BLOCK_HEADER_SIZE..end];
    let computed = block_crc(&header, payload);
    if computed != header.crc32 {
        return Err(Error::Corruption(format!(
            "block checksum mismatch: stored {:08x}, computed {:08x}",
            header.crc32, computed
        )));
    }
    Ok((header, payload))
}

/// CRC over the header with its CRC field zeroed, then the payload.
pub fn block_crc(header: &BlockHeader, payload: &[u8]) -> u32 {
    let mut zeroed = *header;
    zeroed.crc32 = 0;
    let mut hasher = Hasher::new();
    hasher.update(&zeroed.to_bytes());
    hasher.update(payload);
    hasher.finalize()
}
