//! SSTable: immutable sorted on-disk tables.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Data block 0 (header + records)    │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! ├────────────────────────────────────┤
//! │ Index block (first key per block)  │
//! ├────────────────────────────────────┤
//! │ Bloom block (exact bit count in    │
//! │   the header reserved field)       │
//! ├────────────────────────────────────┤
//! │ Footer (64 bytes, written last)    │
//! └────────────────────────────────────┘
//! ```
//!
//! Every block reuses the packed 24-byte header from
//! `concord_storage::block`. The footer is byte-exact at 64 bytes,
//! encoded field-by-field (never a struct cast), and its CRC is computed
//! with the CRC field zeroed.
//!
//! # Record encoding (inside a data block payload)
//!
//! ```text
//! ┌─────────────┬─────────────┬─────────┬──────────┬─────┬───────┐
//! │ key_len (4) │ val_len (4) │ seq (8) │ tomb (1) │ key │ value │
//! └─────────────┴─────────────┴─────────┴──────────┴─────┴───────┘
//! ```

use concord_core::error::{Error, Result};
use concord_storage::block::{open_block, seal_block, BlockType, BLOCK_HEADER_SIZE};
use concord_storage::bloom::{BloomFilter, BloomHashKind};
use crc32fast::Hasher;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic identifying an SSTable footer: "CKST"
pub const SSTABLE_MAGIC: u32 = u32::from_le_bytes(*b"CKST");

/// Current SSTable format version
pub const SSTABLE_FORMAT_VERSION: u32 = 1;

/// Size of the packed footer in bytes
pub const FOOTER_SIZE: usize = 64;

/// One versioned record in an SSTable. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstEntry {
    /// Record key
    pub key: Vec<u8>,
    /// Sequence that produced this version
    pub seq: u64,
    /// Value, or `None` for a tombstone
    pub value: Option<Vec<u8>>,
}

/// Packed SSTable footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Magic: "CKST"
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Index block file offset
    pub index_offset: u64,
    /// Index block total size (header + payload)
    pub index_size: u32,
    /// Bloom block file offset
    pub bloom_offset: u64,
    /// Bloom block total size (header + payload)
    pub bloom_size: u32,
    /// Smallest sequence in the table
    pub min_seq: u64,
    /// Largest sequence in the table
    pub max_seq: u64,
    /// Record count
    pub entry_count: u64,
    /// CRC over the footer with this field zeroed
    pub crc32: u32,
}

impl Footer {
    /// Serialize to exactly [`FOOTER_SIZE`] bytes.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.index_offset.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.index_size.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.bloom_offset.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.bloom_size.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.min_seq.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.max_seq.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.entry_count.to_le_bytes());
        // bytes[56..60] reserved, always zero
        bytes[60..64].copy_from_slice(&self.crc32.to_le_bytes());
        bytes
    }

    /// Deserialize and fully validate (magic, version, CRC).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_SIZE {
            return Err(Error::Corruption("truncated sstable footer".into()));
        }
        let footer = Footer {
            magic: u32::from_le_bytes(bytes[0..4].try_into().expect("sliced to width")),
            version: u32::from_le_bytes(bytes[4..8].try_into().expect("sliced to width")),
            index_offset: u64::from_le_bytes(bytes[8..16].try_into().expect("sliced to width")),
            index_size: u32::from_le_bytes(bytes[16..20].try_into().expect("sliced to width")),
            bloom_offset: u64::from_le_bytes(bytes[20..28].try_into().expect("sliced to width")),
            bloom_size: u32::from_le_bytes(bytes[28..32].try_into().expect("sliced to width")),
            min_seq: u64::from_le_bytes(bytes[32..40].try_into().expect("sliced to width")),
            max_seq: u64::from_le_bytes(bytes[40..48].try_into().expect("sliced to width")),
            entry_count: u64::from_le_bytes(bytes[48..56].try_into().expect("sliced to width")),
            crc32: u32::from_le_bytes(bytes[60..64].try_into().expect("sliced to width")),
        };
        if footer.magic != SSTABLE_MAGIC {
            return Err(Error::Corruption("bad sstable magic".into()));
        }
        if footer.version != SSTABLE_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported sstable version {}",
                footer.version
            )));
        }
        let computed = footer.compute_crc();
        if computed != footer.crc32 {
            return Err(Error::Corruption(format!(
                "footer checksum mismatch: stored {:08x}, computed {:08x}",
                footer.crc32, computed
            )));
        }
        Ok(footer)
    }

    /// CRC over the serialized footer with the CRC field zeroed.
    pub fn compute_crc(&self) -> u32 {
        let mut zeroed = *self;
        zeroed.crc32 = 0;
        let mut hasher = Hasher::new();
        hasher.update(&zeroed.to_bytes());
        hasher.finalize()
    }
}

fn encode_record(entry: &SstEntry, out: &mut Vec<u8>) {
    let value = entry.value.as_deref().unwrap_or(&[]);
    out.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(&entry.seq.to_le_bytes());
    out.push(u8::from(entry.value.is_none()));
    out.extend_from_slice(&entry.key);
    out.extend_from_slice(value);
}

fn decode_records(payload: &[u8], expected: usize) -> Result<Vec<SstEntry>> {
    let mut entries = Vec::with_capacity(expected);
    let mut offset = 0;
    while offset < payload.len() {
        if payload.len() - offset < 17 {
            return Err(Error::Corruption("truncated sstable record".into()));
        }
        let key_len = u32::from_le_bytes(
            payload[offset..offset + 4].try_into().expect("sliced to width"),
        ) as usize;
        let val_len = u32::from_le_bytes(
            payload[offset + 4..offset + 8].try_into().expect("sliced to width"),
        ) as usize;
        let seq = u64::from_le_bytes(
            payload[offset + 8..offset + 16].try_into().expect("sliced to width"),
        );
        let tomb = payload[offset + 16] != 0;
        let key_start = offset + 17;
        let val_start = key_start + key_len;
        let end = val_start + val_len;
        if payload.len() < end {
            return Err(Error::Corruption("sstable record overruns block".into()));
        }
        let key = payload[key_start..val_start].to_vec();
        let value = if tomb {
            None
        } else {
            Some(payload[val_start..end].to_vec())
        };
        entries.push(SstEntry { key, seq, value });
        offset = end;
    }
    if entries.len() != expected {
        return Err(Error::Corruption(format!(
            "block entry count mismatch: header says {}, decoded {}",
            expected,
            entries.len()
        )));
    }
    Ok(entries)
}

/// Index entry: first key of a data block plus its file location.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    size: u32,
}

fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        out.extend_from_slice(&(e.first_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&e.offset.to_le_bytes());
        out.extend_from_slice(&e.size.to_le_bytes());
        out.extend_from_slice(&e.first_key);
    }
    out
}

fn decode_index(payload: &[u8], expected: usize) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::with_capacity(expected);
    let mut offset = 0;
    while offset < payload.len() {
        if payload.len() - offset < 16 {
            return Err(Error::Corruption("truncated index entry".into()));
        }
        let key_len = u32::from_le_bytes(
            payload[offset..offset + 4].try_into().expect("sliced to width"),
        ) as usize;
        let file_offset = u64::from_le_bytes(
            payload[offset + 4..offset + 12].try_into().expect("sliced to width"),
        );
        let size = u32::from_le_bytes(
            payload[offset + 12..offset + 16].try_into().expect("sliced to width"),
        );
        let end = offset + 16 + key_len;
        if payload.len() < end {
            return Err(Error::Corruption("index entry overruns block".into()));
        }
        entries.push(IndexEntry {
            first_key: payload[offset + 16..end].to_vec(),
            offset: file_offset,
            size,
        });
        offset = end;
    }
    if entries.len() != expected {
        return Err(Error::Corruption("index entry count mismatch".into()));
    }
    Ok(entries)
}

/// Write a complete SSTable from sorted entries.
///
/// Entries must be sorted by key with at most one version per key; the
/// caller (flush or compaction) guarantees that. The footer goes last,
/// and the file is synced before return.
pub fn write_sstable(
    path: &Path,
    entries: &[SstEntry],
    block_bytes: usize,
    bloom_fp_rate: f64,
) -> Result<Footer> {
    if entries.is_empty() {
        return Err(Error::InvalidArg("refusing to write an empty sstable".into()));
    }
    debug_assert!(entries.windows(2).all(|w| w[0].key < w[1].key));

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    let mut offset = 0u64;
    let mut index = Vec::new();

    // Data blocks at the target payload size.
    let mut block_payload = Vec::with_capacity(block_bytes);
    let mut block_first_key: Option<Vec<u8>> = None;
    let mut block_count = 0u32;
    for entry in entries {
        if block_first_key.is_none() {
            block_first_key = Some(entry.key.clone());
        }
        encode_record(entry, &mut block_payload);
        block_count += 1;
        if block_payload.len() >= block_bytes {
            let framed = seal_block(BlockType::Data, block_count, 0, &block_payload);
            file.write_all(&framed)?;
            index.push(IndexEntry {
                first_key: block_first_key.take().ok_or_else(|| {
                    Error::Corruption("data block without a first key".into())
                })?,
                offset,
                size: framed.len() as u32,
            });
            offset += framed.len() as u64;
            block_payload.clear();
            block_count = 0;
        }
    }
    if !block_payload.is_empty() {
        let framed = seal_block(BlockType::Data, block_count, 0, &block_payload);
        file.write_all(&framed)?;
        index.push(IndexEntry {
            first_key: block_first_key
                .take()
                .ok_or_else(|| Error::Corruption("data block without a first key".into()))?,
            offset,
            size: framed.len() as u32,
        });
        offset += framed.len() as u64;
    }

    // Index block.
    let index_payload = encode_index(&index);
    let index_framed = seal_block(BlockType::Index, index.len() as u32, 0, &index_payload);
    let index_offset = offset;
    file.write_all(&index_framed)?;
    offset += index_framed.len() as u64;

    // Bloom block over every key.
    let mut bloom = BloomFilter::new(
        entries.len() as u64,
        bloom_fp_rate,
        BloomHashKind::auto(entries.len() as u64),
    )?;
    for entry in entries {
        bloom.insert(&entry.key);
    }
    let bloom_framed = bloom.serialize_block();
    let bloom_offset = offset;
    file.write_all(&bloom_framed)?;

    // Footer last: its presence implies everything before it is complete.
    let mut footer = Footer {
        magic: SSTABLE_MAGIC,
        version: SSTABLE_FORMAT_VERSION,
        index_offset,
        index_size: index_framed.len() as u32,
        bloom_offset,
        bloom_size: bloom_framed.len() as u32,
        min_seq: entries.iter().map(|e| e.seq).min().unwrap_or(0),
        max_seq: entries.iter().map(|e| e.seq).max().unwrap_or(0),
        entry_count: entries.len() as u64,
        crc32: 0,
    };
    footer.crc32 = footer.compute_crc();
    file.write_all(&footer.to_bytes())?;
    file.sync_all()?;
    Ok(footer)
}

/// Open SSTable: footer-validated, index and bloom resident in memory.
pub struct SSTableReader {
    path: PathBuf,
    footer: Footer,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    file: Mutex<File>,
}

impl SSTableReader {
    /// Open and validate a table: footer, index block, bloom block.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_SIZE as u64 {
            return Err(Error::Corruption("sstable smaller than its footer".into()));
        }
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_bytes = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::from_bytes(&footer_bytes)?;
        if (footer.index_size as usize) < BLOCK_HEADER_SIZE
            || (footer.bloom_size as usize) < BLOCK_HEADER_SIZE
        {
            return Err(Error::Corruption(
                "footer block sizes smaller than a block header".into(),
            ));
        }

        let mut index_bytes = vec![0u8; footer.index_size as usize];
        file.seek(SeekFrom::Start(footer.index_offset))?;
        file.read_exact(&mut index_bytes)?;
        let (index_header, index_payload) = open_block(&index_bytes)?;
        if index_header.block_type != BlockType::Index {
            return Err(Error::Corruption("index block has wrong type".into()));
        }
        let index = decode_index(index_payload, index_header.entry_count as usize)?;

        let mut bloom_bytes = vec![0u8; footer.bloom_size as usize];
        file.seek(SeekFrom::Start(footer.bloom_offset))?;
        file.read_exact(&mut bloom_bytes)?;
        let bloom = BloomFilter::deserialize_block(&bloom_bytes)?;

        Ok(SSTableReader {
            path: path.to_path_buf(),
            footer,
            index,
            bloom,
            file: Mutex::new(file),
        })
    }

    /// Table footer.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest key in the table.
    pub fn first_key(&self) -> &[u8] {
        self.index
            .first()
            .map(|e| e.first_key.as_slice())
            .unwrap_or(&[])
    }

    /// Point lookup: bloom gate, index binary search, block decode,
    /// in-block binary search.
    pub fn get(&self, key: &[u8]) -> Result<Option<SstEntry>> {
        if !self.bloom.might_contain(key) {
            return Ok(None);
        }
        // Last block whose first key is <= the probe.
        let slot = self.index.partition_point(|e| e.first_key.as_slice() <= key);
        if slot == 0 {
            return Ok(None);
        }
        let entry = &self.index[slot - 1];
        let entries = self.read_block(entry)?;
        Ok(entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
            .map(|i| entries[i].clone()))
    }

    /// Every record in the table, in key order.
    pub fn scan(&self) -> Result<Vec<SstEntry>> {
        let mut out = Vec::with_capacity(self.footer.entry_count as usize);
        for entry in &self.index {
            out.extend(self.read_block(entry)?);
        }
        Ok(out)
    }

    fn read_block(&self, entry: &IndexEntry) -> Result<Vec<SstEntry>> {
        let mut buf = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut buf)?;
        }
        let (header, payload) = open_block(&buf)?;
        if header.block_type != BlockType::Data {
            return Err(Error::Corruption("data block has wrong type".into()));
        }
        decode_records(payload, header.entry_count as usize)
    }
}
