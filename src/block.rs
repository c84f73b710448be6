//! Fixed-size content blocks and the compression offset index.
//!
//! Content is cut into `BLOCK_SIZE` blocks which are compressed
//! independently.  Every run of `ENTRIES_PER_OFFSETRECORD` consecutive blocks
//! is described by one [`CompressionOffsetRecord`]: the absolute offset of the
//! first block plus the biased size (`len - 1`) of each block in the run.
//! Locating any block is therefore O(1) in the number of preceding files.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use crate::codec::{Codec, CodecError};

/// Uncompressed size of one content block.
pub const BLOCK_SIZE: usize = 64 * 1024;
/// Number of blocks indexed by one offset record.
pub const ENTRIES_PER_OFFSETRECORD: usize = 16;

/// Address of a block inside the offset index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub block_index:  u64,
    pub record_index: usize,
    pub entry_index:  usize,
}

/// Map a logical content offset to the block that holds it.
pub fn block_location(content_offset: u64) -> BlockLocation {
    let block_index = content_offset / BLOCK_SIZE as u64;
    BlockLocation {
        block_index,
        record_index: (block_index / ENTRIES_PER_OFFSETRECORD as u64) as usize,
        entry_index:  (block_index % ENTRIES_PER_OFFSETRECORD as u64) as usize,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionOffsetRecord {
    pub base_offset: u64,
    /// Stored block sizes, each equal to the on-disk length minus one.
    pub size:        [u16; ENTRIES_PER_OFFSETRECORD],
}

impl CompressionOffsetRecord {
    pub const SIZE: usize = 8 + 2 * ENTRIES_PER_OFFSETRECORD;

    pub fn new(base_offset: u64) -> Self {
        Self { base_offset, size: [0; ENTRIES_PER_OFFSETRECORD] }
    }

    /// Absolute offset and on-disk length of block `entry` of this record.
    ///
    /// Returns `None` if `entry` is out of range or the offset overflows,
    /// both of which only happen with a corrupt record.
    pub fn block_span(&self, entry: usize) -> Option<(u64, usize)> {
        let stored = *self.size.get(entry)?;
        let mut offset = self.base_offset;
        for s in &self.size[..entry] {
            offset = offset.checked_add(*s as u64 + 1)?;
        }
        Some((offset, stored as usize + 1))
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<BigEndian>(self.base_offset)?;
        for s in &self.size {
            writer.write_u16::<BigEndian>(*s)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let base_offset = reader.read_u64::<BigEndian>()?;
        let mut size = [0u16; ENTRIES_PER_OFFSETRECORD];
        reader.read_u16_into::<BigEndian>(&mut size)?;
        Ok(Self { base_offset, size })
    }
}

/// Result of encoding one block for storage.
#[derive(Debug)]
pub enum EncodedBlock {
    Compressed(Vec<u8>),
    /// Codec output was not smaller than the block; store it verbatim.
    Stored,
}

/// Compress one full (already padded) block.
///
/// Anything the codec cannot shrink below `BLOCK_SIZE` is kept verbatim so
/// that every stored length fits the biased `u16` size field.
pub fn encode_block(codec: &dyn Codec, block: &[u8], level: i32) -> Result<EncodedBlock, CodecError> {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    let packed = codec.compress(block, level)?;
    if packed.is_empty() || packed.len() >= BLOCK_SIZE {
        Ok(EncodedBlock::Stored)
    } else {
        Ok(EncodedBlock::Compressed(packed))
    }
}

/// Decode one stored block into `out` (capacity `BLOCK_SIZE`).
///
/// Blocks the codec rejects are stored-raw content and are copied through
/// unchanged.  Returns the number of valid bytes in `out`.
pub fn decode_block(codec: &dyn Codec, stored: &[u8], out: &mut [u8]) -> usize {
    match codec.decompress_into(stored, out) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(len = stored.len(), error = %e, "block is not compressed, using stored bytes");
            let n = stored.len().min(out.len());
            out[..n].copy_from_slice(&stored[..n]);
            n
        }
    }
}
