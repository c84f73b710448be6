//! Directory tree and name table: the two metadata sections that map paths
//! to content ranges.
//!
//! # FileTree
//! A flat array of fixed-size [`FileTreeNode`]s.  Index 0 is the unnamed root
//! directory; a directory's children are the contiguous run
//! `child_start .. child_start + child_count`.
//!
//! Each node is 20 bytes, big-endian:
//! ```text
//! type_and_name:u32   bit 31 = file, bits 0..31 = name index (NO_NAME = none)
//! file:      content_offset:u64  content_size:u64
//! directory: child_start:u32  child_count:u32  reserved:u64
//! ```
//!
//! # NameTable
//! Length-prefixed UTF-8 strings addressed by insertion position.  Lengths
//! below 128 use one header byte; longer names set the high bit and spill the
//! upper bits into a second byte, giving a 15-bit length.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Name index meaning "no name" (only the root uses it).
pub const NO_NAME: u32 = 0x7FFF_FFFF;
/// Longest name the two-byte length header can express.
pub const MAX_NAME_LENGTH: usize = 0x7FFF;

const FILE_FLAG: u32 = 0x8000_0000;

// ── FileTree ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTreeNode {
    File {
        name:           u32,
        content_offset: u64,
        content_size:   u64,
    },
    Directory {
        name:        u32,
        child_start: u32,
        child_count: u32,
    },
}

impl FileTreeNode {
    pub const SIZE: usize = 20;

    pub fn name(&self) -> u32 {
        match *self {
            FileTreeNode::File { name, .. } | FileTreeNode::Directory { name, .. } => name,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FileTreeNode::File { .. })
    }

    /// Indices of this node's children (empty for files).
    pub fn children(&self) -> std::ops::Range<u64> {
        match *self {
            FileTreeNode::File { .. } => 0..0,
            FileTreeNode::Directory { child_start, child_count, .. } => {
                child_start as u64..child_start as u64 + child_count as u64
            }
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match *self {
            FileTreeNode::File { name, content_offset, content_size } => {
                writer.write_u32::<BigEndian>(FILE_FLAG | (name & NO_NAME))?;
                writer.write_u64::<BigEndian>(content_offset)?;
                writer.write_u64::<BigEndian>(content_size)?;
            }
            FileTreeNode::Directory { name, child_start, child_count } => {
                writer.write_u32::<BigEndian>(name & NO_NAME)?;
                writer.write_u32::<BigEndian>(child_start)?;
                writer.write_u32::<BigEndian>(child_count)?;
                writer.write_u64::<BigEndian>(0)?;
            }
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let type_and_name = reader.read_u32::<BigEndian>()?;
        let name = type_and_name & NO_NAME;
        if type_and_name & FILE_FLAG != 0 {
            Ok(FileTreeNode::File {
                name,
                content_offset: reader.read_u64::<BigEndian>()?,
                content_size:   reader.read_u64::<BigEndian>()?,
            })
        } else {
            let child_start = reader.read_u32::<BigEndian>()?;
            let child_count = reader.read_u32::<BigEndian>()?;
            let _reserved = reader.read_u64::<BigEndian>()?;
            Ok(FileTreeNode::Directory { name, child_start, child_count })
        }
    }
}

// ── NameTable ────────────────────────────────────────────────────────────────

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameTableError {
    #[error("Truncated length header at offset {offset}")]
    TruncatedHeader { offset: usize },
    #[error("Name of {length} bytes at offset {offset} runs past end of table")]
    NameOutOfBounds { offset: usize, length: usize },
    #[error("Name of {0} bytes exceeds the 32767-byte limit")]
    NameTooLong(usize),
}

/// Append one length-prefixed name to `out`.
pub fn encode_name(name: &[u8], out: &mut Vec<u8>) -> Result<(), NameTableError> {
    let len = name.len();
    if len > MAX_NAME_LENGTH {
        return Err(NameTableError::NameTooLong(len));
    }
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.push(0x80 | (len & 0x7F) as u8);
        out.push((len >> 7) as u8);
    }
    out.extend_from_slice(name);
    Ok(())
}

/// Decode a serialized name table into its entries, in slot order.
///
/// Names are kept as raw bytes converted lossily; an archive with invalid
/// UTF-8 still lists and extracts.
pub fn decode_names(data: &[u8]) -> Result<Vec<String>, NameTableError> {
    let mut names = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let header = data[offset];
        let length = if header & 0x80 != 0 {
            let hi = *data.get(offset + 1)
                .ok_or(NameTableError::TruncatedHeader { offset })?;
            offset += 2;
            (header & 0x7F) as usize | (hi as usize) << 7
        } else {
            offset += 1;
            header as usize
        };
        let name = data.get(offset..offset + length)
            .ok_or(NameTableError::NameOutOfBounds { offset, length })?;
        names.push(String::from_utf8_lossy(name).into_owned());
        offset += length;
    }
    Ok(names)
}

// ── Paths ────────────────────────────────────────────────────────────────────

/// Split an archive path into its components.
///
/// Both `/` and `\` separate components; empty components are dropped.
pub fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split(|c: char| c == '/' || c == '\\').filter(|c| !c.is_empty())
}
