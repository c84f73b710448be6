//! Archive footer: the fixed-size trailer that locates every metadata section.
//!
//! The footer is the last `FOOTER_SIZE` bytes of the logical archive stream.
//! Readers locate it with a negative offset from end-of-stream, so the rest of
//! the layout never needs a known start position.
//!
//! # Layout (56 bytes, big-endian)
//! ```text
//! magic:u32  version:u32
//! file_tree      { offset:u64, size:u64 }
//! names          { offset:u64, size:u64 }
//! offset_records { offset:u64, size:u64 }
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAGIC:   u32 = 0x169F_52D6;
pub const VERSION: u32 = 0x61BF_3A01;

/// Serialized size of [`Footer`] in bytes.
pub const FOOTER_SIZE: usize = 4 + 4 + 3 * SectionInfo::SIZE;

#[derive(Error, Debug)]
pub enum FooterError {
    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported version: {0:#010x}")]
    UnsupportedVersion(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Byte range of one metadata section within the archive stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionInfo {
    pub offset: u64,
    pub size:   u64,
}

impl SectionInfo {
    pub const SIZE: usize = 16;

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the section, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u64::<BigEndian>(self.size)?;
        Ok(())
    }

    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            offset: reader.read_u64::<BigEndian>()?,
            size:   reader.read_u64::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub magic:          u32,
    pub version:        u32,
    pub file_tree:      SectionInfo,
    pub names:          SectionInfo,
    pub offset_records: SectionInfo,
}

impl Default for Footer {
    fn default() -> Self {
        Self::new()
    }
}

impl Footer {
    pub fn new() -> Self {
        Self {
            magic:          MAGIC,
            version:        VERSION,
            file_tree:      SectionInfo::default(),
            names:          SectionInfo::default(),
            offset_records: SectionInfo::default(),
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.magic)?;
        writer.write_u32::<BigEndian>(self.version)?;
        self.file_tree.write(&mut writer)?;
        self.names.write(&mut writer)?;
        self.offset_records.write(&mut writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        // Writing into a correctly sized slice cannot fail.
        let _ = self.write(&mut buf[..]);
        buf
    }

    /// Parse and validate a footer. Magic and version must match exactly.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, FooterError> {
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(FooterError::InvalidMagic(magic));
        }
        let version = reader.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(FooterError::UnsupportedVersion(version));
        }
        Ok(Self {
            magic,
            version,
            file_tree:      SectionInfo::read(&mut reader)?,
            names:          SectionInfo::read(&mut reader)?,
            offset_records: SectionInfo::read(&mut reader)?,
        })
    }
}
