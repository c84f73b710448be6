//! Block codec adapter.
//!
//! The container never interprets compressed bytes itself; it hands whole
//! blocks to a [`Codec`] and gets bytes (or a failure) back.  Only Zstandard
//! is ever written by default, but the trait keeps the seam open for tests
//! and store-only archives.
//!
//! A decode failure is not fatal to the container: the block reader treats
//! undecodable blocks as verbatim content (see `block::decode_block`).

use std::io;
use thiserror::Error;

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Codec used by the writer for new blocks.  Never stored in the archive;
/// readers identify stored-raw blocks by decode failure alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Zstd,
}

impl CodecId {
    /// Human-readable name (for diagnostics only; never parsed from disk).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Zstd => "zstd",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "store" => Some(CodecId::None),
            "zstd"           => Some(CodecId::Zstd),
            _                => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// Decode `data` into `out`, returning the number of bytes produced.
    /// Fails if the input is invalid or would not fit in `out`.
    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<usize, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<usize, CodecError> {
        let cap = out.len();
        let dst = out.get_mut(..data.len()).ok_or_else(|| {
            CodecError::Decompression(format!("{} bytes exceed buffer of {}", data.len(), cap))
        })?;
        dst.copy_from_slice(data);
        Ok(data.len())
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress_into(&self, data: &[u8], out: &mut [u8]) -> Result<usize, CodecError> {
        zstd::bulk::decompress_to_buffer(data, out)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Zstd => Box::new(ZstdCodec),
    }
}
