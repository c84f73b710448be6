use std::io::{self, SeekFrom, Write};
use std::ops::Range;
use serde::Serialize;
use thiserror::Error;

use super::ArchiveSource;
use crate::block::{block_location, decode_block, CompressionOffsetRecord, BLOCK_SIZE};
use crate::codec::{Codec, ZstdCodec};
use crate::footer::{Footer, FooterError, SectionInfo, FOOTER_SIZE};
use crate::index::{decode_names, path_components, FileTreeNode, NameTableError, NO_NAME};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Footer error: {0}")]
    Footer(#[from] FooterError),
    #[error("Archive of {0} bytes is too small to hold a footer")]
    ArchiveTooSmall(u64),
    #[error("{section} section ({offset}+{size}) lies outside the archive ({limit} bytes)")]
    SectionOutOfBounds { section: &'static str, offset: u64, size: u64, limit: u64 },
    #[error("{section} section size {size} is not a multiple of {unit}")]
    TruncatedSection { section: &'static str, size: u64, unit: usize },
    #[error("Name table error: {0}")]
    Names(#[from] NameTableError),
    #[error("File tree has no root directory")]
    InvalidRoot,
    #[error("Offset record {record} out of range ({count} loaded)")]
    RecordOutOfRange { record: usize, count: usize },
    #[error("Offset record {record} is corrupt")]
    CorruptOffsetRecord { record: usize },
    #[error("Content offset overflows at file offset {0}")]
    OffsetOverflow(u64),
    #[error("Block {block} decoded to {produced} bytes, {needed} required")]
    ShortBlock { block: u64, produced: usize, needed: usize },
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One file as reported by [`ArchiveReader::list_files`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path:   String,
    pub size:   u64,
    /// Logical content offset of the file's first block.
    pub offset: u64,
}

/// Random-access archive reader.
///
/// Construction loads and validates all metadata; afterwards the tree, names
/// and offset records are immutable.  Extraction reuses one scratch buffer,
/// so a reader serves one caller at a time; open one reader per thread for
/// parallel extraction.
pub struct ArchiveReader<S: ArchiveSource> {
    source:            S,
    codec:             Box<dyn Codec>,
    footer:            Footer,
    file_tree:         Vec<FileTreeNode>,
    names:             Vec<String>,
    offset_records:    Vec<CompressionOffsetRecord>,
    compressed_buffer: Vec<u8>,
    decompress_buffer: Vec<u8>,
}

impl<S: ArchiveSource> ArchiveReader<S> {
    pub fn open(source: S) -> Result<Self, ReadError> {
        Self::with_codec(source, Box::new(ZstdCodec))
    }

    /// Open an archive, validating the footer and loading FileTree,
    /// NameTable and OffsetRecords in that order.  Any failure drops every
    /// partially loaded structure.
    pub fn with_codec(mut source: S, codec: Box<dyn Codec>) -> Result<Self, ReadError> {
        let len = source.len()?;
        if len < FOOTER_SIZE as u64 {
            return Err(ReadError::ArchiveTooSmall(len));
        }
        let mut raw = [0u8; FOOTER_SIZE];
        source.read_exact_at(SeekFrom::End(-(FOOTER_SIZE as i64)), &mut raw)?;
        let footer = Footer::read(&raw[..]).map_err(|e| {
            tracing::warn!(error = %e, "footer validation failed");
            e
        })?;
        let limit = len - FOOTER_SIZE as u64;

        let tree_bytes = read_section(&mut source, "file tree", footer.file_tree, limit)?;
        let file_tree = parse_records(&tree_bytes, "file tree", FileTreeNode::SIZE, |b| FileTreeNode::read(b))?;
        if !matches!(file_tree.first(), Some(FileTreeNode::Directory { .. })) {
            return Err(ReadError::InvalidRoot);
        }

        let name_bytes = read_section(&mut source, "name table", footer.names, limit)?;
        let names = decode_names(&name_bytes)?;

        let record_bytes = read_section(&mut source, "offset records", footer.offset_records, limit)?;
        let offset_records = parse_records(
            &record_bytes,
            "offset records",
            CompressionOffsetRecord::SIZE,
            |b| CompressionOffsetRecord::read(b),
        )?;

        tracing::debug!(
            nodes = file_tree.len(),
            names = names.len(),
            records = offset_records.len(),
            "archive metadata loaded"
        );
        Ok(Self {
            source,
            codec,
            footer,
            file_tree,
            names,
            offset_records,
            compressed_buffer: Vec::with_capacity(BLOCK_SIZE),
            decompress_buffer: vec![0u8; BLOCK_SIZE],
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn node_count(&self) -> usize {
        self.file_tree.len()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn record_count(&self) -> usize {
        self.offset_records.len()
    }

    // ── Traversal ────────────────────────────────────────────────────────────

    /// Every reachable file, depth-first from the root.
    ///
    /// Damaged branches (name or child references out of range, nodes
    /// reachable twice) are skipped; the rest of the tree is still listed.
    pub fn list_files(&self) -> Vec<FileEntry> {
        let mut files = Vec::new();
        let mut queued = vec![false; self.file_tree.len()];
        let mut stack: Vec<(usize, String)> = vec![(0, String::new())];
        queued[0] = true;

        while let Some((idx, prefix)) = stack.pop() {
            let node = self.file_tree[idx];
            let name = match self.node_name(&node) {
                Some(n) => n,
                None => {
                    tracing::warn!(node = idx, name = node.name(), "name index out of range, skipping branch");
                    continue;
                }
            };
            let path = if prefix.is_empty() { name.to_owned() } else { format!("{prefix}/{name}") };
            match node {
                FileTreeNode::File { content_offset, content_size, .. } => {
                    files.push(FileEntry { path, size: content_size, offset: content_offset });
                }
                FileTreeNode::Directory { .. } => {
                    for child in self.child_range(idx, &node).rev() {
                        if std::mem::replace(&mut queued[child], true) {
                            tracing::warn!(node = child, parent = idx, "node reachable twice, skipping");
                            continue;
                        }
                        stack.push((child, path.clone()));
                    }
                }
            }
        }
        files
    }

    /// Resolve `path` to a file.  Corrupt references along the way make that
    /// branch a non-match rather than an error.
    pub fn lookup(&self, path: &str) -> Option<FileEntry> {
        let parts: Vec<&str> = path_components(path).collect();
        if parts.is_empty() {
            return None;
        }
        let mut cur = 0usize;
        for (i, part) in parts.iter().enumerate() {
            let want_file = i + 1 == parts.len();
            let node = self.file_tree[cur];
            cur = self.child_range(cur, &node).find(|&child| {
                let c = self.file_tree[child];
                if c.is_file() != want_file {
                    return false;
                }
                match self.node_name(&c) {
                    Some(name) => name == *part,
                    None => {
                        tracing::warn!(node = child, name = c.name(), "name index out of range");
                        false
                    }
                }
            })?;
        }
        match self.file_tree[cur] {
            FileTreeNode::File { content_offset, content_size, .. } => Some(FileEntry {
                path:   parts.join("/"),
                size:   content_size,
                offset: content_offset,
            }),
            FileTreeNode::Directory { .. } => None,
        }
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    /// Write the full contents of `path` to `out`, returning the byte count.
    pub fn extract_file<W: Write>(&mut self, path: &str, out: &mut W) -> Result<u64, ReadError> {
        let entry = self.lookup(path).ok_or_else(|| ReadError::NotFound(path.to_owned()))?;
        self.extract_entry(&entry, out)
    }

    /// Return the full contents of `path`.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ReadError> {
        let entry = self.lookup(path).ok_or_else(|| ReadError::NotFound(path.to_owned()))?;
        let mut out = Vec::with_capacity(entry.size.min(64 * BLOCK_SIZE as u64) as usize);
        self.extract_entry(&entry, &mut out)?;
        Ok(out)
    }

    /// Decode `entry` block by block.  Each block is looked up directly in
    /// the offset index and contributes however many bytes it decodes to, up
    /// to what the file still needs; the rest of the last block is padding.
    /// The content offset always advances by a full `BLOCK_SIZE`.
    pub fn extract_entry<W: Write>(&mut self, entry: &FileEntry, out: &mut W) -> Result<u64, ReadError> {
        let mut remaining = entry.size;
        let mut offset = entry.offset;
        while remaining > 0 {
            let produced = self.load_block(offset)?;
            let take = remaining.min(produced as u64) as usize;
            out.write_all(&self.decompress_buffer[..take])?;
            remaining -= take as u64;
            if remaining > 0 {
                offset = offset.checked_add(BLOCK_SIZE as u64)
                    .ok_or(ReadError::OffsetOverflow(entry.size - remaining))?;
            }
        }
        Ok(entry.size)
    }

    /// Random-access read of `buf.len()` bytes starting `offset` bytes into
    /// `entry`.  Only the blocks covering the range are decoded.  Returns the
    /// number of bytes copied, short only at end of file.
    ///
    /// File offsets map linearly onto blocks here, so a block that decodes
    /// to less than the range needs from it is an error.
    pub fn read_at(&mut self, entry: &FileEntry, offset: u64, buf: &mut [u8]) -> Result<usize, ReadError> {
        let block_size = BLOCK_SIZE as u64;
        let mut copied = 0usize;
        let mut pos = offset;
        while copied < buf.len() && pos < entry.size {
            let skip = (pos % block_size) as usize;
            let block_start = entry.offset.checked_add(pos - skip as u64)
                .ok_or(ReadError::OffsetOverflow(pos))?;
            let want = (buf.len() - copied)
                .min(BLOCK_SIZE - skip)
                .min((entry.size - pos).min(usize::MAX as u64) as usize);

            let produced = self.load_block(block_start)?;
            if produced < skip + want {
                return Err(ReadError::ShortBlock {
                    block: block_location(block_start).block_index,
                    produced,
                    needed: skip + want,
                });
            }
            buf[copied..copied + want].copy_from_slice(&self.decompress_buffer[skip..skip + want]);
            copied += want;
            pos += want as u64;
        }
        Ok(copied)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn node_name(&self, node: &FileTreeNode) -> Option<&str> {
        match node.name() {
            NO_NAME => Some(""),
            i => self.names.get(i as usize).map(String::as_str),
        }
    }

    /// In-range child indices of a directory node.
    fn child_range(&self, idx: usize, node: &FileTreeNode) -> Range<usize> {
        let children = node.children();
        let len = self.file_tree.len() as u64;
        if children.end > len {
            tracing::warn!(
                node = idx,
                skipped = children.end - children.start.max(len),
                "child index out of range, skipping"
            );
        }
        children.start.min(len) as usize..children.end.min(len) as usize
    }

    /// Fetch and decode the block holding `content_offset` into the scratch
    /// buffer.  Returns the number of decoded bytes.
    fn load_block(&mut self, content_offset: u64) -> Result<usize, ReadError> {
        let loc = block_location(content_offset);
        let count = self.offset_records.len();
        let record = self.offset_records.get(loc.record_index)
            .ok_or(ReadError::RecordOutOfRange { record: loc.record_index, count })?;
        let (offset, len) = record.block_span(loc.entry_index)
            .ok_or(ReadError::CorruptOffsetRecord { record: loc.record_index })?;

        self.compressed_buffer.resize(len, 0);
        self.source.read_exact_at(SeekFrom::Start(offset), &mut self.compressed_buffer)?;
        let produced = decode_block(self.codec.as_ref(), &self.compressed_buffer, &mut self.decompress_buffer);
        tracing::trace!(block = loc.block_index, offset, len, produced, "block decoded");
        Ok(produced)
    }
}

/// Read one metadata section after checking it lies before the footer.
fn read_section<S: ArchiveSource>(
    source:  &mut S,
    section: &'static str,
    info:    SectionInfo,
    limit:   u64,
) -> Result<Vec<u8>, ReadError> {
    let out_of_bounds = || ReadError::SectionOutOfBounds { section, offset: info.offset, size: info.size, limit };
    match info.end() {
        Some(end) if end <= limit => {}
        _ => return Err(out_of_bounds()),
    }
    let size = usize::try_from(info.size).map_err(|_| out_of_bounds())?;
    let mut buf = vec![0u8; size];
    source.read_exact_at(SeekFrom::Start(info.offset), &mut buf)?;
    Ok(buf)
}

fn parse_records<T>(
    bytes:   &[u8],
    section: &'static str,
    unit:    usize,
    parse:   impl Fn(&[u8]) -> io::Result<T>,
) -> Result<Vec<T>, ReadError> {
    if bytes.len() % unit != 0 {
        return Err(ReadError::TruncatedSection { section, size: bytes.len() as u64, unit });
    }
    bytes.chunks_exact(unit).map(|chunk| parse(chunk).map_err(ReadError::from)).collect()
}
