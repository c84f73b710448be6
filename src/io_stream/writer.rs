use std::collections::{HashMap, VecDeque};
use std::io;
use thiserror::Error;

use super::ArchiveSink;
use crate::block::{encode_block, CompressionOffsetRecord, EncodedBlock, BLOCK_SIZE, ENTRIES_PER_OFFSETRECORD};
use crate::codec::{get_codec, Codec, CodecError, CodecId, ZstdCodec};
use crate::footer::{Footer, SectionInfo};
use crate::index::{encode_name, path_components, FileTreeNode, NameTableError, MAX_NAME_LENGTH, NO_NAME};

/// Default Zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Configuration for [`ArchiveWriter::with_options`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub codec:         CodecId,
    pub level:         i32,
    /// Start a new output part whenever the current one reaches this many
    /// bytes.  `None` (or zero) writes a single part.
    pub max_part_size: Option<u64>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            codec:         CodecId::Zstd,
            level:         DEFAULT_COMPRESSION_LEVEL,
            max_part_size: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Invalid archive path: {0:?}")]
    InvalidPath(String),
    #[error("Path already exists: {0}")]
    PathExists(String),
    #[error("Parent directory missing for: {0}")]
    ParentMissing(String),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("No file is open for appending")]
    NoOpenFile,
    #[error("Too many entries for the file tree")]
    TooManyEntries,
    /// An earlier block failed to reach the sink; the archive is incomplete.
    #[error("Writer is unusable after an earlier write failure")]
    Failed,
    /// A block that must be stored verbatim happens to decode as compressed
    /// data, so a reader could not tell it apart.
    #[error("Block {block} cannot be stored unambiguously")]
    AmbiguousStoredBlock { block: u64 },
    #[error("Name table error: {0}")]
    Name(#[from] NameTableError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── In-memory tree ───────────────────────────────────────────────────────────

enum PendingNode {
    File {
        name:           u32,
        content_offset: u64,
        content_size:   u64,
    },
    Directory {
        name:     u32,
        children: Vec<usize>,
        lookup:   HashMap<String, usize>,
    },
}

impl PendingNode {
    fn directory(name: u32) -> Self {
        PendingNode::Directory { name, children: Vec::new(), lookup: HashMap::new() }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, WriteError> {
    let parts: Vec<&str> = path_components(path).collect();
    if parts.is_empty() || parts.iter().any(|c| *c == "." || *c == "..") {
        return Err(WriteError::InvalidPath(path.to_owned()));
    }
    if let Some(long) = parts.iter().find(|c| c.len() > MAX_NAME_LENGTH) {
        return Err(NameTableError::NameTooLong(long.len()).into());
    }
    Ok(parts)
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Single-pass archive writer.
///
/// Content blocks are streamed to the sink as soon as they fill; only the
/// metadata is held in memory.  [`finalize`](Self::finalize) consumes the
/// writer, so nothing can be appended after the footer.
pub struct ArchiveWriter<S: ArchiveSink> {
    sink:           S,
    options:        WriterOptions,
    codec:          Box<dyn Codec>,
    /// Codec a reader will try first; used to reject ambiguous stored blocks.
    probe:          ZstdCodec,
    probe_buffer:   Vec<u8>,

    nodes:          Vec<PendingNode>,
    names:          Vec<u8>,
    name_slots:     HashMap<String, u32>,
    offset_records: Vec<CompressionOffsetRecord>,

    block_buffer:   Vec<u8>,
    block_count:    u64,
    open_file:      Option<usize>,
    /// Logical content offset of the next block.
    content_offset: u64,
    /// Bytes emitted to the sink so far (across all parts).
    written:        u64,
    part_index:     u32,
    part_written:   u64,
    failed:         bool,
}

impl<S: ArchiveSink> ArchiveWriter<S> {
    pub fn new(sink: S) -> Result<Self, WriteError> {
        Self::with_options(sink, WriterOptions::default())
    }

    pub fn with_options(mut sink: S, mut options: WriterOptions) -> Result<Self, WriteError> {
        options.max_part_size = options.max_part_size.filter(|&m| m > 0);
        sink.begin_part(0)?;
        let codec = get_codec(options.codec);
        tracing::debug!(
            codec = codec.codec_id().name(),
            level = options.level,
            max_part_size = ?options.max_part_size,
            "archive writer created"
        );
        Ok(Self {
            sink,
            codec,
            options,
            probe:          ZstdCodec,
            probe_buffer:   vec![0u8; BLOCK_SIZE],
            nodes:          vec![PendingNode::directory(NO_NAME)],
            names:          Vec::new(),
            name_slots:     HashMap::new(),
            offset_records: Vec::new(),
            block_buffer:   Vec::with_capacity(BLOCK_SIZE),
            block_count:    0,
            open_file:      None,
            content_offset: 0,
            written:        0,
            part_index:     0,
            part_written:   0,
            failed:         false,
        })
    }

    /// Bytes written to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Number of output parts begun so far.
    pub fn part_count(&self) -> u32 {
        self.part_index + 1
    }

    // ── File ingestion ───────────────────────────────────────────────────────

    /// Open a new file at `path`; subsequent [`append_data`](Self::append_data)
    /// calls fill it.  Missing parent directories are created.  The previously
    /// open file, if any, is closed first.
    pub fn start_new_file(&mut self, path: &str) -> Result<(), WriteError> {
        self.ensure_usable()?;
        let parts = split_path(path)?;
        let (leaf, parents) = match parts.split_last() {
            Some(split) => split,
            None => return Err(WriteError::InvalidPath(path.to_owned())),
        };
        let parent = self.resolve_dir(parents, true, path)?;
        if self.child(parent, leaf).is_some() {
            return Err(WriteError::PathExists(path.to_owned()));
        }

        self.close_file()?;
        let name = self.intern_name(leaf)?;
        let node = PendingNode::File {
            name,
            content_offset: self.content_offset,
            content_size:   0,
        };
        let idx = self.add_child(parent, leaf, node)?;
        tracing::debug!(path, content_offset = self.content_offset, "start file");
        self.open_file = Some(idx);
        Ok(())
    }

    /// Append content to the open file.
    pub fn append_data(&mut self, mut data: &[u8]) -> Result<(), WriteError> {
        self.ensure_usable()?;
        let idx = self.open_file.ok_or(WriteError::NoOpenFile)?;
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_buffer.len()).min(data.len());
            self.block_buffer.extend_from_slice(&data[..take]);
            if let PendingNode::File { content_size, .. } = &mut self.nodes[idx] {
                *content_size += take as u64;
            }
            data = &data[take..];
            if self.block_buffer.len() == BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    /// Convenience: `start_new_file` followed by one `append_data`.
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> Result<(), WriteError> {
        self.start_new_file(path)?;
        self.append_data(data)
    }

    /// Create a directory.  With `recursive`, missing parents are created;
    /// otherwise a missing parent is an error.  An existing directory at
    /// `path` is not an error.
    pub fn make_dir(&mut self, path: &str, recursive: bool) -> Result<(), WriteError> {
        self.ensure_usable()?;
        let parts = split_path(path)?;
        let (leaf, parents) = match parts.split_last() {
            Some(split) => split,
            None => return Err(WriteError::InvalidPath(path.to_owned())),
        };
        let parent = self.resolve_dir(parents, recursive, path)?;
        match self.child(parent, leaf) {
            Some(i) => match self.nodes[i] {
                PendingNode::Directory { .. } => Ok(()),
                PendingNode::File { .. } => Err(WriteError::PathExists(path.to_owned())),
            },
            None => {
                let name = self.intern_name(leaf)?;
                self.add_child(parent, leaf, PendingNode::directory(name))?;
                Ok(())
            }
        }
    }

    // ── Finalization ─────────────────────────────────────────────────────────

    /// Flush the last block, write FileTree, NameTable and OffsetRecords, then
    /// the footer.  Returns the sink.
    pub fn finalize(mut self) -> Result<S, WriteError> {
        self.ensure_usable()?;
        self.close_file()?;

        let tree = self.flatten()?;
        let mut tree_bytes = Vec::with_capacity(tree.len() * FileTreeNode::SIZE);
        for node in &tree {
            node.write(&mut tree_bytes)?;
        }
        let mut record_bytes = Vec::with_capacity(self.offset_records.len() * CompressionOffsetRecord::SIZE);
        for record in &self.offset_records {
            record.write(&mut record_bytes)?;
        }
        let names = std::mem::take(&mut self.names);

        let mut footer = Footer::new();
        footer.file_tree = SectionInfo::new(self.written, tree_bytes.len() as u64);
        self.write_out(&tree_bytes)?;
        footer.names = SectionInfo::new(self.written, names.len() as u64);
        self.write_out(&names)?;
        footer.offset_records = SectionInfo::new(self.written, record_bytes.len() as u64);
        self.write_out(&record_bytes)?;
        self.write_out(&footer.to_bytes())?;

        tracing::debug!(
            nodes = tree.len(),
            names = self.name_slots.len(),
            blocks = self.block_count,
            bytes = self.written,
            parts = self.part_count(),
            "archive finalized"
        );
        Ok(self.sink)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn ensure_usable(&self) -> Result<(), WriteError> {
        if self.failed {
            return Err(WriteError::Failed);
        }
        Ok(())
    }

    fn child(&self, dir: usize, name: &str) -> Option<usize> {
        match &self.nodes[dir] {
            PendingNode::Directory { lookup, .. } => lookup.get(name).copied(),
            PendingNode::File { .. } => None,
        }
    }

    fn add_child(&mut self, dir: usize, key: &str, node: PendingNode) -> Result<usize, WriteError> {
        let idx = self.nodes.len();
        if idx >= u32::MAX as usize {
            return Err(WriteError::TooManyEntries);
        }
        self.nodes.push(node);
        match &mut self.nodes[dir] {
            PendingNode::Directory { children, lookup, .. } => {
                children.push(idx);
                lookup.insert(key.to_owned(), idx);
                Ok(idx)
            }
            PendingNode::File { .. } => Err(WriteError::NotADirectory(key.to_owned())),
        }
    }

    /// Walk `parts` from the root, creating directories when `create` is set.
    fn resolve_dir(&mut self, parts: &[&str], create: bool, full: &str) -> Result<usize, WriteError> {
        let mut cur = 0usize;
        for part in parts {
            cur = match self.child(cur, part) {
                Some(i) => match self.nodes[i] {
                    PendingNode::Directory { .. } => i,
                    PendingNode::File { .. } => return Err(WriteError::NotADirectory(full.to_owned())),
                },
                None if create => {
                    let name = self.intern_name(part)?;
                    self.add_child(cur, part, PendingNode::directory(name))?
                }
                None => return Err(WriteError::ParentMissing(full.to_owned())),
            };
        }
        Ok(cur)
    }

    /// NameTable slot for `name`, appending it on first use.
    fn intern_name(&mut self, name: &str) -> Result<u32, WriteError> {
        if let Some(&slot) = self.name_slots.get(name) {
            return Ok(slot);
        }
        let slot = self.name_slots.len() as u32;
        if slot >= NO_NAME {
            return Err(WriteError::TooManyEntries);
        }
        encode_name(name.as_bytes(), &mut self.names)?;
        self.name_slots.insert(name.to_owned(), slot);
        Ok(slot)
    }

    fn close_file(&mut self) -> Result<(), WriteError> {
        if self.open_file.take().is_some() && !self.block_buffer.is_empty() {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Pad, encode and emit the buffered block, then index it.  Any failure
    /// leaves content offsets and the tree out of step, so the writer refuses
    /// all further work.
    fn flush_block(&mut self) -> Result<(), WriteError> {
        let result = self.emit_block();
        if let Err(e) = &result {
            tracing::warn!(block = self.block_count, error = %e, "block write failed, writer disabled");
            self.failed = true;
        }
        result
    }

    fn emit_block(&mut self) -> Result<(), WriteError> {
        let mut block = std::mem::take(&mut self.block_buffer);
        block.resize(BLOCK_SIZE, 0);

        let start = self.written;
        let stored_len = match encode_block(self.codec.as_ref(), &block, self.options.level)? {
            EncodedBlock::Compressed(packed) => {
                self.write_out(&packed)?;
                packed.len()
            }
            EncodedBlock::Stored => {
                if self.probe.decompress_into(&block, &mut self.probe_buffer).is_ok() {
                    return Err(WriteError::AmbiguousStoredBlock { block: self.block_count });
                }
                self.write_out(&block)?;
                block.len()
            }
        };
        tracing::trace!(block = self.block_count, offset = start, len = stored_len, "block written");

        let entry = (self.block_count % ENTRIES_PER_OFFSETRECORD as u64) as usize;
        if entry == 0 {
            self.offset_records.push(CompressionOffsetRecord::new(start));
        }
        if let Some(record) = self.offset_records.last_mut() {
            record.size[entry] = (stored_len - 1) as u16;
        }
        self.block_count += 1;
        self.content_offset += BLOCK_SIZE as u64;

        block.clear();
        self.block_buffer = block;
        Ok(())
    }

    /// Emit bytes to the sink, starting new parts at the size limit.
    fn write_out(&mut self, mut data: &[u8]) -> Result<(), WriteError> {
        while !data.is_empty() {
            let room = match self.options.max_part_size {
                Some(max) => {
                    if self.part_written >= max {
                        self.part_index += 1;
                        self.part_written = 0;
                        self.sink.begin_part(self.part_index)?;
                    }
                    (max - self.part_written).min(data.len() as u64) as usize
                }
                None => data.len(),
            };
            self.sink.write_all(&data[..room])?;
            self.written += room as u64;
            self.part_written += room as u64;
            data = &data[room..];
        }
        Ok(())
    }

    /// Lay the tree out breadth-first so every directory's children are
    /// contiguous.  Index 0 is the root.
    fn flatten(&self) -> Result<Vec<FileTreeNode>, WriteError> {
        let mut out = Vec::with_capacity(self.nodes.len());
        out.push(FileTreeNode::Directory { name: NO_NAME, child_start: 0, child_count: 0 });
        let mut queue = VecDeque::from([(0usize, 0usize)]);

        while let Some((arena, slot)) = queue.pop_front() {
            let (name, children) = match &self.nodes[arena] {
                PendingNode::Directory { name, children, .. } => (*name, children),
                PendingNode::File { .. } => continue,
            };
            let child_start = u32::try_from(out.len()).map_err(|_| WriteError::TooManyEntries)?;
            for &child in children {
                let pos = out.len();
                match self.nodes[child] {
                    PendingNode::File { name, content_offset, content_size } => {
                        out.push(FileTreeNode::File { name, content_offset, content_size });
                    }
                    PendingNode::Directory { name, .. } => {
                        out.push(FileTreeNode::Directory { name, child_start: 0, child_count: 0 });
                        queue.push_back((child, pos));
                    }
                }
            }
            out[slot] = FileTreeNode::Directory {
                name,
                child_start,
                child_count: children.len() as u32,
            };
        }
        Ok(out)
    }
}
