//! Streaming archive engine: writer, reader and the I/O seams they use.
//!
//! # Writer
//! [`ArchiveWriter`] accepts files one at a time, cuts their content into
//! `BLOCK_SIZE` blocks, compresses each block and streams it to an
//! [`ArchiveSink`] immediately.  Metadata (tree, names, offset records) stays
//! in memory until `finalize()`, which appends it followed by the footer.
//!
//! # Reader
//! [`ArchiveReader`] reads the footer from the tail of an [`ArchiveSource`],
//! loads the three metadata sections, and resolves paths to block ranges for
//! random-access extraction.
//!
//! # Parts
//! An archive may be split across several physical outputs.  Offsets are
//! always positions in the concatenation of all parts, so a reader only needs
//! a source that presents the parts back-to-back ([`MultiPartReader`]).

mod reader;
mod writer;

pub use reader::{ArchiveReader, FileEntry, ReadError};
pub use writer::{ArchiveWriter, WriteError, WriterOptions, DEFAULT_COMPRESSION_LEVEL};

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// ── Output ───────────────────────────────────────────────────────────────────

/// Destination for archive bytes.
///
/// The writer calls `begin_part(0)` once on creation and `begin_part(n)`
/// whenever the part size limit is reached; every `write_all` goes to the
/// most recently begun part.
pub trait ArchiveSink {
    fn begin_part(&mut self, index: u32) -> io::Result<()>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Sink writing every part back-to-back into one stream.
pub struct StreamSink<W: Write> {
    inner: W,
}

impl<W: Write> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ArchiveSink for StreamSink<W> {
    fn begin_part(&mut self, _index: u32) -> io::Result<()> {
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)
    }
}

/// Sink keeping each part as a separate in-memory buffer.
#[derive(Debug, Default)]
pub struct MemoryParts {
    pub parts: Vec<Vec<u8>>,
}

impl MemoryParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// All parts concatenated into one archive image.
    pub fn concat(&self) -> Vec<u8> {
        self.parts.concat()
    }
}

impl ArchiveSink for MemoryParts {
    fn begin_part(&mut self, index: u32) -> io::Result<()> {
        debug_assert_eq!(index as usize, self.parts.len());
        self.parts.push(Vec::new());
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.parts.last_mut() {
            Some(part) => {
                part.extend_from_slice(data);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "no output part begun")),
        }
    }
}

/// Sink writing one file per part.
///
/// Part 0 is written to `base` itself.  Once a second part begins, part 0 is
/// renamed to `<base>.000` and later parts become `<base>.001`, `<base>.002`…
/// so a split archive is always a complete, consecutively numbered set.
/// [`finish`](Self::finish) removes numbered parts left behind by an earlier,
/// larger archive at the same path, since readers pick up every consecutive
/// `<base>.NNN` that exists.
pub struct PartFileSink {
    base:    PathBuf,
    current: Option<BufWriter<File>>,
    parts:   Vec<PathBuf>,
}

impl PartFileSink {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base: base.as_ref().to_owned(), current: None, parts: Vec::new() }
    }

    /// Paths written so far, in part order.
    pub fn parts(&self) -> &[PathBuf] {
        &self.parts
    }

    /// Flush the last part to disk and delete stale parts numbered past it.
    pub fn finish(&mut self) -> io::Result<()> {
        self.flush_current()?;
        let first_stale = if self.parts.len() > 1 { self.parts.len() as u32 } else { 0 };
        for index in first_stale.. {
            let stale = part_path(&self.base, index);
            if !stale.exists() {
                break;
            }
            tracing::debug!(path = %stale.display(), "removing stale part");
            std::fs::remove_file(&stale)?;
        }
        Ok(())
    }

    fn flush_current(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.current.take() {
            w.flush()?;
        }
        Ok(())
    }
}

/// Path of part `index` of a split archive rooted at `base`.
pub fn part_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index:03}"));
    PathBuf::from(name)
}

impl ArchiveSink for PartFileSink {
    fn begin_part(&mut self, index: u32) -> io::Result<()> {
        self.flush_current()?;
        if index == 1 {
            if let Some(p0) = self.parts.first_mut() {
                let first = part_path(&self.base, 0);
                std::fs::rename(&*p0, &first)?;
                *p0 = first;
            }
        }
        let path = if index == 0 { self.base.clone() } else { part_path(&self.base, index) };
        tracing::debug!(part = index, path = %path.display(), "begin output part");
        self.current = Some(BufWriter::new(File::create(&path)?));
        self.parts.push(path);
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.current.as_mut() {
            Some(w) => w.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::Other, "no output part begun")),
        }
    }
}

// ── Input ────────────────────────────────────────────────────────────────────

/// Random-access view of a complete archive stream.
pub trait ArchiveSource {
    /// Fill `buf` from `pos`.  `SeekFrom::End(-n)` addresses `n` bytes before
    /// end-of-stream.  Short reads are errors.
    fn read_exact_at(&mut self, pos: SeekFrom, buf: &mut [u8]) -> io::Result<()>;

    /// Total stream length in bytes.
    fn len(&mut self) -> io::Result<u64>;
}

impl<R: Read + Seek> ArchiveSource for R {
    fn read_exact_at(&mut self, pos: SeekFrom, buf: &mut [u8]) -> io::Result<()> {
        self.seek(pos)?;
        self.read_exact(buf)
    }

    fn len(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }
}

/// Presents an ordered list of parts as one seekable stream.
pub struct MultiPartReader<R: Read + Seek> {
    parts:  Vec<R>,
    /// Start offset of each part in the combined stream.
    starts: Vec<u64>,
    total:  u64,
    pos:    u64,
}

impl<R: Read + Seek> MultiPartReader<R> {
    pub fn new(mut parts: Vec<R>) -> io::Result<Self> {
        let mut starts = Vec::with_capacity(parts.len());
        let mut total = 0u64;
        for part in &mut parts {
            starts.push(total);
            total += part.seek(SeekFrom::End(0))?;
        }
        Ok(Self { parts, starts, total, pos: 0 })
    }

    fn part_at(&self, pos: u64) -> Option<usize> {
        match self.starts.binary_search(&pos) {
            // Several empty parts can share a start; take the last of them.
            Ok(mut i) => {
                while i + 1 < self.starts.len() && self.starts[i + 1] == pos {
                    i += 1;
                }
                Some(i)
            }
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }
}

impl MultiPartReader<File> {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> io::Result<Self> {
        let files = paths.iter().map(File::open).collect::<io::Result<Vec<_>>>()?;
        Self::new(files)
    }
}

impl<R: Read + Seek> Read for MultiPartReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.total {
            return Ok(0);
        }
        let idx = match self.part_at(self.pos) {
            Some(i) => i,
            None => return Ok(0),
        };
        let within = self.pos - self.starts[idx];
        let part = &mut self.parts[idx];
        part.seek(SeekFrom::Start(within))?;
        let n = part.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for MultiPartReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n)   => Some(n),
            SeekFrom::End(d)     => self.total.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of archive")),
        }
    }
}
