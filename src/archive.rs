//! High-level [`Archive`] API, the primary embedding surface.
//!
//! ```no_run
//! use zarchive::archive::Archive;
//! use zarchive::io_stream::WriterOptions;
//!
//! // Write
//! let mut ar = Archive::create("out.zar", WriterOptions::default())?;
//! ar.add_file("docs/readme.txt", b"Hello, world!")?;
//! ar.finalize()?;
//!
//! // Read
//! let mut ar = Archive::open("out.zar")?;
//! let data = ar.read_file("docs/readme.txt")?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::block::BLOCK_SIZE;
use crate::footer::Footer;
use crate::index::path_components;
use crate::io_stream::{
    part_path, ArchiveReader, ArchiveWriter, FileEntry, MultiPartReader, PartFileSink, ReadError,
    WriteError, WriterOptions,
};

type PartReader = ArchiveReader<MultiPartReader<File>>;

// ── ArchiveInfo ───────────────────────────────────────────────────────────────

/// Summary returned by [`Archive::info`].
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub footer:        Footer,
    pub parts:         Vec<PathBuf>,
    pub total_size:    u64,
    pub node_count:    usize,
    pub name_count:    usize,
    pub record_count:  usize,
    pub file_count:    usize,
    pub content_bytes: u64,
}

// ── ArchiveMode ───────────────────────────────────────────────────────────────

enum ArchiveMode {
    Read(PartReader),
    Write(ArchiveWriter<PartFileSink>),
    Finalized,
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path:  PathBuf,
    parts: Vec<PathBuf>,
    mode:  ArchiveMode,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Open `path`, or the split set `path.000`, `path.001`, … if `path`
    /// itself does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let parts = if path.exists() {
            vec![path.clone()]
        } else {
            let found: Vec<PathBuf> = (0u32..)
                .map(|i| part_path(&path, i))
                .take_while(|p| p.exists())
                .collect();
            if found.is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotFound,
                    format!("Archive not found: {}", path.display())));
            }
            found
        };
        Self::open_parts_at(path, parts)
    }

    /// Open an archive from an explicit, ordered list of parts.
    pub fn open_parts<P: AsRef<Path>>(parts: &[P]) -> io::Result<Self> {
        let parts: Vec<PathBuf> = parts.iter().map(|p| p.as_ref().to_owned()).collect();
        let path = parts.first().cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no archive parts given")
        })?;
        Self::open_parts_at(path, parts)
    }

    fn open_parts_at(path: PathBuf, parts: Vec<PathBuf>) -> io::Result<Self> {
        let reader = ArchiveReader::open(MultiPartReader::open(parts.as_slice())?).map_err(read_err)?;
        Ok(Self { path, parts, mode: ArchiveMode::Read(reader) })
    }

    pub fn create<P: AsRef<Path>>(path: P, opts: WriterOptions) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let writer = ArchiveWriter::with_options(PartFileSink::new(&path), opts).map_err(write_err)?;
        Ok(Self { path, parts: Vec::new(), mode: ArchiveMode::Write(writer) })
    }

    // ── Write ─────────────────────────────────────────────────────────────────

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        self.writer()?.add_file(name, data).map_err(write_err)
    }

    /// Stream `reader` into a new file without buffering it whole.
    pub fn add_reader<R: Read>(&mut self, name: &str, mut reader: R) -> io::Result<u64> {
        let w = self.writer()?;
        w.start_new_file(name).map_err(write_err)?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            w.append_data(&buf[..n]).map_err(write_err)?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Recursively add the contents of `dir` under `prefix` (may be empty).
    /// Entries are visited in file-name order so the output is deterministic.
    pub fn add_dir_all<P: AsRef<Path>>(&mut self, dir: P, prefix: &str) -> io::Result<usize> {
        let dir = dir.as_ref();
        let mut files = 0usize;
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry.path().strip_prefix(dir)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let mut name = prefix.trim_matches('/').to_owned();
            for comp in rel.components() {
                if !name.is_empty() {
                    name.push('/');
                }
                name.push_str(&comp.as_os_str().to_string_lossy());
            }
            if entry.file_type().is_dir() {
                self.mkdir(&name, true)?;
            } else if entry.file_type().is_file() {
                self.add_reader(&name, File::open(entry.path())?)?;
                files += 1;
            }
        }
        Ok(files)
    }

    pub fn mkdir(&mut self, name: &str, recursive: bool) -> io::Result<()> {
        self.writer()?.make_dir(name, recursive).map_err(write_err)
    }

    /// Write the metadata sections and footer.  Returns the part files.
    pub fn finalize(&mut self) -> io::Result<Vec<PathBuf>> {
        match std::mem::replace(&mut self.mode, ArchiveMode::Finalized) {
            ArchiveMode::Write(w) => {
                let mut sink = w.finalize().map_err(write_err)?;
                sink.finish()?;
                self.parts = sink.parts().to_vec();
                Ok(self.parts.clone())
            }
            other => {
                self.mode = other;
                Err(read_only())
            }
        }
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    pub fn list(&self) -> io::Result<Vec<FileEntry>> {
        Ok(self.reader_ref()?.list_files())
    }

    pub fn stat(&self, name: &str) -> io::Result<Option<FileEntry>> {
        Ok(self.reader_ref()?.lookup(name))
    }

    pub fn read_file(&mut self, name: &str) -> io::Result<Vec<u8>> {
        self.reader()?.read_file(name).map_err(read_err)
    }

    pub fn extract_to<W: Write>(&mut self, name: &str, out: &mut W) -> io::Result<u64> {
        self.reader()?.extract_file(name, out).map_err(read_err)
    }

    pub fn read_at(&mut self, name: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let reader = self.reader()?;
        let entry = reader.lookup(name).ok_or_else(|| not_found(name))?;
        reader.read_at(&entry, offset, buf).map_err(read_err)
    }

    /// Extract every file into `dest`, creating directories as needed.
    /// Entries whose path would escape `dest` are rejected.
    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> io::Result<usize> {
        let dest = dest.as_ref();
        let entries = self.list()?;
        let targets = entries.iter()
            .map(|e| safe_join(dest, &e.path))
            .collect::<io::Result<Vec<_>>>()?;

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            let parts = self.parts.clone();
            entries.par_iter().zip(targets.par_iter()).try_for_each_init(
                || ArchiveReader::open(MultiPartReader::open(parts.as_slice())?).map_err(read_err),
                |reader, (entry, target)| {
                    let reader = reader.as_mut()
                        .map_err(|e| io::Error::new(e.kind(), e.to_string()))?;
                    extract_entry_to(reader, entry, target)
                },
            )?;
        }
        #[cfg(not(feature = "parallel"))]
        {
            let reader = self.reader()?;
            for (entry, target) in entries.iter().zip(&targets) {
                extract_entry_to(reader, entry, target)?;
            }
        }
        Ok(entries.len())
    }

    /// BLAKE3 digest of a file's content, hex encoded.
    pub fn content_hash(&mut self, name: &str) -> io::Result<String> {
        let mut hasher = blake3::Hasher::new();
        self.extract_to(name, &mut hasher)?;
        Ok(hex::encode(hasher.finalize().as_bytes()))
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }

    pub fn parts(&self) -> &[PathBuf] { &self.parts }

    pub fn info(&self) -> io::Result<ArchiveInfo> {
        let reader = self.reader_ref()?;
        let files = reader.list_files();
        let total_size = self.parts.iter()
            .map(|p| std::fs::metadata(p).map(|m| m.len()))
            .sum::<io::Result<u64>>()?;
        Ok(ArchiveInfo {
            footer:        reader.footer().clone(),
            parts:         self.parts.clone(),
            total_size,
            node_count:    reader.node_count(),
            name_count:    reader.name_count(),
            record_count:  reader.record_count(),
            file_count:    files.len(),
            content_bytes: files.iter().map(|f| f.size).sum(),
        })
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn writer(&mut self) -> io::Result<&mut ArchiveWriter<PartFileSink>> {
        match &mut self.mode {
            ArchiveMode::Write(w) => Ok(w),
            _ => Err(read_only()),
        }
    }

    fn reader(&mut self) -> io::Result<&mut PartReader> {
        match &mut self.mode {
            ArchiveMode::Read(r) => Ok(r),
            _ => Err(write_only()),
        }
    }

    fn reader_ref(&self) -> io::Result<&PartReader> {
        match &self.mode {
            ArchiveMode::Read(r) => Ok(r),
            _ => Err(write_only()),
        }
    }
}

fn extract_entry_to(reader: &mut PartReader, entry: &FileEntry, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(target)?);
    reader.extract_entry(entry, &mut out).map_err(read_err)?;
    out.flush()
}

/// Join an archive path onto `dest`, refusing anything that could land
/// outside it.
pub fn safe_join(dest: &Path, archive_path: &str) -> io::Result<PathBuf> {
    let mut out = dest.to_path_buf();
    let mut depth = 0usize;
    for comp in path_components(archive_path) {
        match Path::new(comp).components().next() {
            Some(Component::Normal(c)) if Path::new(comp).components().count() == 1 => out.push(c),
            _ => {
                return Err(io::Error::new(io::ErrorKind::InvalidData,
                    format!("Unsafe path in archive: {archive_path:?}")));
            }
        }
        depth += 1;
    }
    if depth == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Empty path in archive"));
    }
    Ok(out)
}

fn read_err(e: ReadError) -> io::Error {
    match e {
        ReadError::Io(e) => e,
        ReadError::NotFound(name) => not_found(&name),
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn write_err(e: WriteError) -> io::Error {
    match e {
        WriteError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidInput, other),
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("File not found: {name}"))
}

fn read_only()  -> io::Error { io::Error::new(io::ErrorKind::PermissionDenied, "archive is read-only") }
fn write_only() -> io::Error { io::Error::new(io::ErrorKind::PermissionDenied, "archive is write-only") }
