pub mod footer;
pub mod codec;
pub mod block;
pub mod index;
pub mod io_stream;
pub mod archive;

pub use footer::{Footer, SectionInfo};
pub use codec::{CodecId, get_codec};
pub use block::{CompressionOffsetRecord, BLOCK_SIZE, ENTRIES_PER_OFFSETRECORD};
pub use index::FileTreeNode;
pub use io_stream::{ArchiveReader, ArchiveWriter, FileEntry, WriterOptions};
