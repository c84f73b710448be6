use std::io::Cursor;

use tempfile::TempDir;
use zarchive::archive::Archive;
use zarchive::block::{CompressionOffsetRecord, BLOCK_SIZE, ENTRIES_PER_OFFSETRECORD};
use zarchive::codec::{Codec, CodecId, ZstdCodec};
use zarchive::footer::{Footer, SectionInfo, FOOTER_SIZE};
use zarchive::index::{encode_name, FileTreeNode, MAX_NAME_LENGTH, NO_NAME};
use zarchive::io_stream::{
    ArchiveReader, ArchiveWriter, MemoryParts, MultiPartReader, ReadError, StreamSink, WriteError,
    WriterOptions,
};

// ── helpers ──────────────────────────────────────────────────────────────────

/// Deterministic incompressible bytes.
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

fn write_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ArchiveWriter::new(StreamSink::new(Vec::new())).unwrap();
    for (name, data) in files {
        writer.add_file(name, data).unwrap();
    }
    writer.finalize().unwrap().into_inner()
}

fn open(bytes: Vec<u8>) -> ArchiveReader<Cursor<Vec<u8>>> {
    ArchiveReader::open(Cursor::new(bytes)).unwrap()
}

/// Assemble an archive by hand from raw parts.
fn build_archive(
    data:    &[u8],
    tree:    &[FileTreeNode],
    names:   &[&str],
    records: &[CompressionOffsetRecord],
) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut footer = Footer::new();

    let start = out.len() as u64;
    for node in tree {
        node.write(&mut out).unwrap();
    }
    footer.file_tree = SectionInfo::new(start, out.len() as u64 - start);

    let start = out.len() as u64;
    for name in names {
        encode_name(name.as_bytes(), &mut out).unwrap();
    }
    footer.names = SectionInfo::new(start, out.len() as u64 - start);

    let start = out.len() as u64;
    for record in records {
        record.write(&mut out).unwrap();
    }
    footer.offset_records = SectionInfo::new(start, out.len() as u64 - start);

    footer.write(&mut out).unwrap();
    out
}

fn paths(reader: &ArchiveReader<Cursor<Vec<u8>>>) -> Vec<(String, u64)> {
    reader.list_files().into_iter().map(|f| (f.path, f.size)).collect()
}

// ── round trips ──────────────────────────────────────────────────────────────

#[test]
fn test_two_file_scenario() {
    let a = vec![b'a'; 10];
    let b = noise(2 * BLOCK_SIZE + 37, 7);
    let bytes = write_archive(&[("a.txt", &a), ("dir/b.bin", &b)]);

    let mut reader = open(bytes);
    assert_eq!(
        paths(&reader),
        vec![("a.txt".to_string(), 10), ("dir/b.bin".to_string(), (2 * BLOCK_SIZE + 37) as u64)]
    );

    let mut out = Vec::new();
    let n = reader.extract_file("dir/b.bin", &mut out).unwrap();
    assert_eq!(n, b.len() as u64);
    assert_eq!(out, b);
    assert_eq!(reader.read_file("a.txt").unwrap(), a);
}

#[test]
fn test_cross_block_extraction() {
    // Three full blocks plus a partial one, with a pattern that changes at
    // every block boundary.
    let size = 3 * BLOCK_SIZE + 1234;
    let data: Vec<u8> = (0..size).map(|i| ((i / BLOCK_SIZE) as u8).wrapping_mul(31) ^ (i as u8)).collect();
    let mut reader = open(write_archive(&[("big.bin", &data)]));

    let out = reader.read_file("big.bin").unwrap();
    assert_eq!(out.len(), size);
    for k in 1..=3 {
        let at = k * BLOCK_SIZE;
        assert_eq!(out[at - 1..at + 1], data[at - 1..at + 1], "boundary {k}");
    }
    assert_eq!(out, data);
}

#[test]
fn test_many_blocks_span_offset_records() {
    let size = (ENTRIES_PER_OFFSETRECORD + 3) * BLOCK_SIZE + 5;
    let data = noise(size, 99);
    let mut reader = open(write_archive(&[("small", b"x"), ("huge", &data)]));
    assert_eq!(reader.record_count(), 2);
    assert_eq!(reader.read_file("huge").unwrap(), data);
    assert_eq!(reader.read_file("small").unwrap(), b"x");
}

#[test]
fn test_empty_files_and_dirs() {
    let mut writer = ArchiveWriter::new(StreamSink::new(Vec::new())).unwrap();
    writer.make_dir("empty/dir", true).unwrap();
    writer.start_new_file("empty/zero.bin").unwrap();
    writer.add_file("after", b"tail").unwrap();
    let bytes = writer.finalize().unwrap().into_inner();

    let mut reader = open(bytes);
    assert_eq!(
        paths(&reader),
        vec![("empty/zero.bin".to_string(), 0), ("after".to_string(), 4)]
    );
    assert!(reader.read_file("empty/zero.bin").unwrap().is_empty());
    assert_eq!(reader.read_file("after").unwrap(), b"tail");
    assert!(reader.lookup("empty/dir").is_none());
}

#[test]
fn test_streamed_appends_match_single_write() {
    let data = noise(BLOCK_SIZE * 2 + 99, 3);
    let mut writer = ArchiveWriter::new(StreamSink::new(Vec::new())).unwrap();
    writer.start_new_file("s").unwrap();
    for chunk in data.chunks(7777) {
        writer.append_data(chunk).unwrap();
    }
    let mut reader = open(writer.finalize().unwrap().into_inner());
    assert_eq!(reader.read_file("s").unwrap(), data);
}

#[test]
fn test_read_at_spans_blocks() {
    let data = noise(3 * BLOCK_SIZE, 11);
    let mut reader = open(write_archive(&[("f", &data)]));
    let entry = reader.lookup("f").unwrap();

    let mut buf = vec![0u8; 1000];
    let start = BLOCK_SIZE as u64 - 300;
    assert_eq!(reader.read_at(&entry, start, &mut buf).unwrap(), 1000);
    assert_eq!(&buf[..], &data[start as usize..start as usize + 1000]);

    let tail = data.len() as u64 - 10;
    assert_eq!(reader.read_at(&entry, tail, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], &data[tail as usize..]);
    assert_eq!(reader.read_at(&entry, data.len() as u64, &mut buf).unwrap(), 0);
}

#[test]
fn test_lookup_accepts_either_separator() {
    let reader = open(write_archive(&[("a/b/c.txt", b"c")]));
    assert!(reader.lookup("a/b/c.txt").is_some());
    assert!(reader.lookup("/a\\b//c.txt").is_some());
    assert!(reader.lookup("a/b").is_none());
    assert!(reader.lookup("a/b/c.txt/d").is_none());
    assert!(reader.lookup("").is_none());
}

#[test]
fn test_store_only_codec() {
    let opts = WriterOptions { codec: CodecId::None, ..Default::default() };
    let mut writer = ArchiveWriter::with_options(StreamSink::new(Vec::new()), opts).unwrap();
    let data = vec![5u8; BLOCK_SIZE + 1];
    writer.add_file("raw", &data).unwrap();
    let bytes = writer.finalize().unwrap().into_inner();
    // Two stored blocks, both padded to full size.
    assert!(bytes.len() > 2 * BLOCK_SIZE);
    assert_eq!(open(bytes).read_file("raw").unwrap(), data);
}

// ── names ────────────────────────────────────────────────────────────────────

#[test]
fn test_name_length_boundaries_through_archive() {
    let names: Vec<String> = [1usize, 127, 128, MAX_NAME_LENGTH]
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let mut s = "n".repeat(len - 1);
            s.push(char::from(b'a' + i as u8));
            s
        })
        .collect();
    let files: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), &b"x"[..])).collect();
    let reader = open(write_archive(&files));
    let mut listed: Vec<String> = reader.list_files().into_iter().map(|f| f.path).collect();
    listed.sort();
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(listed, expected);

    let mut writer = ArchiveWriter::new(StreamSink::new(Vec::new())).unwrap();
    let too_long = "z".repeat(MAX_NAME_LENGTH + 1);
    assert!(matches!(writer.start_new_file(&too_long), Err(WriteError::Name(_))));
}

// ── corruption ───────────────────────────────────────────────────────────────

#[test]
fn test_flipped_magic_fails_cleanly() {
    let mut bytes = write_archive(&[("a", b"data")]);
    let at = bytes.len() - FOOTER_SIZE;
    bytes[at] ^= 0x01;
    assert!(matches!(ArchiveReader::open(Cursor::new(bytes)), Err(ReadError::Footer(_))));
}

#[test]
fn test_too_small_archive() {
    assert!(matches!(
        ArchiveReader::open(Cursor::new(vec![0u8; FOOTER_SIZE - 1])),
        Err(ReadError::ArchiveTooSmall(_))
    ));
}

#[test]
fn test_section_past_end_is_rejected() {
    let mut footer = Footer::new();
    footer.file_tree = SectionInfo::new(0, u64::MAX / 2);
    let mut bytes = Vec::new();
    footer.write(&mut bytes).unwrap();
    assert!(matches!(
        ArchiveReader::open(Cursor::new(bytes)),
        Err(ReadError::SectionOutOfBounds { .. })
    ));
}

#[test]
fn test_truncated_name_table_fails_initialize() {
    let tree = [FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 0 }];
    let mut bytes = build_archive(&[], &tree, &[], &[]);
    // Splice a lone extended-length header into the (empty) name section.
    let mut footer = Footer::read(&bytes[bytes.len() - FOOTER_SIZE..]).unwrap();
    bytes.truncate(bytes.len() - FOOTER_SIZE);
    footer.names = SectionInfo::new(bytes.len() as u64, 1);
    bytes.push(0x81);
    footer.write(&mut bytes).unwrap();
    assert!(matches!(ArchiveReader::open(Cursor::new(bytes)), Err(ReadError::Names(_))));
}

#[test]
fn test_misaligned_tree_section() {
    let tree = [FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 0 }];
    let mut bytes = build_archive(&[], &tree, &[], &[]);
    let mut footer = Footer::read(&bytes[bytes.len() - FOOTER_SIZE..]).unwrap();
    bytes.truncate(bytes.len() - FOOTER_SIZE);
    footer.file_tree.size -= 1;
    footer.write(&mut bytes).unwrap();
    assert!(matches!(ArchiveReader::open(Cursor::new(bytes)), Err(ReadError::TruncatedSection { .. })));
}

#[test]
fn test_file_root_is_rejected() {
    let tree = [FileTreeNode::File { name: NO_NAME, content_offset: 0, content_size: 0 }];
    let bytes = build_archive(&[], &tree, &[], &[]);
    assert!(matches!(ArchiveReader::open(Cursor::new(bytes)), Err(ReadError::InvalidRoot)));
}

#[test]
fn test_dangling_child_is_skipped() {
    // Root claims three children but only two exist.
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 3 },
        FileTreeNode::File { name: 0, content_offset: 0, content_size: 0 },
        FileTreeNode::File { name: 1, content_offset: 0, content_size: 0 },
    ];
    let reader = open(build_archive(&[], &tree, &["a", "b"], &[]));
    assert_eq!(paths(&reader), vec![("a".to_string(), 0), ("b".to_string(), 0)]);
    assert!(reader.lookup("b").is_some());
    assert!(reader.lookup("c").is_none());
}

#[test]
fn test_bad_name_skips_only_that_branch() {
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 2 },
        FileTreeNode::Directory { name: 40, child_start: 3, child_count: 1 },
        FileTreeNode::File { name: 0, content_offset: 0, content_size: 0 },
        FileTreeNode::File { name: 1, content_offset: 0, content_size: 0 },
    ];
    let reader = open(build_archive(&[], &tree, &["ok", "hidden"], &[]));
    assert_eq!(paths(&reader), vec![("ok".to_string(), 0)]);
}

#[test]
fn test_cycle_does_not_hang() {
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 0, child_count: 2 },
        FileTreeNode::Directory { name: 0, child_start: 0, child_count: 2 },
    ];
    let reader = open(build_archive(&[], &tree, &["loop"], &[]));
    assert!(reader.list_files().is_empty());
    assert!(reader.lookup("loop/loop/loop/x").is_none());
}

#[test]
fn test_missing_offset_record_fails_extraction() {
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 1 },
        FileTreeNode::File { name: 0, content_offset: 0, content_size: 10 },
    ];
    let mut reader = open(build_archive(&[], &tree, &["f"], &[]));
    assert!(matches!(reader.read_file("f"), Err(ReadError::RecordOutOfRange { .. })));
    assert!(matches!(reader.read_file("nope"), Err(ReadError::NotFound(_))));
}

// ── mixed blocks ─────────────────────────────────────────────────────────────

#[test]
fn test_mixed_compressed_and_stored_blocks() {
    let block0: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 13) as u8).collect();
    let mut block1 = noise(BLOCK_SIZE, 5);
    block1[0] = 0; // not a zstd or skippable frame magic
    let tail = b"stored tail of thirty-seven bytes!!!.".to_vec();
    assert_eq!(tail.len(), 37);

    let packed0 = ZstdCodec.compress(&block0, 3).unwrap();
    let mut data = packed0.clone();
    data.extend_from_slice(&block1);
    data.extend_from_slice(&tail);

    let mut record = CompressionOffsetRecord::new(0);
    record.size[0] = (packed0.len() - 1) as u16;
    record.size[1] = (BLOCK_SIZE - 1) as u16;
    record.size[2] = 36;

    let size = 2 * BLOCK_SIZE + 37;
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 1 },
        FileTreeNode::File { name: 0, content_offset: 0, content_size: size as u64 },
    ];
    let mut reader = open(build_archive(&data, &tree, &["mixed.bin"], &[record]));

    let out = reader.read_file("mixed.bin").unwrap();
    let mut expected = block0;
    expected.extend_from_slice(&block1);
    expected.extend_from_slice(&tail);
    assert_eq!(out, expected);
}

#[test]
fn test_writer_mixes_block_kinds() {
    // Incompressible, compressible, incompressible.
    let mut data = noise(BLOCK_SIZE, 21);
    data.extend(std::iter::repeat(0u8).take(BLOCK_SIZE));
    data.extend(noise(BLOCK_SIZE / 2, 22));
    let bytes = write_archive(&[("m", &data)]);
    assert!(bytes.len() < data.len() + BLOCK_SIZE);
    assert_eq!(open(bytes).read_file("m").unwrap(), data);
}

fn short_stored_blocks() -> ArchiveReader<Cursor<Vec<u8>>> {
    // Two verbatim 5-byte blocks backing one 10-byte file.
    let mut record = CompressionOffsetRecord::new(0);
    record.size[0] = 4;
    record.size[1] = 4;
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 1 },
        FileTreeNode::File { name: 0, content_offset: 0, content_size: 10 },
    ];
    open(build_archive(b"helloworld", &tree, &["f"], &[record]))
}

#[test]
fn test_short_blocks_extract_back_to_back() {
    let mut reader = short_stored_blocks();
    assert_eq!(reader.read_file("f").unwrap(), b"helloworld");
}

#[test]
fn test_read_at_rejects_short_block() {
    let mut reader = short_stored_blocks();
    let entry = reader.lookup("f").unwrap();
    let mut buf = [0u8; 10];
    assert!(matches!(
        reader.read_at(&entry, 0, &mut buf),
        Err(ReadError::ShortBlock { block: 0, produced: 5, needed: 10 })
    ));
    assert_eq!(reader.read_at(&entry, 0, &mut buf[..5]).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
}

#[test]
fn test_short_block_then_missing_record_fails() {
    let mut record = CompressionOffsetRecord::new(0);
    record.size[0] = 4;
    let tree = [
        FileTreeNode::Directory { name: NO_NAME, child_start: 1, child_count: 1 },
        FileTreeNode::File { name: 0, content_offset: 15 * BLOCK_SIZE as u64, content_size: 10 },
    ];
    let mut reader = open(build_archive(b"hello", &tree, &["f"], &[record]));
    assert!(matches!(reader.read_file("f"), Err(ReadError::RecordOutOfRange { record: 1, count: 1 })));
}

// ── writer failures ──────────────────────────────────────────────────────────

/// Incompressible BLOCK_SIZE bytes that are also one valid zstd frame.
fn zstd_frame_block() -> Vec<u8> {
    let payload = BLOCK_SIZE - 10;
    let mut frame = vec![0x28, 0xB5, 0x2F, 0xFD, 0x60];
    frame.extend_from_slice(&((payload - 256) as u16).to_le_bytes());
    frame.extend_from_slice(&(1 | (payload as u32) << 3).to_le_bytes()[..3]);
    frame.extend(noise(payload, 77));
    frame
}

#[test]
fn test_ambiguous_block_fails_the_whole_archive() {
    let frame = zstd_frame_block();
    assert_eq!(frame.len(), BLOCK_SIZE);
    let mut out = vec![0u8; BLOCK_SIZE];
    assert!(ZstdCodec.decompress_into(&frame, &mut out).is_ok());

    let mut writer = ArchiveWriter::new(StreamSink::new(Vec::new())).unwrap();
    assert!(matches!(
        writer.add_file("bad", &frame),
        Err(WriteError::AmbiguousStoredBlock { block: 0 })
    ));
    assert!(matches!(writer.add_file("good", b"hello"), Err(WriteError::Failed)));
    assert!(matches!(writer.finalize(), Err(WriteError::Failed)));
}

// ── parts ────────────────────────────────────────────────────────────────────

#[test]
fn test_multipart_round_trip_in_memory() {
    let data = noise(3 * BLOCK_SIZE + 17, 8);
    let opts = WriterOptions { max_part_size: Some(50_000), ..Default::default() };
    let mut writer = ArchiveWriter::with_options(MemoryParts::new(), opts).unwrap();
    writer.add_file("x/data", &data).unwrap();
    writer.add_file("x/note", b"note").unwrap();
    let sink = writer.finalize().unwrap();
    let total = sink.concat().len();
    assert!(sink.parts.len() >= 2);
    assert_eq!(sink.parts.len(), (total + 49_999) / 50_000);
    assert!(sink.parts[..sink.parts.len() - 1].iter().all(|p| p.len() == 50_000));

    let parts: Vec<Cursor<Vec<u8>>> = sink.parts.into_iter().map(Cursor::new).collect();
    let mut reader = ArchiveReader::open(MultiPartReader::new(parts).unwrap()).unwrap();
    assert_eq!(reader.read_file("x/data").unwrap(), data);
    assert_eq!(reader.read_file("x/note").unwrap(), b"note");
}

#[test]
fn test_archive_files_on_disk() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join("nested/deeper")).unwrap();
    std::fs::create_dir_all(src.join("empty")).unwrap();
    std::fs::write(src.join("top.txt"), b"top").unwrap();
    std::fs::write(src.join("nested/deeper/blob.bin"), noise(BLOCK_SIZE + 3, 1)).unwrap();

    let archive_path = dir.path().join("out.zar");
    let mut ar = Archive::create(&archive_path, WriterOptions::default()).unwrap();
    assert_eq!(ar.add_dir_all(&src, "root").unwrap(), 2);
    let parts = ar.finalize().unwrap();
    assert_eq!(parts, vec![archive_path.clone()]);

    let mut ar = Archive::open(&archive_path).unwrap();
    let mut listed: Vec<String> = ar.list().unwrap().into_iter().map(|f| f.path).collect();
    listed.sort();
    assert_eq!(listed, vec!["root/nested/deeper/blob.bin", "root/top.txt"]);

    let dest = dir.path().join("dest");
    assert_eq!(ar.extract_all(&dest).unwrap(), 2);
    assert_eq!(std::fs::read(dest.join("root/top.txt")).unwrap(), b"top");
    assert_eq!(
        std::fs::read(dest.join("root/nested/deeper/blob.bin")).unwrap(),
        noise(BLOCK_SIZE + 3, 1)
    );

    let expected = hex::encode(blake3::hash(b"top").as_bytes());
    assert_eq!(ar.content_hash("root/top.txt").unwrap(), expected);
}

#[test]
fn test_split_archive_on_disk() {
    let dir = TempDir::new().unwrap();
    let archive_path = dir.path().join("split.zar");
    let data = noise(2 * BLOCK_SIZE, 4);
    let opts = WriterOptions { max_part_size: Some(40_000), ..Default::default() };

    let mut ar = Archive::create(&archive_path, opts).unwrap();
    ar.add_file("payload", &data).unwrap();
    let parts = ar.finalize().unwrap();
    assert!(parts.len() > 1);
    assert!(!archive_path.exists());
    assert_eq!(parts[0], dir.path().join("split.zar.000"));

    // Auto-detected from the base name, and from an explicit list.
    assert_eq!(Archive::open(&archive_path).unwrap().read_file("payload").unwrap(), data);
    assert_eq!(Archive::open_parts(&parts).unwrap().read_file("payload").unwrap(), data);
}

#[test]
fn test_repacking_smaller_drops_stale_parts() {
    let dir = TempDir::new().unwrap();
    let archive_path = dir.path().join("repack.zar");
    let opts = WriterOptions { max_part_size: Some(40_000), ..Default::default() };

    let mut ar = Archive::create(&archive_path, opts.clone()).unwrap();
    ar.add_file("payload", &noise(3 * BLOCK_SIZE, 1)).unwrap();
    let first = ar.finalize().unwrap();

    let small = noise(BLOCK_SIZE, 2);
    let mut ar = Archive::create(&archive_path, opts).unwrap();
    ar.add_file("payload", &small).unwrap();
    let second = ar.finalize().unwrap();
    assert!(second.len() >= 2 && second.len() < first.len());
    assert!(first[second.len()..].iter().all(|p| !p.exists()));

    let mut ar = Archive::open(&archive_path).unwrap();
    assert_eq!(ar.parts(), second.as_slice());
    assert_eq!(ar.path(), archive_path.as_path());
    assert_eq!(ar.read_file("payload").unwrap(), small);
}

#[test]
fn test_read_only_and_write_only_modes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("modes.zar");
    let mut ar = Archive::create(&path, WriterOptions::default()).unwrap();
    assert!(ar.read_file("x").is_err());
    ar.add_file("x", b"1").unwrap();
    ar.finalize().unwrap();
    assert!(ar.add_file("y", b"2").is_err());

    let mut ar = Archive::open(&path).unwrap();
    assert!(ar.add_file("y", b"2").is_err());
    assert_eq!(
        ar.read_file("missing").unwrap_err().kind(),
        std::io::ErrorKind::NotFound
    );
}
