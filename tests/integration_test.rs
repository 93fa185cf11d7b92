use solid7z::archive::{Archive, PackOptions};
use solid7z::codec::{
    BoxSink, BoxSource, Codec, CodecError, CodecId, CopyCodec, DecodeContext, DeltaCodec, LzmaCodec, ZstdCodec,
};
use solid7z::crypto::KdfParams;
use solid7z::graph::CoderGraph;
use solid7z::index::Entry;
use solid7z::io_stream::{
    ArchiveReader, ArchiveWriter, HeaderCompression, OpenOptions, SolidMode, WriteOptions,
};
use solid7z::scheduler::{InlineScheduler, ThreadScheduler};
use solid7z::superblock::SUPERBLOCK_SIZE;
use solid7z::ArchiveError;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::{tempdir, NamedTempFile};

// ── helpers ──────────────────────────────────────────────────────────────────

fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed as usize) % 251) as u8 ^ (i / 97) as u8).collect()
}

/// Machine-code-ish bytes with plenty of E8/E9 opcodes.
fn x86_like(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i = 0u32;
    while out.len() < len {
        out.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0xE8]);
        out.extend_from_slice(&(i.wrapping_mul(0x40)).to_le_bytes());
        out.extend_from_slice(&[0x0F, 0x84, 0x10, 0x00, 0x00, 0x00, 0xE9]);
        out.extend_from_slice(&(0x1000 - i).to_le_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

fn build(options: WriteOptions, entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut w = ArchiveWriter::new(Cursor::new(Vec::new()), options).unwrap();
    for (name, data) in entries {
        w.add_entry(Entry::file(*name), data).unwrap();
    }
    w.finish().unwrap();
    w.into_inner().unwrap().into_inner()
}

fn read_all(r: &mut ArchiveReader) -> Vec<(String, Vec<u8>)> {
    (0..r.entries().len())
        .map(|i| (r.entries().get(i).unwrap().name.clone(), r.read_entry(i).unwrap()))
        .collect()
}

fn patch_start_header(archive: &mut [u8], offset: u64, size: u64, crc: u32) {
    archive[12..20].copy_from_slice(&offset.to_le_bytes());
    archive[20..28].copy_from_slice(&size.to_le_bytes());
    archive[28..32].copy_from_slice(&crc.to_le_bytes());
    let header_crc = crc32fast::hash(&archive[12..32]);
    archive[8..12].copy_from_slice(&header_crc.to_le_bytes());
}

/// Every block's entries add up to its unpacked size, and blocks tile the
/// data area without gaps up to the metadata.
fn assert_block_accounting(r: &ArchiveReader) {
    let mut expected_offset = 0;
    for (i, block) in r.blocks().iter().enumerate() {
        let sizes: u64 = r.entries().iter().filter(|e| e.block_index() == Some(i)).map(|e| e.size).sum();
        assert_eq!(block.u_size, sizes, "block {i}");
        assert_eq!(block.offset, expected_offset, "block {i} offset");
        expected_offset = block.end();
    }
    assert!(expected_offset <= r.superblock().next_header_offset);
}

fn fast_kdf() -> KdfParams {
    KdfParams::with_cost(64, 1)
}

// ── round trips ──────────────────────────────────────────────────────────────

#[test]
fn test_round_trip_every_codec() {
    let entries = vec![
        ("a.txt", b"Hello, solid 7z!".repeat(40)),
        ("b.bin", sample(70_000, 3)),
        ("c.bin", sample(5, 9)),
    ];
    let chains: Vec<Vec<Arc<dyn Codec>>> = vec![
        vec![Arc::new(CopyCodec)],
        vec![CodecId::Zstd.encoder(3).unwrap()],
        vec![CodecId::Lz4.encoder(0).unwrap()],
        vec![CodecId::Brotli.encoder(5).unwrap()],
        vec![CodecId::Lzma.encoder(0).unwrap()],
        vec![Arc::new(DeltaCodec::new(4)), Arc::new(ZstdCodec::default())],
    ];
    for chain in chains {
        let names: Vec<String> = chain.iter().map(|c| c.name().to_string()).collect();
        let archive = build(WriteOptions::default().codecs(chain), &entries);
        let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
        assert_eq!(r.blocks().len(), 1, "{names:?}");
        for (i, (name, data)) in entries.iter().enumerate() {
            let e = r.entries().get(i).unwrap().clone();
            assert_eq!(e.name, *name);
            assert_eq!(e.crc, Some(crc32fast::hash(data)), "{names:?}");
            assert_eq!(&r.read_entry(i).unwrap(), data, "{names:?} {name}");
        }
        assert_block_accounting(&r);
    }
}

#[test]
fn test_round_trip_branch_split_graph() {
    let graph = CoderGraph::branch_split(
        Arc::new(ZstdCodec::default()),
        Arc::new(LzmaCodec::default()),
    )
    .unwrap();
    assert_eq!(graph.raw_count(), 4);
    let entries = vec![("prog.exe", x86_like(50_000)), ("notes.txt", b"no branches here".to_vec())];
    let archive = build(
        WriteOptions::default().graph(graph).header_compression(HeaderCompression::Always),
        &entries,
    );
    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    assert_eq!(r.blocks()[0].extra_sizes.len(), 3);
    assert_eq!(read_all(&mut r), entries.iter().map(|(n, d)| (n.to_string(), d.clone())).collect::<Vec<_>>());
    assert_eq!(r.verify_block(0).unwrap(), 50_000 + 16);
    assert_block_accounting(&r);
}

#[test]
fn test_empty_archive() {
    let archive = build(WriteOptions::default(), &[]);
    let r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    assert!(r.entries().is_empty());
    assert!(r.blocks().is_empty());
}

// ── concrete scenario ────────────────────────────────────────────────────────

#[test]
fn test_zero_ten_hundred_thousand() {
    let big = sample(100_000, 1);
    let entries = vec![("zero", Vec::new()), ("ten", sample(10, 2)), ("big", big.clone())];
    let archive = build(WriteOptions::default().codecs(vec![Arc::new(CopyCodec)]), &entries);
    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();

    let zero = r.entries().get(0).unwrap();
    assert!(zero.is_empty_file());
    assert_eq!(zero.block_index(), None);

    assert_eq!(r.blocks().len(), 1);
    assert_eq!(r.blocks()[0].u_size, 100_010);
    assert_eq!(r.blocks()[0].file_count, 2);
    assert_eq!(r.entries().get(1).unwrap().block_index(), Some(0));
    assert_eq!(r.entries().get(2).unwrap().block_index(), Some(0));
    assert_eq!(r.entries().get(2).unwrap().crc, Some(crc32fast::hash(&big)));
    assert_eq!(r.read_entry(2).unwrap(), big);
    assert!(r.read_entry(0).unwrap().is_empty());
}

#[test]
fn test_oversized_metadata_length_is_corruption() {
    let mut archive = build(WriteOptions::default(), &[("a", sample(100, 0))]);
    let offset = u64::from_le_bytes(archive[12..20].try_into().unwrap());
    let crc = u32::from_le_bytes(archive[28..32].try_into().unwrap());
    for size in [archive.len() as u64, u64::MAX / 2, u64::MAX] {
        patch_start_header(&mut archive, offset, size, crc);
        let err = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap_err();
        assert!(err.is_corruption(), "{size}: {err:?}");
    }
}

// ── solid policy ─────────────────────────────────────────────────────────────

#[test]
fn test_solid_byte_threshold_rolls_on_hint() {
    let options = WriteOptions::default().solid(SolidMode::Bytes(1000));
    let mut w = ArchiveWriter::new(Cursor::new(Vec::new()), options).unwrap();
    w.add_entry(Entry::file("a"), &sample(600, 0)).unwrap();
    // 600 + 600 would overflow: rolls before "b"
    w.add_entry(Entry::file("b"), &sample(600, 1)).unwrap();
    // no hint: lands in b's block, which then passes the threshold and closes
    w.begin_entry(Entry::file("c"), None).unwrap();
    w.write_all(&sample(500, 2)).unwrap();
    w.close_entry().unwrap();
    w.add_entry(Entry::file("d"), &sample(10, 3)).unwrap();
    w.finish().unwrap();
    let archive = w.into_inner().unwrap().into_inner();

    let r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    let blocks: Vec<Option<usize>> = r.entries().iter().map(Entry::block_index).collect();
    assert_eq!(blocks, [Some(0), Some(1), Some(1), Some(2)]);
    assert_block_accounting(&r);
}

#[test]
fn test_single_block_holds_everything() {
    let entries: Vec<(&str, Vec<u8>)> = ["a", "b", "c", "d"].iter().map(|n| (*n, sample(3000, n.as_bytes()[0]))).collect();
    let archive = build(WriteOptions::default(), &entries);
    let r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    assert_eq!(r.blocks().len(), 1);
    assert_eq!(r.blocks()[0].file_count, 4);
}

// ── header compression ───────────────────────────────────────────────────────

#[test]
fn test_header_compression_reads_back_either_way() {
    let entries: Vec<(&str, Vec<u8>)> = vec![("x", sample(10, 0)), ("y", sample(20, 1)), ("z", Vec::new())];
    for policy in [HeaderCompression::Never, HeaderCompression::Always] {
        let archive = build(WriteOptions::default().header_compression(policy), &entries);
        let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
        assert_eq!(r.entries().len(), 3, "{policy:?}");
        assert_eq!(r.blocks().len(), 1, "metadata block must not be listed ({policy:?})");
        assert_eq!(r.read_entry(1).unwrap(), entries[1].1);
    }
}

// ── parallel ─────────────────────────────────────────────────────────────────

#[test]
fn test_parallel_matches_serial() {
    let entries: Vec<(String, Vec<u8>)> =
        (0..12).map(|i| (format!("f{i:02}"), sample(1000 + i * 777, i as u8))).collect();
    let refs: Vec<(&str, Vec<u8>)> = entries.iter().map(|(n, d)| (n.as_str(), d.clone())).collect();
    let archive = build(WriteOptions::default().solid(SolidMode::Bytes(8000)), &refs);

    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    assert!(r.blocks().len() > 2);
    let mut serial = read_all(&mut r);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let join = r
        .parallel_decompress(&ThreadScheduler::default(), move |_, entry, data| {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf)?;
            sink.lock().unwrap().push((entry.name.clone(), buf));
            Ok(())
        })
        .unwrap();
    join.wait().unwrap();

    let mut parallel = seen.lock().unwrap().clone();
    serial.sort();
    parallel.sort();
    assert_eq!(serial, parallel);
}

#[test]
fn test_parallel_extract_to_disk() {
    let archive_file = NamedTempFile::new().unwrap();
    {
        let mut ar = Archive::create(archive_file.path(), PackOptions { solid: SolidMode::PerEntry, ..PackOptions::default() }).unwrap();
        ar.add_directory("docs").unwrap();
        ar.add_file("docs/a.txt", b"alpha").unwrap();
        ar.add_file("docs/empty.txt", b"").unwrap();
        ar.add_file("b.bin", &sample(4096, 7)).unwrap();
        ar.finalize().unwrap();
    }
    let out = tempdir().unwrap();
    let mut ar = Archive::open(archive_file.path()).unwrap();
    assert_eq!(ar.extract_parallel(out.path(), &InlineScheduler).unwrap(), 4);
    assert_eq!(std::fs::read(out.path().join("docs/a.txt")).unwrap(), b"alpha");
    assert!(std::fs::read(out.path().join("docs/empty.txt")).unwrap().is_empty());
    assert_eq!(std::fs::read(out.path().join("b.bin")).unwrap(), sample(4096, 7));
}

// ── recovery ─────────────────────────────────────────────────────────────────

#[test]
fn test_recovery_idempotence() {
    let entries: Vec<(&str, Vec<u8>)> = vec![("one", sample(3000, 1)), ("two", Vec::new()), ("three", sample(9000, 3))];
    for policy in [HeaderCompression::Never, HeaderCompression::Always] {
        let archive = build(WriteOptions::default().header_compression(policy), &entries);
        let normal = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap();

        let mut damaged = archive.clone();
        damaged[12..32].fill(0);
        assert!(ArchiveReader::from_bytes(damaged.clone(), OpenOptions::new()).is_err());

        let mut recovered = ArchiveReader::from_bytes(damaged, OpenOptions::new().recovery(true)).unwrap();
        assert!(recovered.scan_report().unwrap().accepted.is_some(), "{policy:?}");
        assert_eq!(recovered.entries().as_slice(), normal.entries().as_slice(), "{policy:?}");
        assert_eq!(recovered.blocks().len(), normal.blocks().len());
        for (a, b) in recovered.blocks().iter().zip(normal.blocks()) {
            assert_eq!((a.offset, a.size, a.u_size, a.crc), (b.offset, b.size, b.u_size, b.crc));
        }
        assert_eq!(recovered.read_entry(2).unwrap(), entries[2].1);
    }
}

#[test]
fn test_unfinished_writer_leaves_recoverable_placeholder() {
    let mut w = ArchiveWriter::new(Cursor::new(Vec::new()), WriteOptions::default()).unwrap();
    w.add_entry(Entry::file("lost"), b"never indexed").unwrap();
    w.close_entry().unwrap();
    let partial = w.into_inner().unwrap().into_inner();
    let err = ArchiveReader::from_bytes(partial.clone(), OpenOptions::new()).unwrap_err();
    assert!(err.is_corruption());
    // no metadata was ever written, so the scan has nothing to find
    assert!(ArchiveReader::from_bytes(partial, OpenOptions::new().recovery(true)).is_err());
}

#[test]
fn test_start_header_crc_is_soft_in_recovery() {
    let mut archive = build(WriteOptions::default(), &[("a", sample(100, 0))]);
    archive[8] ^= 0xFF;
    let err = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }), "{err:?}");
    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new().recovery(true)).unwrap();
    assert_eq!(r.warnings().len(), 1);
    assert_eq!(r.read_entry(0).unwrap(), sample(100, 0));
}

// ── corruption ───────────────────────────────────────────────────────────────

#[test]
fn test_data_corruption_fails_entry_crc() {
    let options = WriteOptions::default().codecs(vec![Arc::new(CopyCodec)]);
    let mut archive = build(options, &[("a", sample(64, 0)), ("b", sample(64, 1))]);
    archive[SUPERBLOCK_SIZE + 70] ^= 0x01;

    let mut r = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap();
    assert_eq!(r.read_entry(0).unwrap(), sample(64, 0));
    let err = r.read_entry(1).unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }), "{err:?}");
    assert!(r.verify_block(0).is_err());

    let mut lenient = ArchiveReader::from_bytes(archive, OpenOptions::new().recovery(true)).unwrap();
    let damaged = lenient.read_entry(1).unwrap();
    assert_eq!(damaged.len(), 64);
    assert_ne!(damaged, sample(64, 1));
}

#[test]
fn test_metadata_corruption_is_detected() {
    let mut archive = build(
        WriteOptions::default().header_compression(HeaderCompression::Never),
        &[("a", sample(10, 0))],
    );
    let last = archive.len() - 3;
    archive[last] ^= 0x40;
    let err = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap_err();
    assert!(err.is_corruption(), "{err:?}");
}

#[test]
fn test_not_an_archive() {
    let err = ArchiveReader::from_bytes(vec![0x42; 64], OpenOptions::new()).unwrap_err();
    assert!(matches!(err, ArchiveError::BadMagic));
}

// ── passwords ────────────────────────────────────────────────────────────────

fn encrypted_archive() -> Vec<u8> {
    let options = WriteOptions::default()
        .header_compression(HeaderCompression::Always)
        .encrypt("correct horse", fast_kdf())
        .unwrap();
    build(options, &[("secret.txt", b"attack at dawn".to_vec()), ("more", sample(5000, 4))])
}

#[test]
fn test_password_round_trip() {
    let mut r = ArchiveReader::from_bytes(encrypted_archive(), OpenOptions::new().password("correct horse")).unwrap();
    assert!(r.blocks()[0].is_encrypted());
    assert_eq!(r.read_entry(0).unwrap(), b"attack at dawn");
    assert_eq!(r.read_entry(1).unwrap(), sample(5000, 4));
}

#[test]
fn test_missing_and_wrong_password() {
    let err = ArchiveReader::from_bytes(encrypted_archive(), OpenOptions::new()).unwrap_err();
    assert!(matches!(err, ArchiveError::MissingPassword), "{err:?}");
    let err = ArchiveReader::from_bytes(encrypted_archive(), OpenOptions::new().password("nope")).unwrap_err();
    assert!(matches!(err, ArchiveError::WrongPassword), "{err:?}");
}

#[test]
fn test_plain_metadata_encrypted_blocks() {
    let options = WriteOptions::default()
        .header_compression(HeaderCompression::Never)
        .encrypt("pw", fast_kdf())
        .unwrap();
    let archive = build(options, &[("x", sample(100, 0))]);
    let mut r = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap();
    assert_eq!(r.entries().len(), 1);
    assert!(matches!(r.read_entry(0).unwrap_err(), ArchiveError::MissingPassword));
    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new().password("pw")).unwrap();
    assert_eq!(r.read_entry(0).unwrap(), sample(100, 0));
}

// ── memory limit ─────────────────────────────────────────────────────────────

#[test]
fn test_memory_limit() {
    let entries = vec![("a", sample(1000, 0)), ("b", sample(1000, 1))];
    let plain = build(WriteOptions::default().header_compression(HeaderCompression::Never), &entries);
    let mut r = ArchiveReader::from_bytes(plain, OpenOptions::new().memory_limit_kb(1024)).unwrap();
    assert!(matches!(r.read_entry(0).unwrap_err(), ArchiveError::MemoryLimit { .. }));

    let packed = build(WriteOptions::default().header_compression(HeaderCompression::Always), &entries);
    let err = ArchiveReader::from_bytes(packed.clone(), OpenOptions::new().memory_limit_kb(1024)).unwrap_err();
    assert!(matches!(err, ArchiveError::MemoryLimit { .. }), "{err:?}");
    assert!(ArchiveReader::from_bytes(packed, OpenOptions::new().memory_limit_kb(64 * 1024)).is_ok());
}

#[test]
fn test_lzma_window_counts_against_memory_limit() {
    let data = sample(1024 * 1024, 4);
    let options = WriteOptions::default()
        .codecs(vec![CodecId::Lzma.encoder(0).unwrap()])
        .header_compression(HeaderCompression::Never);
    let archive = build(options, &[("big", data.clone())]);

    let mut r = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new().memory_limit_kb(9000)).unwrap();
    let err = r.get_input(0).map(|_| ()).unwrap_err();
    assert!(matches!(err, ArchiveError::MemoryLimit { .. }), "{err:?}");

    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new().memory_limit_kb(32 * 1024)).unwrap();
    let mut head = [0u8; 16];
    r.get_input(0).unwrap().read_exact(&mut head).unwrap();
    assert_eq!(head, data[..16]);
    assert_eq!(r.read_entry(0).unwrap(), data);
}

// ── unknown codec ────────────────────────────────────────────────────────────

/// A transform this build's registry does not know.
#[derive(Debug)]
struct Rot13;

impl Codec for Rot13 {
    fn method_id(&self) -> &[u8] { &[0x7E, 0x13] }
    fn name(&self) -> &str { "rot13" }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(Rot13) }
    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> { Ok(sink) }
    fn decode(&self, source: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Ok(source)
    }
}

#[test]
fn test_unknown_codec_is_a_placeholder() {
    let options = WriteOptions::default()
        .codecs(vec![Arc::new(Rot13)])
        .header_compression(HeaderCompression::Never);
    let archive = build(options, &[("a", b"abc".to_vec())]);
    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    assert_eq!(r.entries().get(0).unwrap().size, 3);
    assert_eq!(r.blocks()[0].graph.method_names(), ["7e13"]);
    let err = r.read_entry(0).unwrap_err();
    assert!(matches!(err, ArchiveError::UnsupportedCodec { .. }), "{err:?}");
}

// ── detached writers ─────────────────────────────────────────────────────────

#[test]
fn test_detached_writers_from_threads() {
    let mut w = ArchiveWriter::new(Cursor::new(Vec::new()), WriteOptions::default()).unwrap();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let mut d = w.detached().unwrap();
            thread::spawn(move || {
                for i in 0..3 {
                    d.add_entry(Entry::file(format!("t{t}/f{i}")), &sample(500 + i * 10, t as u8)).unwrap();
                }
                d.finish().unwrap();
            })
        })
        .collect();
    w.add_entry(Entry::file("main"), b"parent data").unwrap();
    for h in handles {
        h.join().unwrap();
    }
    w.finish().unwrap();
    let archive = w.into_inner().unwrap().into_inner();

    let mut r = ArchiveReader::from_bytes(archive, OpenOptions::new()).unwrap();
    assert_eq!(r.entries().len(), 13);
    assert_eq!(r.blocks().len(), 5);
    assert_block_accounting(&r);
    for t in 0..4u8 {
        let i = r.position(&format!("t{t}/f2")).unwrap().unwrap();
        assert_eq!(r.read_entry(i).unwrap(), sample(520, t));
    }
}

#[test]
fn test_dropped_detached_writer_contributes_nothing() {
    let mut w = ArchiveWriter::new(Cursor::new(Vec::new()), WriteOptions::default()).unwrap();
    let mut d = w.detached().unwrap();
    d.add_entry(Entry::file("abandoned"), b"xyz").unwrap();
    drop(d);
    w.add_entry(Entry::file("kept"), b"data").unwrap();
    w.finish().unwrap();
    let r = ArchiveReader::from_bytes(w.into_inner().unwrap().into_inner(), OpenOptions::new()).unwrap();
    assert_eq!(r.entries().len(), 1);
}

// ── append / copy ────────────────────────────────────────────────────────────

#[test]
fn test_append_to_existing_archive() {
    let file = NamedTempFile::new().unwrap();
    {
        let mut w = ArchiveWriter::create(file.path(), WriteOptions::default()).unwrap();
        w.add_entry(Entry::file("first"), &sample(2000, 1)).unwrap();
        w.add_entry(Entry::directory("dir"), &[]).unwrap();
        w.finish().unwrap();
    }
    let end = {
        let mut w = ArchiveWriter::append(file.path(), WriteOptions::default()).unwrap();
        assert_eq!(w.entries().len(), 2);
        w.add_entry(Entry::file("second"), &sample(3000, 2)).unwrap();
        w.finish().unwrap()
    };
    assert_eq!(std::fs::metadata(file.path()).unwrap().len(), end);

    let mut r = ArchiveReader::open(file.path(), OpenOptions::new()).unwrap();
    assert_eq!(r.blocks().len(), 2);
    assert_eq!(r.entries().len(), 3);
    assert_eq!(r.read_entry(0).unwrap(), sample(2000, 1));
    assert_eq!(r.read_entry(2).unwrap(), sample(3000, 2));
    assert_block_accounting(&r);
}

#[test]
fn test_copy_block_between_archives() {
    let source = build(
        WriteOptions::default().solid(SolidMode::PerEntry),
        &[("a", sample(100, 1)), ("b", sample(200, 2))],
    );
    let src = ArchiveReader::from_bytes(source, OpenOptions::new()).unwrap();

    let mut w = ArchiveWriter::new(Cursor::new(Vec::new()), WriteOptions::default()).unwrap();
    w.add_entry(Entry::file("new"), b"fresh").unwrap();
    w.copy_block(&src, 1).unwrap();
    w.finish().unwrap();

    let mut r = ArchiveReader::from_bytes(w.into_inner().unwrap().into_inner(), OpenOptions::new()).unwrap();
    assert_eq!(read_all(&mut r), vec![("new".to_string(), b"fresh".to_vec()), ("b".to_string(), sample(200, 2))]);
    assert_block_accounting(&r);
}

// ── facade ───────────────────────────────────────────────────────────────────

#[test]
fn test_archive_facade_round_trip() {
    let src = tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("tree/sub")).unwrap();
    std::fs::write(src.path().join("tree/a.txt"), b"file a").unwrap();
    std::fs::write(src.path().join("tree/sub/b.bin"), sample(10_000, 5)).unwrap();
    std::fs::write(src.path().join("tree/sub/empty"), b"").unwrap();

    let archive_file = NamedTempFile::new().unwrap();
    {
        let opts = PackOptions { password: Some("pw".into()), kdf: Some(fast_kdf()), ..PackOptions::default() };
        let mut ar = Archive::create(archive_file.path(), opts).unwrap();
        assert_eq!(ar.add_path(src.path().join("tree"), "tree").unwrap(), 5);
        ar.finalize().unwrap();
    }

    let mut ar = Archive::open_encrypted(archive_file.path(), "pw").unwrap();
    assert_eq!(ar.list().len(), 5);
    assert_eq!(ar.read_file("tree/a.txt").unwrap(), b"file a");
    assert_eq!(ar.test().unwrap(), 6 + 10_000);
    let summary = ar.summary().unwrap();
    assert!(summary.encrypted);
    assert_eq!(summary.directories, 2);

    let out = tempdir().unwrap();
    assert_eq!(ar.extract_all(out.path()).unwrap(), 5);
    assert_eq!(std::fs::read(out.path().join("tree/sub/b.bin")).unwrap(), sample(10_000, 5));
    assert!(out.path().join("tree/sub/empty").is_file());
}
