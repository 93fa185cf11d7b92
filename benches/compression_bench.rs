use criterion::{black_box, criterion_group, criterion_main, Criterion};
use solid7z::index::Entry;
use solid7z::io_stream::{ArchiveReader, ArchiveWriter, OpenOptions, SolidMode, WriteOptions};
use solid7z::scheduler::InlineScheduler;
use solid7z::CodecId;
use std::io::{Cursor, Read};

fn pack(codec: CodecId, solid: SolidMode, files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let options = WriteOptions::default()
        .codecs(vec![codec.encoder(3).unwrap()])
        .solid(solid);
    let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()), options).unwrap();
    for (name, data) in files {
        writer.add_entry(Entry::file(name.as_str()), data).unwrap();
    }
    writer.finish().unwrap();
    writer.into_inner().unwrap().into_inner()
}

fn text_like(len: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog; "
        .iter()
        .cycle()
        .enumerate()
        .map(|(i, b)| b ^ ((i / 4096) as u8 & 0x1F))
        .take(len)
        .collect()
}

fn bench_pack_single_file(c: &mut Criterion) {
    let files = vec![("bench.bin".to_string(), text_like(1024 * 1024))];

    for codec in [CodecId::Zstd, CodecId::Lz4, CodecId::Lzma] {
        c.bench_function(&format!("pack_1mb_{}", codec.name()), |b| {
            b.iter(|| pack(codec, SolidMode::Single, black_box(&files)))
        });
    }
}

fn bench_solid_small_files(c: &mut Criterion) {
    let files: Vec<(String, Vec<u8>)> =
        (0..256).map(|i| (format!("file_{i}.txt"), text_like(2048 + i * 7))).collect();

    c.bench_function("pack_256_small_single_block", |b| {
        b.iter(|| pack(CodecId::Zstd, SolidMode::Single, black_box(&files)))
    });
    c.bench_function("pack_256_small_per_entry", |b| {
        b.iter(|| pack(CodecId::Zstd, SolidMode::PerEntry, black_box(&files)))
    });
}

fn bench_read_back(c: &mut Criterion) {
    let files: Vec<(String, Vec<u8>)> =
        (0..64).map(|i| (format!("file_{i}.bin"), text_like(16 * 1024))).collect();
    let archive = pack(CodecId::Zstd, SolidMode::Bytes(256 * 1024), &files);

    c.bench_function("read_sequential_1mb", |b| {
        b.iter(|| {
            let mut reader = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap();
            for i in 0..reader.entries().len() {
                black_box(reader.read_entry(i).unwrap());
            }
        })
    });

    c.bench_function("read_parallel_inline_1mb", |b| {
        b.iter(|| {
            let reader = ArchiveReader::from_bytes(archive.clone(), OpenOptions::new()).unwrap();
            reader
                .parallel_decompress(&InlineScheduler, |_, _, data| {
                    let mut buf = Vec::new();
                    data.read_to_end(&mut buf)?;
                    black_box(buf);
                    Ok(())
                })
                .unwrap()
                .wait()
                .unwrap();
        })
    });
}

criterion_group!(benches, bench_pack_single_file, bench_solid_small_files, bench_read_back);
criterion_main!(benches);
