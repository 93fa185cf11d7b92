//! Metadata serializer.  Produces exactly the layout [`super::read`] accepts.

use super::bytes::ByteSink;
use super::{nid, ArchiveMetadata};
use crate::block::WordBlock;
use crate::error::{ArchiveError, Result};
use crate::index::{AttributeCounts, Entry};

fn inconsistent(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::WriterState(msg.into())
}

pub fn encode_metadata(meta: &ArchiveMetadata) -> Result<Vec<u8>> {
    let mut out = vec![nid::HEADER];
    if !meta.blocks.is_empty() {
        let groups = stream_groups(meta)?;
        out.push(nid::MAIN_STREAMS_INFO);
        write_streams_info(&mut out, &meta.blocks, Some(&groups))?;
    }
    if !meta.entries.is_empty() {
        write_files_info(&mut out, &meta.entries, &meta.counts);
    }
    out.push(nid::END);
    Ok(out)
}

/// Record pointing at a block that holds the real (packed) metadata.
pub fn encoded_header_record(block: &WordBlock) -> Result<Vec<u8>> {
    let mut out = vec![nid::ENCODED_HEADER];
    write_streams_info(&mut out, std::slice::from_ref(block), None)?;
    Ok(out)
}

/// Stored entries grouped per block.  Present order must visit blocks in
/// ascending order and each block's entries back to back.
fn stream_groups(meta: &ArchiveMetadata) -> Result<Vec<Vec<&Entry>>> {
    let mut groups: Vec<Vec<&Entry>> = vec![Vec::new(); meta.blocks.len()];
    let mut current = 0;
    for e in meta.entries.iter().filter(|e| e.has_stream()) {
        let bi = e.block.unwrap_or_default();
        if bi < current || bi >= groups.len() {
            return Err(inconsistent(format!("entry {:?} is out of block order", e.name)));
        }
        current = bi;
        let expected: u64 = groups[bi].iter().map(|e| e.size).sum();
        if e.offset != expected {
            return Err(inconsistent(format!("entry {:?} is not contiguous in block {bi}", e.name)));
        }
        groups[bi].push(e);
    }
    for (bi, (b, g)) in meta.blocks.iter().zip(&groups).enumerate() {
        let sum: u64 = g.iter().map(|e| e.size).sum();
        if sum != b.u_size {
            return Err(inconsistent(format!("block {bi} holds {} bytes but its entries sum to {sum}", b.u_size)));
        }
    }
    Ok(groups)
}

fn write_streams_info(out: &mut Vec<u8>, blocks: &[WordBlock], groups: Option<&[Vec<&Entry>]>) -> Result<()> {
    let pack_pos = blocks.first().map_or(0, |b| b.offset);
    let mut expected = pack_pos;
    for (bi, b) in blocks.iter().enumerate() {
        if b.offset != expected {
            return Err(inconsistent(format!("block {bi} starts at {} instead of {expected}", b.offset)));
        }
        if b.extra_sizes.len() + 1 != b.graph.raw_count() {
            return Err(inconsistent(format!("block {bi} records {} raw streams", b.extra_sizes.len() + 1)));
        }
        if b.out_sizes.len() + 1 != b.graph.output_count() {
            return Err(inconsistent(format!("block {bi} records {} output sizes", b.out_sizes.len() + 1)));
        }
        expected = b.end();
    }

    out.push(nid::PACK_INFO);
    out.put_number(pack_pos);
    out.put_number(blocks.iter().map(|b| b.graph.raw_count() as u64).sum());
    out.push(nid::SIZE);
    for size in blocks.iter().flat_map(WordBlock::raw_sizes) {
        out.put_number(size);
    }
    out.push(nid::END);

    out.push(nid::UNPACK_INFO);
    out.push(nid::FOLDER);
    out.put_number(blocks.len() as u64);
    out.push(0);
    for b in blocks {
        b.graph.write_folder(out);
    }
    out.push(nid::CODERS_UNPACK_SIZE);
    for b in blocks {
        let root = b.graph.root_global_output();
        let mut others = b.out_sizes.iter().copied();
        for g in 0..b.graph.output_count() {
            let size = if g == root { b.u_size } else { others.next().unwrap_or_default() };
            out.put_number(size);
        }
    }
    write_digests(out, blocks.iter().map(|b| b.crc));
    out.push(nid::END);

    if let Some(groups) = groups {
        out.push(nid::SUBSTREAMS_INFO);
        if groups.iter().any(|g| g.len() != 1) {
            out.push(nid::NUM_UNPACK_STREAM);
            for g in groups {
                out.put_number(g.len() as u64);
            }
        }
        if groups.iter().any(|g| g.len() > 1) {
            out.push(nid::SIZE);
            for g in groups.iter().filter(|g| !g.is_empty()) {
                for e in &g[..g.len() - 1] {
                    out.put_number(e.size);
                }
            }
        }
        let own_digests = blocks
            .iter()
            .zip(groups)
            .filter(|(b, g)| !(g.len() == 1 && b.crc.is_some()))
            .flat_map(|(_, g)| g.iter().map(|e| e.crc));
        write_digests(out, own_digests);
        out.push(nid::END);
    }
    out.push(nid::END);
    Ok(())
}

/// CRC record; omitted entirely when no digest is defined.
fn write_digests(out: &mut Vec<u8>, digests: impl Iterator<Item = Option<u32>>) {
    let digests: Vec<Option<u32>> = digests.collect();
    if !digests.iter().any(Option::is_some) {
        return;
    }
    out.push(nid::CRC);
    out.put_defined(&digests.iter().map(Option::is_some).collect::<Vec<_>>());
    for crc in digests.into_iter().flatten() {
        out.put_u32_le(crc);
    }
}

fn property(out: &mut Vec<u8>, kind: u8, body: Vec<u8>) {
    out.push(kind);
    out.put_number(body.len() as u64);
    out.extend_from_slice(&body);
}

fn optional_property<T: Copy>(
    out:     &mut Vec<u8>,
    kind:    u8,
    count:   usize,
    entries: &[Entry],
    get:     impl Fn(&Entry) -> Option<T>,
    put:     impl Fn(&mut Vec<u8>, T),
) {
    if count == 0 {
        return;
    }
    let mut body = Vec::new();
    body.put_defined(&entries.iter().map(|e| get(e).is_some()).collect::<Vec<_>>());
    body.push(0);
    for v in entries.iter().filter_map(&get) {
        put(&mut body, v);
    }
    property(out, kind, body);
}

fn write_files_info(out: &mut Vec<u8>, entries: &[Entry], counts: &AttributeCounts) {
    out.push(nid::FILES_INFO);
    out.put_number(entries.len() as u64);

    if counts.empty > 0 {
        let mut body = Vec::new();
        body.put_bits(&entries.iter().map(|e| !e.has_stream()).collect::<Vec<_>>());
        property(out, nid::EMPTY_STREAM, body);

        let empties: Vec<&Entry> = entries.iter().filter(|e| !e.has_stream()).collect();
        if counts.empty_file > 0 {
            let mut body = Vec::new();
            body.put_bits(&empties.iter().map(|e| !e.is_directory).collect::<Vec<_>>());
            property(out, nid::EMPTY_FILE, body);
        }
        if counts.anti > 0 {
            let mut body = Vec::new();
            body.put_bits(&empties.iter().map(|e| e.is_anti).collect::<Vec<_>>());
            property(out, nid::ANTI, body);
        }
    }

    let mut names = vec![0u8];
    for e in entries {
        for unit in e.name.encode_utf16() {
            names.extend_from_slice(&unit.to_le_bytes());
        }
        names.extend_from_slice(&[0, 0]);
    }
    property(out, nid::NAME, names);

    let put_time = |b: &mut Vec<u8>, t: crate::index::FileTime| b.put_u64_le(t.0);
    optional_property(out, nid::CTIME, counts.ctime, entries, |e| e.ctime, put_time);
    optional_property(out, nid::ATIME, counts.atime, entries, |e| e.atime, put_time);
    optional_property(out, nid::MTIME, counts.mtime, entries, |e| e.mtime, put_time);
    optional_property(out, nid::WIN_ATTRIBUTES, counts.attributes, entries, |e| e.attributes, |b, a| b.put_u32_le(a));
    out.push(nid::END);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CopyCodec, ZstdCodec};
    use crate::graph::CoderGraph;
    use crate::header::read::{parse_metadata, MetadataSource, ParseOptions};
    use crate::index::FileTime;
    use crate::recovery::Diagnostics;
    use std::sync::Arc;

    struct Refuse;

    impl MetadataSource for Refuse {
        fn unpack(&mut self, _: &WordBlock) -> Result<Vec<u8>> {
            Err(ArchiveError::corrupted("unexpected"))
        }
    }

    fn stored(name: &str, block: usize, offset: u64, data: &[u8]) -> Entry {
        Entry {
            name: name.into(),
            size: data.len() as u64,
            crc: Some(crc32fast::hash(data)),
            block: Some(block),
            offset,
            ..Entry::default()
        }
    }

    fn sample() -> ArchiveMetadata {
        let graph = Arc::new(CoderGraph::linear(vec![Arc::new(ZstdCodec::default())]).unwrap());
        let copy = Arc::new(CoderGraph::linear(vec![Arc::new(CopyCodec)]).unwrap());
        let blocks = vec![
            WordBlock {
                graph, offset: 0, size: 40, extra_sizes: vec![], out_sizes: vec![],
                u_size: 11, crc: None, file_count: 2, first_entry: None,
            },
            WordBlock {
                graph: copy, offset: 40, size: 5, extra_sizes: vec![], out_sizes: vec![],
                u_size: 5, crc: Some(crc32fast::hash(b"third")), file_count: 1, first_entry: None,
            },
        ];
        let mut entries = vec![
            Entry::directory("dir").with_mtime(FileTime(99)),
            stored("dir/a", 0, 0, b"hello "),
            Entry::file("dir/empty"),
            stored("dir/b", 0, 6, b"world"),
            stored("c", 1, 0, b"third").with_attributes(0x20),
            Entry::anti("gone", false),
        ];
        entries[4].crc = blocks[1].crc;
        let mut meta = ArchiveMetadata { counts: AttributeCounts::from_entries(&entries), blocks, entries };
        meta.relink();
        meta
    }

    #[test]
    fn metadata_round_trips() {
        let meta = sample();
        let bytes = encode_metadata(&meta).unwrap();
        let parsed = parse_metadata(&bytes, &ParseOptions::default(), &mut Diagnostics::strict(), &mut Refuse).unwrap();
        assert_eq!(parsed.entries, meta.entries);
        assert_eq!(parsed.counts, meta.counts);
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[1].offset, 40);
        assert_eq!(parsed.blocks[1].crc, meta.blocks[1].crc);
        assert_eq!(parsed.blocks[0].first_entry, Some(1));
        assert_eq!(parsed.entries[1].next, Some(3));
    }

    #[test]
    fn non_contiguous_blocks_are_refused() {
        let mut meta = sample();
        meta.blocks[1].offset = 41;
        assert!(matches!(encode_metadata(&meta), Err(ArchiveError::WriterState(_))));
    }

    #[test]
    fn block_size_must_match_entries() {
        let mut meta = sample();
        meta.blocks[0].u_size = 12;
        assert!(encode_metadata(&meta).is_err());
    }
}
