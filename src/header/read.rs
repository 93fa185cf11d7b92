//! Metadata parser.
//!
//! Record order is fixed: an optional chain of encoded-header records, then
//! `Header` → archive properties → main streams info → files info → `End`.
//! File properties are collected first and applied afterwards, because the
//! empty-stream bitmap decides how every other property is indexed.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::bytes::ByteReader;
use super::{nid, ArchiveMetadata};
use crate::block::WordBlock;
use crate::error::{ArchiveError, Result};
use crate::graph::CoderGraph;
use crate::index::{AttributeCounts, Entry, FileTime};
use crate::recovery::Diagnostics;

const MAX_HEADER_NESTING: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub max_entries:   usize,
    /// Drop timestamps and attributes while parsing.
    pub skip_metadata: bool,
    /// Bytes after the final `End` are fatal even in recovery mode.
    pub exact:         bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { max_entries: 0xFFFFF, skip_metadata: false, exact: false }
    }
}

/// Decodes the block an encoded-header record points at.
pub trait MetadataSource {
    fn unpack(&mut self, block: &WordBlock) -> Result<Vec<u8>>;
}

fn corrupted(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::corrupted(msg)
}

pub fn parse_metadata(
    buf:    &[u8],
    opts:   &ParseOptions,
    diag:   &mut Diagnostics,
    source: &mut dyn MetadataSource,
) -> Result<ArchiveMetadata> {
    let mut current = Cow::Borrowed(buf);
    for depth in 0..=MAX_HEADER_NESTING {
        let decoded = {
            let mut p = Parser { r: ByteReader::new(&current), opts, diag: &mut *diag };
            match p.r.read_u8()? {
                nid::HEADER => return p.header(),
                nid::ENCODED_HEADER => {}
                other => return Err(corrupted(format!("metadata starts with record {other:#04x}"))),
            }
            let streams = p.streams_info()?;
            p.finish()?;
            let [block]: [WordBlock; 1] = streams
                .blocks
                .try_into()
                .map_err(|v: Vec<WordBlock>| corrupted(format!("encoded header describes {} blocks", v.len())))?;
            debug!(depth, packed = block.packed_len(), unpacked = block.u_size, "decoding encoded header");
            let bytes = source.unpack(&block)?;
            if bytes.len() as u64 != block.u_size {
                return Err(ArchiveError::UnexpectedEof);
            }
            if let Some(expected) = block.crc {
                let actual = crc32fast::hash(&bytes);
                if actual != expected {
                    diag.soft(ArchiveError::ChecksumMismatch { what: "metadata", expected, actual })?;
                }
            }
            bytes
        };
        current = Cow::Owned(decoded);
    }
    Err(corrupted(format!("encoded headers nested deeper than {MAX_HEADER_NESTING}")))
}

#[derive(Debug, Default)]
struct StreamsInfo {
    blocks:  Vec<WordBlock>,
    /// One entry per stored stream, block by block.
    streams: Vec<Entry>,
}

struct Parser<'a, 'o, 'd> {
    r:    ByteReader<'a>,
    opts: &'o ParseOptions,
    diag: &'d mut Diagnostics,
}

impl<'a> Parser<'a, '_, '_> {
    fn expect_end(&mut self, id: u8, section: &str) -> Result<()> {
        if id != nid::END {
            return Err(corrupted(format!("unexpected record {id:#04x} in {section}")));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.r.is_empty() {
            return Ok(());
        }
        let err = corrupted(format!("{} bytes after the final end marker", self.r.remaining()));
        if self.opts.exact {
            return Err(err);
        }
        self.diag.soft(err)
    }

    // ── Header ───────────────────────────────────────────────────────────────

    fn header(&mut self) -> Result<ArchiveMetadata> {
        let mut id = self.r.read_u8()?;
        if id == nid::ARCHIVE_PROPERTIES {
            self.archive_properties()?;
            id = self.r.read_u8()?;
        }
        if id == nid::ADDITIONAL_STREAMS_INFO {
            return Err(corrupted("additional streams are not supported"));
        }
        let mut streams = StreamsInfo::default();
        if id == nid::MAIN_STREAMS_INFO {
            streams = self.streams_info()?;
            id = self.r.read_u8()?;
        }
        let entries = if id == nid::FILES_INFO {
            let entries = self.files_info(std::mem::take(&mut streams.streams))?;
            id = self.r.read_u8()?;
            entries
        } else {
            streams.streams
        };
        self.expect_end(id, "header")?;
        self.finish()?;

        let mut meta = ArchiveMetadata {
            counts: AttributeCounts::from_entries(&entries),
            blocks: streams.blocks,
            entries,
        };
        meta.relink();
        Ok(meta)
    }

    fn archive_properties(&mut self) -> Result<()> {
        loop {
            let kind = self.r.read_u8()?;
            if kind == nid::END {
                return Ok(());
            }
            let size = self.r.read_size()?;
            debug!(kind, size, "skipping archive property");
            self.r.skip(size)?;
        }
    }

    // ── Streams ──────────────────────────────────────────────────────────────

    fn streams_info(&mut self) -> Result<StreamsInfo> {
        let mut id = self.r.read_u8()?;
        let mut pack = (0, Vec::new());
        if id == nid::PACK_INFO {
            pack = self.pack_info()?;
            id = self.r.read_u8()?;
        }
        let mut blocks = Vec::new();
        if id == nid::UNPACK_INFO {
            blocks = self.unpack_info()?;
            id = self.r.read_u8()?;
        }
        let streams = if id == nid::SUBSTREAMS_INFO {
            let s = self.substreams_info(&mut blocks)?;
            id = self.r.read_u8()?;
            s
        } else {
            single_streams(&blocks)
        };
        self.expect_end(id, "streams info")?;

        let (pack_pos, sizes) = pack;
        let mut used = 0;
        let mut pos = pack_pos;
        for (i, b) in blocks.iter_mut().enumerate() {
            let n = b.graph.raw_count();
            let raw = sizes
                .get(used..used + n)
                .ok_or_else(|| corrupted(format!("block {i} needs {n} packed streams, not enough listed")))?;
            b.offset = pos;
            b.size = raw[0];
            b.extra_sizes = raw[1..].to_vec();
            pos = pos
                .checked_add(b.packed_len())
                .filter(|&p| p <= i64::MAX as u64)
                .ok_or_else(|| corrupted("packed streams overflow"))?;
            used += n;
        }
        if used != sizes.len() {
            self.diag.soft(corrupted(format!("{} packed streams are not used by any block", sizes.len() - used)))?;
        }
        Ok(StreamsInfo { blocks, streams })
    }

    fn pack_info(&mut self) -> Result<(u64, Vec<u64>)> {
        let pack_pos = self.r.read_size()?;
        let count = self.r.read_count(self.opts.max_entries)?;
        let mut id = self.r.read_u8()?;
        let mut sizes = Vec::new();
        if id == nid::SIZE {
            sizes = (0..count).map(|_| self.r.read_size()).collect::<Result<_>>()?;
            id = self.r.read_u8()?;
        } else if count > 0 {
            return Err(corrupted("pack info without sizes"));
        }
        if id == nid::CRC {
            // pack-stream digests are not checked; block and entry CRCs cover the data
            self.r.read_digests(count)?;
            id = self.r.read_u8()?;
        }
        self.expect_end(id, "pack info")?;
        Ok((pack_pos, sizes))
    }

    fn unpack_info(&mut self) -> Result<Vec<WordBlock>> {
        let id = self.r.read_u8()?;
        if id != nid::FOLDER {
            return Err(corrupted(format!("unpack info starts with {id:#04x}")));
        }
        let count = self.r.read_count(self.opts.max_entries)?;
        self.r.expect_inline()?;
        let strict = !self.diag.is_lenient();
        let graphs = (0..count)
            .map(|_| CoderGraph::read_folder(&mut self.r, strict).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let id = self.r.read_u8()?;
        if id != nid::CODERS_UNPACK_SIZE {
            return Err(corrupted(format!("expected coder unpack sizes, found {id:#04x}")));
        }
        let mut blocks = Vec::with_capacity(count);
        for graph in graphs {
            let root = graph.root_global_output();
            let mut out_sizes = Vec::with_capacity(graph.output_count() - 1);
            let mut u_size = 0;
            for g in 0..graph.output_count() {
                let size = self.r.read_size()?;
                if g == root {
                    u_size = size;
                } else {
                    out_sizes.push(size);
                }
            }
            blocks.push(WordBlock {
                graph,
                offset: 0,
                size: 0,
                extra_sizes: Vec::new(),
                out_sizes,
                u_size,
                crc: None,
                file_count: 1,
                first_entry: None,
            });
        }

        let mut id = self.r.read_u8()?;
        if id == nid::CRC {
            for (b, crc) in blocks.iter_mut().zip(self.r.read_digests(count)?) {
                b.crc = crc;
            }
            id = self.r.read_u8()?;
        }
        self.expect_end(id, "unpack info")?;
        Ok(blocks)
    }

    fn substreams_info(&mut self, blocks: &mut [WordBlock]) -> Result<Vec<Entry>> {
        let mut id = self.r.read_u8()?;
        if id == nid::NUM_UNPACK_STREAM {
            let mut total = 0usize;
            for b in blocks.iter_mut() {
                let n = self.r.read_count(self.opts.max_entries)?;
                total += n;
                b.file_count = n as u64;
            }
            if total > self.opts.max_entries {
                return Err(corrupted(format!("{total} streams exceed the entry limit")));
            }
            id = self.r.read_u8()?;
        }

        let has_sizes = id == nid::SIZE;
        let mut streams = Vec::new();
        for (bi, b) in blocks.iter().enumerate() {
            if b.file_count == 0 {
                continue;
            }
            let mut sum = 0u64;
            for _ in 1..b.file_count {
                if !has_sizes {
                    return Err(corrupted(format!("block {bi} holds {} entries but no sizes", b.file_count)));
                }
                let size = self.r.read_size()?;
                streams.push(Entry { size, offset: sum, block: Some(bi), ..Entry::default() });
                sum = sum.checked_add(size).ok_or_else(|| corrupted("entry sizes overflow"))?;
            }
            let last = b
                .u_size
                .checked_sub(sum)
                .ok_or_else(|| corrupted(format!("block {bi}: entry sizes exceed its {} bytes", b.u_size)))?;
            if last == 0 && b.file_count > 1 {
                self.diag.soft(corrupted(format!("block {bi}: last entry is empty")))?;
            }
            streams.push(Entry { size: last, offset: sum, block: Some(bi), crc: None, ..Entry::default() });
        }
        if has_sizes {
            id = self.r.read_u8()?;
        }

        let inherits = |b: &WordBlock| b.file_count == 1 && b.crc.is_some();
        for e in &mut streams {
            if let Some(b) = e.block.map(|i| &blocks[i]).filter(|b| inherits(*b)) {
                e.crc = b.crc;
            }
        }
        if id == nid::CRC {
            let needed: usize = blocks.iter().filter(|b| !inherits(b)).map(|b| b.file_count as usize).sum();
            let mut digests = self.r.read_digests(needed)?.into_iter();
            for e in &mut streams {
                let Some(bi) = e.block else { continue };
                if inherits(&blocks[bi]) {
                    continue;
                }
                e.crc = digests.next().flatten();
                if blocks[bi].file_count == 1 {
                    blocks[bi].crc = e.crc;
                }
            }
            id = self.r.read_u8()?;
        }
        self.expect_end(id, "substreams info")?;
        Ok(streams)
    }

    // ── Files ────────────────────────────────────────────────────────────────

    fn files_info(&mut self, streams: Vec<Entry>) -> Result<Vec<Entry>> {
        let n = self.r.read_count(self.opts.max_entries)?;
        let mut props: BTreeMap<u8, &'a [u8]> = BTreeMap::new();
        loop {
            let kind = self.r.read_u8()?;
            if kind == nid::END {
                break;
            }
            let size = usize::try_from(self.r.read_size()?).map_err(|_| corrupted("property too large"))?;
            let body = self.r.take(size)?;
            match kind {
                nid::EMPTY_STREAM | nid::EMPTY_FILE | nid::ANTI | nid::NAME | nid::CTIME | nid::ATIME
                | nid::MTIME | nid::WIN_ATTRIBUTES => {
                    if props.insert(kind, body).is_some() {
                        self.diag.soft(corrupted(format!("file property {kind:#04x} repeated")))?;
                    }
                }
                _ => debug!(kind, size, "skipping file property"),
            }
        }

        let empty = match props.get(&nid::EMPTY_STREAM) {
            Some(body) => self.property(body, nid::EMPTY_STREAM, |r| r.read_bits(n))?,
            None => vec![false; n],
        };
        let empty_count = empty.iter().filter(|&&e| e).count();
        let empty_file = match props.get(&nid::EMPTY_FILE) {
            Some(body) => self.property(body, nid::EMPTY_FILE, |r| r.read_bits(empty_count))?,
            None => vec![false; empty_count],
        };
        let anti = match props.get(&nid::ANTI) {
            Some(body) => self.property(body, nid::ANTI, |r| r.read_bits(empty_count))?,
            None => vec![false; empty_count],
        };
        if n - empty_count != streams.len() {
            return Err(corrupted(format!(
                "{} entries with data but {} stored streams",
                n - empty_count,
                streams.len()
            )));
        }

        let mut entries = Vec::with_capacity(n);
        let mut streams = streams.into_iter();
        let mut k = 0;
        for &is_empty in &empty {
            if is_empty {
                entries.push(Entry {
                    is_directory: !empty_file[k],
                    is_anti: anti[k],
                    ..Entry::default()
                });
                k += 1;
            } else {
                entries.push(streams.next().ok_or_else(|| corrupted("stream table exhausted"))?);
            }
        }

        if let Some(body) = props.get(&nid::NAME) {
            let lenient = self.diag.is_lenient();
            let names = self.property(body, nid::NAME, |r| read_names(r, n, lenient))?;
            for (e, name) in entries.iter_mut().zip(names) {
                e.name = name;
            }
        }
        if self.opts.skip_metadata {
            return Ok(entries);
        }
        for kind in [nid::CTIME, nid::ATIME, nid::MTIME] {
            let Some(body) = props.get(&kind) else { continue };
            let times = self.property(body, kind, |r| read_optional(r, n, |r| r.read_u64_le().map(FileTime)))?;
            for (e, t) in entries.iter_mut().zip(times) {
                match kind {
                    nid::CTIME => e.ctime = t,
                    nid::ATIME => e.atime = t,
                    _          => e.mtime = t,
                }
            }
        }
        if let Some(body) = props.get(&nid::WIN_ATTRIBUTES) {
            let attrs = self.property(body, nid::WIN_ATTRIBUTES, |r| read_optional(r, n, |r| r.read_u32_le()))?;
            for (e, a) in entries.iter_mut().zip(attrs) {
                e.attributes = a;
            }
        }
        Ok(entries)
    }

    /// Parse one property body; leftover bytes are a soft error.
    fn property<T>(
        &mut self,
        body:  &[u8],
        kind:  u8,
        parse: impl FnOnce(&mut ByteReader<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut r = ByteReader::new(body);
        let value = parse(&mut r)?;
        if !r.is_empty() {
            self.diag.soft(corrupted(format!("file property {kind:#04x} has {} unread bytes", r.remaining())))?;
        }
        Ok(value)
    }
}

fn single_streams(blocks: &[WordBlock]) -> Vec<Entry> {
    blocks
        .iter()
        .enumerate()
        .map(|(bi, b)| Entry { size: b.u_size, crc: b.crc, block: Some(bi), ..Entry::default() })
        .collect()
}

fn read_optional<T>(
    r:    &mut ByteReader<'_>,
    n:    usize,
    mut one: impl FnMut(&mut ByteReader<'_>) -> Result<T>,
) -> Result<Vec<Option<T>>> {
    let defined = r.read_defined(n)?;
    r.expect_inline()?;
    defined
        .into_iter()
        .map(|d| if d { one(r).map(Some) } else { Ok(None) })
        .collect()
}

fn read_names(r: &mut ByteReader<'_>, n: usize, lenient: bool) -> Result<Vec<String>> {
    r.expect_inline()?;
    if r.remaining() % 2 != 0 {
        return Err(corrupted("name table has odd length"));
    }
    let units: Vec<u16> = r
        .take(r.remaining())?
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let mut names = Vec::with_capacity(n);
    let mut start = 0;
    for (i, &u) in units.iter().enumerate() {
        if u != 0 {
            continue;
        }
        let raw = &units[start..i];
        let name = if lenient {
            String::from_utf16_lossy(raw)
        } else {
            String::from_utf16(raw).map_err(|_| corrupted("entry name is not valid UTF-16"))?
        };
        names.push(name);
        start = i + 1;
    }
    if names.len() != n || start != units.len() {
        return Err(corrupted(format!("name table holds {} names for {n} entries", names.len())));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::bytes::ByteSink;

    struct NoBlocks;

    impl MetadataSource for NoBlocks {
        fn unpack(&mut self, _: &WordBlock) -> Result<Vec<u8>> {
            Err(corrupted("no packed metadata expected"))
        }
    }

    fn parse(buf: &[u8], diag: &mut Diagnostics) -> Result<ArchiveMetadata> {
        parse_metadata(buf, &ParseOptions::default(), diag, &mut NoBlocks)
    }

    fn names_body(names: &[&str]) -> Vec<u8> {
        let mut body = vec![0];
        for name in names {
            for u in name.encode_utf16() {
                body.extend_from_slice(&u.to_le_bytes());
            }
            body.extend_from_slice(&[0, 0]);
        }
        body
    }

    #[test]
    fn empty_only_archive() {
        let mut buf = vec![nid::HEADER, nid::FILES_INFO, 2];
        buf.push(nid::EMPTY_STREAM);
        buf.put_number(1);
        buf.put_bits(&[true, true]);
        buf.push(nid::EMPTY_FILE);
        buf.put_number(1);
        buf.put_bits(&[true, false]);
        let names = names_body(&["a.txt", "dir"]);
        buf.push(nid::NAME);
        buf.put_number(names.len() as u64);
        buf.extend_from_slice(&names);
        buf.extend_from_slice(&[nid::END, nid::END]);

        let meta = parse(&buf, &mut Diagnostics::strict()).unwrap();
        assert_eq!(meta.entries.len(), 2);
        assert!(meta.entries[0].is_empty_file());
        assert!(meta.entries[1].is_directory);
        assert_eq!(meta.entries[1].name, "dir");
        assert_eq!(meta.counts.empty, 2);
    }

    #[test]
    fn unknown_file_property_is_skipped() {
        let mut buf = vec![nid::HEADER, nid::FILES_INFO, 1, nid::EMPTY_STREAM, 1, 0x80];
        buf.extend_from_slice(&[nid::DUMMY, 3, 0, 0, 0]);
        buf.extend_from_slice(&[0x33, 2, 0xAB, 0xCD]);
        buf.extend_from_slice(&[nid::END, nid::END]);
        let meta = parse(&buf, &mut Diagnostics::strict()).unwrap();
        assert!(meta.entries[0].is_directory);
    }

    #[test]
    fn leftover_property_bytes_are_soft() {
        // empty-stream bitmap for one entry carries an extra byte
        let buf = [nid::HEADER, nid::FILES_INFO, 1, nid::EMPTY_STREAM, 2, 0x80, 0xFF, nid::END, nid::END];
        assert!(parse(&buf, &mut Diagnostics::strict()).is_err());
        let mut lenient = Diagnostics::lenient();
        parse(&buf, &mut lenient).unwrap();
        assert_eq!(lenient.warnings().len(), 1);
    }

    #[test]
    fn trailing_bytes_after_end() {
        let buf = [nid::HEADER, nid::END, 0x42];
        assert!(parse(&buf, &mut Diagnostics::strict()).is_err());
        let exact = ParseOptions { exact: true, ..ParseOptions::default() };
        assert!(parse_metadata(&buf, &exact, &mut Diagnostics::lenient(), &mut NoBlocks).is_err());
    }

    #[test]
    fn stream_count_mismatch_is_fatal() {
        // one entry with data, but no streams described
        let buf = [nid::HEADER, nid::FILES_INFO, 1, nid::END, nid::END];
        let err = parse(&buf, &mut Diagnostics::lenient()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn truncated_metadata_is_corruption() {
        let buf = [nid::HEADER, nid::FILES_INFO];
        assert!(parse(&buf, &mut Diagnostics::strict()).unwrap_err().is_corruption());
    }
}
