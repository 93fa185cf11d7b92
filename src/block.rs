use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::{BoxSource, DecodeContext};
use crate::error::{ArchiveError, Result};
use crate::graph::CoderGraph;
use crate::io_stream::adapters::ExactReader;
use crate::io_stream::storage::{SliceReader, Storage};
use crate::superblock::SUPERBLOCK_SIZE;

const RAW_READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WordBlock {
    pub graph:       Arc<CoderGraph>,
    /// Start of raw sub-stream 0, relative to the end of the start header.
    pub offset:      u64,
    pub size:        u64,
    pub extra_sizes: Vec<u64>,
    pub out_sizes:   Vec<u64>,
    pub u_size:      u64,
    pub crc:         Option<u32>,
    pub file_count:  u64,
    pub first_entry: Option<usize>,
}

impl WordBlock {
    pub fn raw_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.size).chain(self.extra_sizes.iter().copied())
    }

    pub fn packed_len(&self) -> u64 {
        self.raw_sizes().sum()
    }

    /// First byte after this block's raw streams, relative to the start header end.
    pub fn end(&self) -> u64 {
        self.offset + self.packed_len()
    }

    pub fn absolute_offset(&self) -> u64 {
        SUPERBLOCK_SIZE as u64 + self.offset
    }

    pub fn is_encrypted(&self) -> bool {
        self.graph.contains(crate::codec::ID_AES_GCM)
    }

    /// Decoded stream of the whole block, exactly `u_size` bytes long.
    pub fn open(&self, storage: Arc<dyn Storage>, ctx: &mut DecodeContext) -> Result<BoxSource> {
        let mut pos = self.absolute_offset();
        let mut raw = Vec::with_capacity(1 + self.extra_sizes.len());
        for len in self.raw_sizes() {
            let slice = SliceReader::new(Arc::clone(&storage), pos, len);
            raw.push(Box::new(BufReader::with_capacity(RAW_READ_BUFFER, slice)) as BoxSource);
            pos = pos
                .checked_add(len)
                .ok_or_else(|| ArchiveError::corrupted("raw stream extent overflows"))?;
        }
        let decoded = self.graph.decode(raw, &self.out_sizes, self.u_size, ctx)?;
        Ok(Box::new(ExactReader::new(decoded, self.u_size)))
    }

    /// Decode the whole block and check its stored CRC.
    pub fn verify(&self, storage: Arc<dyn Storage>, ctx: &mut DecodeContext) -> Result<u64> {
        let mut hasher = crc32fast::Hasher::new();
        let mut src = self.open(storage, ctx)?;
        let mut buf = vec![0u8; RAW_READ_BUFFER];
        let mut total = 0u64;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        if let Some(expected) = self.crc {
            let actual = hasher.finalize();
            if actual != expected {
                return Err(ArchiveError::ChecksumMismatch { what: "block", expected, actual });
            }
        }
        Ok(total)
    }
}

#[derive(Debug)]
pub struct BlockCounters {
    raw:     Vec<Arc<AtomicU64>>,
    outputs: Vec<Arc<AtomicU64>>,
}

impl BlockCounters {
    pub fn for_graph(graph: &CoderGraph) -> Self {
        Self {
            raw:     (0..graph.raw_count()).map(|_| Arc::default()).collect(),
            outputs: (0..graph.output_count()).map(|_| Arc::default()).collect(),
        }
    }

    pub fn raw(&self, i: usize) -> Arc<AtomicU64> {
        self.raw.get(i).cloned().unwrap_or_default()
    }

    pub fn output(&self, global: usize) -> Arc<AtomicU64> {
        self.outputs.get(global).cloned().unwrap_or_default()
    }

    pub fn raw_sizes(&self) -> Vec<u64> {
        self.raw.iter().map(|c| c.load(Ordering::Acquire)).collect()
    }

    /// Non-root output sizes in global output order.
    pub fn out_sizes(&self, graph: &CoderGraph) -> Vec<u64> {
        let root = graph.root_global_output();
        self.outputs
            .iter()
            .enumerate()
            .filter(|&(g, _)| g != root)
            .map(|(_, c)| c.load(Ordering::Acquire))
            .collect()
    }

    pub fn unpacked(&self, graph: &CoderGraph) -> u64 {
        self.outputs
            .get(graph.root_global_output())
            .map_or(0, |c| c.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CopyCodec, MemoryBudget};

    fn copy_block(offset: u64, size: u64) -> WordBlock {
        WordBlock {
            graph: Arc::new(CoderGraph::linear(vec![Arc::new(CopyCodec)]).unwrap()),
            offset,
            size,
            extra_sizes: vec![],
            out_sizes: vec![],
            u_size: size,
            crc: None,
            file_count: 1,
            first_entry: Some(0),
        }
    }

    #[test]
    fn open_reads_exact_range() {
        let mut file = vec![0u8; SUPERBLOCK_SIZE];
        file.extend_from_slice(b"xxhello world");
        let storage: Arc<dyn Storage> = Arc::new(file);
        let block = copy_block(2, 11);
        let mut ctx = DecodeContext::new(MemoryBudget::unlimited(), None);
        let mut out = Vec::new();
        block.open(storage, &mut ctx).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(block.end(), 13);
    }

    #[test]
    fn verify_catches_crc_mismatch() {
        let mut file = vec![0u8; SUPERBLOCK_SIZE];
        file.extend_from_slice(b"abc");
        let storage: Arc<dyn Storage> = Arc::new(file);
        let mut block = copy_block(0, 3);
        block.crc = Some(crc32fast::hash(b"abd"));
        let mut ctx = DecodeContext::new(MemoryBudget::unlimited(), None);
        assert!(matches!(
            block.verify(storage, &mut ctx),
            Err(ArchiveError::ChecksumMismatch { what: "block", .. })
        ));
    }
}
