//! Metadata section ("next header") codec.
//!
//! The metadata is a tree of tagged records.  Every record starts with a
//! one-byte property id from [`nid`]; file properties carry a length prefix so
//! unknown ones can be skipped.  [`read`] turns the bytes into an
//! [`ArchiveMetadata`], [`write`] does the reverse.

pub mod bytes;
pub mod read;
pub mod write;

use crate::block::WordBlock;
use crate::index::{AttributeCounts, Entry};

pub use read::{parse_metadata, MetadataSource, ParseOptions};
pub use write::{encode_metadata, encoded_header_record};

/// Property ids.
pub mod nid {
    pub const END:                    u8 = 0x00;
    pub const HEADER:                 u8 = 0x01;
    pub const ARCHIVE_PROPERTIES:     u8 = 0x02;
    pub const ADDITIONAL_STREAMS_INFO: u8 = 0x03;
    pub const MAIN_STREAMS_INFO:      u8 = 0x04;
    pub const FILES_INFO:             u8 = 0x05;
    pub const PACK_INFO:              u8 = 0x06;
    pub const UNPACK_INFO:            u8 = 0x07;
    pub const SUBSTREAMS_INFO:        u8 = 0x08;
    pub const SIZE:                   u8 = 0x09;
    pub const CRC:                    u8 = 0x0A;
    pub const FOLDER:                 u8 = 0x0B;
    pub const CODERS_UNPACK_SIZE:     u8 = 0x0C;
    pub const NUM_UNPACK_STREAM:      u8 = 0x0D;
    pub const EMPTY_STREAM:           u8 = 0x0E;
    pub const EMPTY_FILE:             u8 = 0x0F;
    pub const ANTI:                   u8 = 0x10;
    pub const NAME:                   u8 = 0x11;
    pub const CTIME:                  u8 = 0x12;
    pub const ATIME:                  u8 = 0x13;
    pub const MTIME:                  u8 = 0x14;
    pub const WIN_ATTRIBUTES:         u8 = 0x15;
    pub const COMMENT:                u8 = 0x16;
    pub const ENCODED_HEADER:         u8 = 0x17;
    pub const START_POS:              u8 = 0x18;
    pub const DUMMY:                  u8 = 0x19;
}

/// Everything the metadata describes: blocks, entries in present order and
/// the attribute tallies that drive compact encoding.
#[derive(Debug, Clone, Default)]
pub struct ArchiveMetadata {
    pub blocks:  Vec<WordBlock>,
    pub entries: Vec<Entry>,
    pub counts:  AttributeCounts,
}

impl ArchiveMetadata {
    /// End of the last block's raw streams, relative to the start header end.
    pub fn data_end(&self) -> u64 {
        self.blocks.last().map_or(0, WordBlock::end)
    }

    /// Rebuild each block's entry chain from the present-order table.
    pub fn relink(&mut self) {
        relink(&mut self.blocks, &mut self.entries);
    }
}

pub(crate) fn relink(blocks: &mut [WordBlock], entries: &mut [Entry]) {
    let mut last: Vec<Option<usize>> = vec![None; blocks.len()];
    for b in blocks.iter_mut() {
        b.first_entry = None;
    }
    for i in 0..entries.len() {
        entries[i].next = None;
        let Some(bi) = entries[i].block.filter(|&bi| bi < blocks.len()) else { continue };
        match last[bi] {
            Some(prev) => entries[prev].next = Some(i),
            None       => blocks[bi].first_entry = Some(i),
        }
        last[bi] = Some(i);
    }
}
