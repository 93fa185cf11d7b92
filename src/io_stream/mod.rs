//! Streaming archive engine: storage, reader and writer.
//!
//! # Storage
//! [`storage::Storage`] is positioned read access (`len`, `read_at`) over a
//! file or an in-memory buffer.  Every block pipeline reads through its own
//! [`storage::SliceReader`], so any number of blocks can be decoded at once
//! from one handle.
//!
//! # Reader
//! [`ArchiveReader`] parses the start header and the metadata, then opens one
//! decode pipeline per block on demand.  Sequential reads inside one block
//! reuse the open pipeline.  [`ArchiveReader::parallel_decompress`] hands one
//! task per block to a [`Scheduler`](crate::scheduler::Scheduler).
//!
//! # Writer
//! [`ArchiveWriter`] streams entries through the open block's encode
//! pipeline and patches the start header on `finish`.  Detached writers
//! encode elsewhere and are spliced in later.
//!
//! # Endianness
//! Every fixed-width field is little-endian; see `superblock.rs` and
//! `header/bytes.rs`.

pub mod adapters;
pub mod reader;
pub mod storage;
pub mod writer;

pub use reader::{ArchiveReader, ArchiveSummary, DecompressJoin, EntryReader, OpenOptions};
pub use storage::{SliceReader, Storage};
pub use writer::{ArchiveWriter, DetachedWriter, HeaderCompression, SolidMode, WriteOptions};
