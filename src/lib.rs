pub mod error;
pub mod superblock;
pub mod codec;
pub mod crypto;
pub mod graph;
pub mod block;
pub mod index;
pub mod header;
pub mod recovery;
pub mod io_stream;
pub mod scheduler;
pub mod archive;

pub use error::{ArchiveError, Result};
pub use superblock::Superblock;
pub use codec::{Codec, CodecId};
pub use graph::{CoderGraph, GraphBuilder, PipeSource};
pub use block::WordBlock;
pub use index::{Entry, EntryTable, FileInfo, FileTime};
pub use io_stream::{ArchiveReader, ArchiveWriter, OpenOptions, SolidMode, WriteOptions};
pub use archive::Archive;
