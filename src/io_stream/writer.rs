//! Archive writer.
//!
//! # Layout
//! [`ArchiveWriter::new`] reserves the 32-byte start header with a
//! placeholder, then streams block data behind it.  Raw sub-stream 0 of the
//! open block goes straight to the output; further raw sub-streams are
//! buffered and appended when the block closes.  [`ArchiveWriter::finish`]
//! writes the metadata (inline, or packed into one more block behind an
//! encoded-header record) and patches the start header.
//!
//! # Entries
//! `begin_entry` / `write` / `close_entry` stream one entry through the open
//! block's pipeline while keeping the entry CRC and block CRC.  The block is
//! opened lazily on the first byte, so directories, anti-items and zero-byte
//! files never touch a block.
//!
//! # Solid runs
//! [`SolidMode`] decides when the open block is closed: never (`Single`),
//! after every entry (`PerEntry`) or once it holds `n` decoded bytes
//! (`Bytes(n)`).  A size hint passed to `begin_entry` rolls the block early
//! when the entry would push it past `n`.
//!
//! # Detached writers
//! [`ArchiveWriter::detached`] hands out a [`DetachedWriter`] that encodes
//! into memory on any thread.  Its finished blocks and entries come back over
//! a channel and are spliced into the parent whenever the parent has no
//! block open, and at the latest by `finish`.  `finish` never waits: it
//! refuses with [`ArchiveError::WriterState`] while any detached writer is
//! still alive, so finish or drop them first.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use crc32fast::Hasher;
use tracing::{debug, trace};

use crate::block::{BlockCounters, WordBlock};
use crate::codec::{BoxSink, Codec, ZstdCodec, DEFAULT_COMPRESSION_LEVEL};
use crate::crypto::{AesCodec, KdfParams, Password};
use crate::error::{ArchiveError, Result};
use crate::graph::CoderGraph;
use crate::header::{encode_metadata, encoded_header_record, ArchiveMetadata};
use crate::index::{AttributeCounts, Entry};
use crate::io_stream::adapters::{BufferSink, CountingSink, SharedOut};
use crate::io_stream::reader::{ArchiveReader, OpenOptions};
use crate::io_stream::storage::SliceReader;
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};

fn misuse(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::WriterState(msg.into())
}

// ── Policy ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolidMode {
    /// One block for the whole archive.
    #[default]
    Single,
    /// One block per stored entry.
    PerEntry,
    /// Close the block once it holds this many decoded bytes.
    Bytes(u64),
}

impl SolidMode {
    /// `0` → `Single`, negative → `PerEntry`, `n` → `Bytes(n)`.
    pub fn from_threshold(threshold: i64) -> Self {
        match threshold {
            0          => SolidMode::Single,
            t if t < 0 => SolidMode::PerEntry,
            t          => SolidMode::Bytes(t.unsigned_abs()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCompression {
    Never,
    Always,
    /// Pack the metadata only when the archive has more than this many entries.
    AboveEntries(usize),
}

impl Default for HeaderCompression {
    fn default() -> Self {
        HeaderCompression::AboveEntries(1)
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Linear chain in data-flow order; ignored when `graph` is set.
    pub codecs:             Vec<Arc<dyn Codec>>,
    pub graph:              Option<Arc<CoderGraph>>,
    pub solid:              SolidMode,
    pub header_compression: HeaderCompression,
    /// Used by [`ArchiveWriter::append`] to read encrypted metadata.
    pub password:           Option<Arc<Password>>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            codecs:             vec![Arc::new(ZstdCodec::with_level(DEFAULT_COMPRESSION_LEVEL))],
            graph:              None,
            solid:              SolidMode::default(),
            header_compression: HeaderCompression::default(),
            password:           None,
        }
    }
}

impl WriteOptions {
    pub fn codecs(mut self, codecs: Vec<Arc<dyn Codec>>) -> Self {
        self.codecs = codecs;
        self.graph = None;
        self
    }

    pub fn graph(mut self, graph: CoderGraph) -> Self {
        self.graph = Some(Arc::new(graph));
        self
    }

    pub fn solid(mut self, mode: SolidMode) -> Self {
        self.solid = mode;
        self
    }

    pub fn header_compression(mut self, policy: HeaderCompression) -> Self {
        self.header_compression = policy;
        self
    }

    pub fn password(mut self, text: &str) -> Self {
        self.password = Some(Arc::new(Password::new(text)));
        self
    }

    /// Append AES-256-GCM to the codec chain.  The key is derived once here.
    pub fn encrypt(mut self, text: &str, kdf: KdfParams) -> Result<Self> {
        let password = Password::new(text);
        self.codecs.push(Arc::new(AesCodec::with_params(&password, kdf)?));
        self.password = Some(Arc::new(password));
        Ok(self)
    }

    fn template(&self) -> Result<Arc<CoderGraph>> {
        match &self.graph {
            Some(graph) => Ok(Arc::clone(graph)),
            None        => Ok(Arc::new(CoderGraph::linear(self.codecs.clone())?)),
        }
    }
}

// ── Shared core ──────────────────────────────────────────────────────────────

struct OpenBlock {
    graph:    Arc<CoderGraph>,
    sink:     BoxSink,
    counters: BlockCounters,
    buffers:  Vec<BufferSink>,
    offset:   u64,
    bytes:    u64,
    crc:      Hasher,
    files:    u64,
}

struct PendingEntry {
    entry:   Entry,
    hint:    Option<u64>,
    written: u64,
    offset:  u64,
    crc:     Hasher,
}

/// Everything a detached writer produced, ready to splice.
struct SplicePart {
    data:    Vec<u8>,
    blocks:  Vec<WordBlock>,
    entries: Vec<Entry>,
    counts:  AttributeCounts,
}

struct WriterCore<S: Write + Send + 'static> {
    out:      SharedOut<S>,
    /// Where the next raw byte lands, relative to the end of the start header.
    position: u64,
    template: Arc<CoderGraph>,
    solid:    SolidMode,
    meta:     ArchiveMetadata,
    open:     Option<OpenBlock>,
    pending:  Option<PendingEntry>,
}

impl<S: Write + Send + 'static> WriterCore<S> {
    fn new(out: S, position: u64, template: Arc<CoderGraph>, solid: SolidMode, meta: ArchiveMetadata) -> Self {
        Self { out: SharedOut::new(out), position, template, solid, meta, open: None, pending: None }
    }

    fn open_block(&self) -> Result<OpenBlock> {
        let graph = Arc::new(self.template.instantiate());
        let counters = BlockCounters::for_graph(&graph);
        let buffers: Vec<BufferSink> = (1..graph.raw_count()).map(|_| BufferSink::default()).collect();
        let mut raw: Vec<BoxSink> = Vec::with_capacity(graph.raw_count());
        raw.push(Box::new(CountingSink::new(Box::new(self.out.clone()), counters.raw(0))));
        for (i, buffer) in buffers.iter().enumerate() {
            raw.push(Box::new(CountingSink::new(Box::new(buffer.clone()), counters.raw(i + 1))));
        }
        let sink = graph.encode(raw, &counters)?;
        trace!(block = self.meta.blocks.len(), offset = self.position, "opened block");
        Ok(OpenBlock { graph, sink, counters, buffers, offset: self.position, bytes: 0, crc: Hasher::new(), files: 0 })
    }

    /// Finish the pipeline, append the buffered raw streams and describe the block.
    fn seal(&mut self, open: OpenBlock) -> Result<WordBlock> {
        let OpenBlock { graph, sink, counters, buffers, offset, bytes, crc, files } = open;
        sink.finish()?;
        let raw = counters.raw_sizes();
        {
            let mut out = self.out.lock()?;
            for (buffer, &counted) in buffers.iter().zip(raw.iter().skip(1)) {
                let data = buffer.take()?;
                if data.len() as u64 != counted {
                    return Err(misuse(format!("raw stream buffered {} bytes, counted {counted}", data.len())));
                }
                out.write_all(&data)?;
            }
        }
        let u_size = counters.unpacked(&graph);
        if u_size != bytes {
            return Err(misuse(format!("block pipeline saw {u_size} bytes, {bytes} were written")));
        }
        let (&size, extra) = raw.split_first().ok_or_else(|| misuse("block has no raw stream"))?;
        let block = WordBlock {
            out_sizes:   counters.out_sizes(&graph),
            graph,
            offset,
            size,
            extra_sizes: extra.to_vec(),
            u_size,
            crc:         Some(crc.finalize()),
            file_count:  files,
            first_entry: None,
        };
        self.position = block.end();
        Ok(block)
    }

    fn close_block(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else { return Ok(()) };
        let index = self.meta.blocks.len();
        let block = self.seal(open)?;
        trace!(
            block    = index,
            packed   = block.packed_len(),
            unpacked = block.u_size,
            files    = block.file_count,
            "closed block"
        );
        self.meta.blocks.push(block);
        Ok(())
    }

    /// Close the open block if the next entry belongs in a new one.
    fn roll_for(&mut self, hint: Option<u64>) -> Result<()> {
        let roll = match (&self.open, self.solid) {
            (Some(_), SolidMode::PerEntry)           => true,
            (Some(open), SolidMode::Bytes(limit))    => hint.is_some_and(|h| h > 0 && open.bytes.saturating_add(h) > limit),
            _                                        => false,
        };
        if roll {
            self.close_block()?;
        }
        Ok(())
    }

    fn start_entry(&mut self, entry: Entry, hint: Option<u64>) {
        self.pending = Some(PendingEntry { entry, hint, written: 0, offset: 0, crc: Hasher::new() });
    }

    fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &self.pending {
            None => return Err(misuse("write outside of an entry")),
            Some(p) if p.entry.is_directory || p.entry.is_anti => {
                return Err(misuse(format!("{:?} cannot hold data", p.entry.name)));
            }
            Some(_) => {}
        }
        if self.open.is_none() {
            self.open = Some(self.open_block()?);
        }
        let (Some(open), Some(p)) = (self.open.as_mut(), self.pending.as_mut()) else {
            return Err(misuse("no open block"));
        };
        open.sink.write_all(buf)?;
        if p.written == 0 {
            p.offset = open.bytes;
        }
        let n = buf.len() as u64;
        open.bytes += n;
        open.crc.update(buf);
        p.written += n;
        p.crc.update(buf);
        Ok(buf.len())
    }

    fn close_entry(&mut self) -> Result<()> {
        let Some(p) = self.pending.take() else { return Ok(()) };
        let mut entry = p.entry;
        entry.size = p.written;
        entry.next = None;
        if p.written == 0 {
            entry.block = None;
            entry.offset = 0;
            entry.crc = None;
        } else {
            entry.block = Some(self.meta.blocks.len());
            entry.offset = p.offset;
            entry.crc = Some(p.crc.finalize());
            if let Some(open) = self.open.as_mut() {
                open.files += 1;
            }
        }
        let mismatch = p.hint.filter(|&h| h != p.written).map(|h| {
            misuse(format!("entry {:?} was announced as {h} bytes but {} were written", entry.name, p.written))
        });
        self.meta.counts.tally(&entry);
        self.meta.entries.push(entry);
        if let Some(err) = mismatch {
            return Err(err);
        }

        let roll = match (&self.open, self.solid) {
            (Some(_), SolidMode::PerEntry)        => true,
            (Some(open), SolidMode::Bytes(limit)) => open.bytes >= limit,
            _                                     => false,
        };
        if roll {
            self.close_block()?;
        }
        Ok(())
    }

    /// Encode `data` as a block of its own, outside the entry table.
    fn pack_bytes(&mut self, data: &[u8]) -> Result<WordBlock> {
        let mut open = self.open_block()?;
        open.sink.write_all(data)?;
        open.bytes = data.len() as u64;
        open.crc.update(data);
        open.files = 1;
        self.seal(open)
    }

    fn splice(&mut self, part: SplicePart) -> Result<()> {
        if self.open.is_some() {
            return Err(misuse("cannot splice while a block is open"));
        }
        let base_block = self.meta.blocks.len();
        let base = self.position;
        self.out.lock()?.write_all(&part.data)?;
        for mut block in part.blocks {
            block.offset += base;
            self.meta.blocks.push(block);
        }
        let entries = part.entries.len();
        for mut entry in part.entries {
            if let Some(bi) = entry.block.as_mut() {
                *bi += base_block;
            }
            self.meta.entries.push(entry);
        }
        self.meta.counts.merge(&part.counts);
        self.position += part.data.len() as u64;
        debug!(offset = base, bytes = part.data.len(), entries, "spliced detached writer");
        Ok(())
    }

    fn flush_open(&mut self) -> io::Result<()> {
        match self.open.as_mut() {
            Some(open) => open.sink.flush(),
            None       => Ok(()),
        }
    }
}

// ── ArchiveWriter ────────────────────────────────────────────────────────────

pub struct ArchiveWriter<W: Write + Seek + Send + 'static> {
    core:               WriterCore<W>,
    header_compression: HeaderCompression,
    parts_tx:           Option<mpsc::Sender<SplicePart>>,
    parts_rx:           mpsc::Receiver<SplicePart>,
    live:               Arc<AtomicUsize>,
    truncate:           Option<fn(&mut W, u64) -> io::Result<()>>,
    finished:           Option<u64>,
}

impl<W: Write + Seek + Send + 'static> ArchiveWriter<W> {
    pub fn new(mut out: W, options: WriteOptions) -> Result<Self> {
        let template = options.template()?;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&Superblock::placeholder())?;
        Ok(Self::assemble(out, 0, template, &options, ArchiveMetadata::default(), None))
    }

    fn assemble(
        out:      W,
        position: u64,
        template: Arc<CoderGraph>,
        options:  &WriteOptions,
        meta:     ArchiveMetadata,
        truncate: Option<fn(&mut W, u64) -> io::Result<()>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            core:               WriterCore::new(out, position, template, options.solid, meta),
            header_compression: options.header_compression,
            parts_tx:           Some(tx),
            parts_rx:           rx,
            live:               Arc::new(AtomicUsize::new(0)),
            truncate,
            finished:           None,
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.finished.is_some() {
            return Err(misuse("archive already finished"));
        }
        Ok(())
    }

    /// Splice finished detached writers while no block is open.
    fn splice_ready(&mut self) -> Result<()> {
        if self.core.open.is_some() {
            return Ok(());
        }
        while let Ok(part) = self.parts_rx.try_recv() {
            self.core.splice(part)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[Entry] {
        &self.core.meta.entries
    }

    pub fn blocks(&self) -> &[WordBlock] {
        &self.core.meta.blocks
    }

    /// Start a new entry, closing the previous one.  With `size_hint` the
    /// entry's final size is checked at `close_entry`.
    ///
    /// A size mismatch is reported after the entry is recorded: its bytes
    /// already sit in the open block, so the entry stays with the size that
    /// was actually written.
    pub fn begin_entry(&mut self, entry: Entry, size_hint: Option<u64>) -> Result<()> {
        self.check_active()?;
        self.core.close_entry()?;
        self.core.roll_for(size_hint)?;
        self.splice_ready()?;
        self.core.start_entry(entry, size_hint);
        Ok(())
    }

    pub fn close_entry(&mut self) -> Result<()> {
        self.core.close_entry()?;
        self.splice_ready()
    }

    pub fn add_entry(&mut self, entry: Entry, data: &[u8]) -> Result<()> {
        self.begin_entry(entry, Some(data.len() as u64))?;
        self.core.write_data(data)?;
        self.close_entry()
    }

    /// Stream `reader` into a new entry; returns the bytes copied.
    pub fn add_reader(&mut self, entry: Entry, reader: &mut dyn Read, size_hint: Option<u64>) -> Result<u64> {
        self.begin_entry(entry, size_hint)?;
        let copied = io::copy(reader, self)?;
        self.close_entry()?;
        Ok(copied)
    }

    /// A writer that encodes into memory, usable from another thread.
    pub fn detached(&self) -> Result<DetachedWriter> {
        self.check_active()?;
        let tx = self.parts_tx.clone().ok_or_else(|| misuse("archive already finished"))?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(DetachedWriter {
            core: WriterCore::new(
                Vec::new(),
                0,
                Arc::clone(&self.core.template),
                self.core.solid,
                ArchiveMetadata::default(),
            ),
            tx,
            live: LiveDetached(Arc::clone(&self.live)),
        })
    }

    /// Copy block `index` of `reader` verbatim, together with its entries.
    pub fn copy_block(&mut self, reader: &ArchiveReader, index: usize) -> Result<()> {
        self.check_active()?;
        self.core.close_entry()?;
        self.core.close_block()?;
        self.splice_ready()?;

        let mut block = reader
            .blocks()
            .get(index)
            .cloned()
            .ok_or_else(|| misuse(format!("source archive has no block {index}")))?;
        let len = block.packed_len();
        let mut raw = SliceReader::new(reader.storage(), block.absolute_offset(), len);
        let copied = io::copy(&mut raw, &mut *self.core.out.lock()?)?;
        if copied != len {
            return Err(ArchiveError::UnexpectedEof);
        }

        let new_index = self.core.meta.blocks.len();
        for (_, e) in reader.entries().block_entries(block.first_entry) {
            let mut e = e.clone();
            e.block = Some(new_index);
            e.next = None;
            self.core.meta.counts.tally(&e);
            self.core.meta.entries.push(e);
        }
        block.offset = self.core.position;
        block.first_entry = None;
        self.core.position = block.end();
        trace!(from = index, to = new_index, bytes = len, "copied block");
        self.core.meta.blocks.push(block);
        Ok(())
    }

    /// Drop an empty entry (pending or already closed) by name.
    pub fn remove_empty_entry(&mut self, name: &str) -> bool {
        if matches!(&self.core.pending, Some(p) if p.written == 0 && p.entry.name == name) {
            self.core.pending = None;
            return true;
        }
        let meta = &mut self.core.meta;
        match meta.entries.iter().position(|e| e.name == name && !e.has_stream()) {
            Some(i) => {
                let removed = meta.entries.remove(i);
                meta.counts.untally(&removed);
                true
            }
            None => false,
        }
    }

    fn compress_header(&self) -> bool {
        let wanted = match self.header_compression {
            HeaderCompression::Never           => false,
            HeaderCompression::Always          => true,
            HeaderCompression::AboveEntries(k) => self.core.meta.entries.len() > k,
        };
        wanted && !self.core.template.is_identity()
    }

    /// Close the trailing block, splice detached writers, write the metadata
    /// and patch the start header.  Returns the archive length.
    ///
    /// Fails without touching the archive while a detached writer is alive.
    pub fn finish(&mut self) -> Result<u64> {
        self.check_active()?;
        let live = self.live.load(Ordering::Acquire);
        if live > 0 {
            return Err(misuse(format!("{live} detached writer(s) still open")));
        }
        self.core.close_entry()?;
        self.core.close_block()?;
        drop(self.parts_tx.take());
        while let Ok(part) = self.parts_rx.try_recv() {
            self.core.splice(part)?;
        }

        self.core.meta.relink();
        let header = encode_metadata(&self.core.meta)?;
        let record = if self.compress_header() {
            let block = self.core.pack_bytes(&header)?;
            debug!(plain = header.len(), packed = block.packed_len(), "packed metadata");
            encoded_header_record(&block)?
        } else {
            header
        };

        let offset = self.core.position;
        let end = SUPERBLOCK_SIZE as u64 + offset + record.len() as u64;
        {
            let mut out = self.core.out.lock()?;
            out.write_all(&record)?;
            out.seek(SeekFrom::Start(0))?;
            Superblock::new(offset, record.len() as u64, crc32fast::hash(&record)).write(&mut *out)?;
            out.seek(SeekFrom::Start(end))?;
            if let Some(truncate) = self.truncate {
                truncate(&mut *out, end)?;
            }
            out.flush()?;
        }
        self.finished = Some(end);
        debug!(
            len     = end,
            blocks  = self.core.meta.blocks.len(),
            entries = self.core.meta.entries.len(),
            "finished archive"
        );
        Ok(end)
    }

    /// Recover the output.  Fails while a block pipeline still holds it.
    pub fn into_inner(self) -> Result<W> {
        let Self { core, .. } = self;
        let WriterCore { out, open, .. } = core;
        drop(open);
        out.into_inner().ok_or_else(|| misuse("archive output is still shared"))
    }
}

fn truncate_file(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(len)
}

impl ArchiveWriter<File> {
    pub fn create(path: impl AsRef<Path>, options: WriteOptions) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Self::new(file, options)
    }

    /// Reopen an existing archive and keep writing after its last block.
    /// The old metadata is overwritten and the file is truncated at `finish`.
    pub fn append(path: impl AsRef<Path>, options: WriteOptions) -> Result<Self> {
        let path = path.as_ref();
        let reader = ArchiveReader::open(path, OpenOptions { password: options.password.clone(), ..OpenOptions::default() })?;
        let meta = ArchiveMetadata {
            blocks:  reader.blocks().to_vec(),
            entries: reader.entries().as_slice().to_vec(),
            counts:  AttributeCounts::from_entries(reader.entries()),
        };
        drop(reader);

        let template = options.template()?;
        let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let position = meta.data_end();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&Superblock::placeholder())?;
        file.seek(SeekFrom::Start(SUPERBLOCK_SIZE as u64 + position))?;
        debug!(path = %path.display(), blocks = meta.blocks.len(), entries = meta.entries.len(), "appending");
        let truncate: fn(&mut File, u64) -> io::Result<()> = truncate_file;
        Ok(Self::assemble(file, position, template, &options, meta, Some(truncate)))
    }
}

impl<W: Write + Seek + Send + 'static> Write for ArchiveWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.write_data(buf).map_err(ArchiveError::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.core.flush_open()
    }
}

// ── DetachedWriter ───────────────────────────────────────────────────────────

/// Counts a detached writer as alive until dropped.  Dropped only after the
/// writer's part is sent, so a zero count means every part is queued.
struct LiveDetached(Arc<AtomicUsize>);

impl Drop for LiveDetached {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// In-memory writer whose result is spliced into its parent archive.
pub struct DetachedWriter {
    core: WriterCore<Vec<u8>>,
    tx:   mpsc::Sender<SplicePart>,
    live: LiveDetached,
}

impl DetachedWriter {
    pub fn begin_entry(&mut self, entry: Entry, size_hint: Option<u64>) -> Result<()> {
        self.core.close_entry()?;
        self.core.roll_for(size_hint)?;
        self.core.start_entry(entry, size_hint);
        Ok(())
    }

    pub fn close_entry(&mut self) -> Result<()> {
        self.core.close_entry()
    }

    pub fn add_entry(&mut self, entry: Entry, data: &[u8]) -> Result<()> {
        self.begin_entry(entry, Some(data.len() as u64))?;
        self.core.write_data(data)?;
        self.close_entry()
    }

    /// Close everything and hand the result to the parent.
    pub fn finish(mut self) -> Result<()> {
        self.core.close_entry()?;
        self.core.close_block()?;
        let DetachedWriter { core, tx, live } = self;
        let WriterCore { out, meta, .. } = core;
        let data = out.into_inner().ok_or_else(|| misuse("detached output is still shared"))?;
        let sent = tx
            .send(SplicePart { data, blocks: meta.blocks, entries: meta.entries, counts: meta.counts })
            .map_err(|_| misuse("parent writer already finished"));
        drop(live);
        sent
    }
}

impl Write for DetachedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.write_data(buf).map_err(ArchiveError::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.core.flush_open()
    }
}
