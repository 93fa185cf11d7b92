//! Archive reader and per-block parallel decompressor.
//!
//! # Opening
//! [`ArchiveReader::open`] reads the 32-byte start header, bounds-checks the
//! metadata extent against the file length, checks the metadata CRC and
//! parses it.  A start header that was never patched (offset, length and
//! CRC all zero) is only accepted in recovery mode, where the metadata is
//! relocated by [`scanner::locate_metadata`].
//!
//! # Sequential access
//! [`ArchiveReader::get_input`] keeps the last block stream open.  Asking for
//! a later entry of the same block skips forward inside that stream; any
//! other request opens a fresh pipeline.  Entry streams are length-limited
//! and, outside recovery, CRC-checked when exhausted.
//!
//! # Parallel access
//! [`ArchiveReader::parallel_decompress`] submits one task per block to a
//! [`Scheduler`].  Each task has its own storage view, graph instance and
//! decode context, and hands the block's entries to the callback in offset
//! order.  Completion is counted down over a channel: every task sends
//! exactly one message, from a drop guard, even when it fails, panics or is
//! discarded by the scheduler without running.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use serde::Serialize;
use tracing::{debug, warn};

use crate::block::WordBlock;
use crate::codec::{BoxSource, DecodeContext, MemoryBudget};
use crate::crypto::Password;
use crate::error::{ArchiveError, Result};
use crate::header::{parse_metadata, ArchiveMetadata, MetadataSource, ParseOptions};
use crate::index::{Entry, EntryTable};
use crate::io_stream::adapters::{skip_exact, ChecksumReader, ExactReader};
use crate::io_stream::storage::Storage;
use crate::recovery::scanner::{self, ScanReport};
use crate::recovery::Diagnostics;
use crate::scheduler::Scheduler;
use crate::superblock::{Superblock, MAGIC, SUPERBLOCK_SIZE};

/// Default decode memory budget: 128 MiB.
pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 128 * 1024;
/// Default cap on the number of entries a metadata section may declare.
pub const DEFAULT_MAX_ENTRIES: usize = 0xFFFFF;

const HEADER_PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub password:        Option<Arc<Password>>,
    /// Downgrade soft integrity failures to warnings and relocate the
    /// metadata of unfinished archives.
    pub recovery:        bool,
    /// Decode memory budget per pipeline, in KiB.
    pub memory_limit_kb: u64,
    pub max_entries:     usize,
    /// Skip timestamps and attributes.
    pub skip_metadata:   bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            password:        None,
            recovery:        false,
            memory_limit_kb: DEFAULT_MEMORY_LIMIT_KB,
            max_entries:     DEFAULT_MAX_ENTRIES,
            skip_metadata:   false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password(mut self, text: &str) -> Self {
        self.password = Some(Arc::new(Password::new(text)));
        self
    }

    pub fn recovery(mut self, on: bool) -> Self {
        self.recovery = on;
        self
    }

    pub fn memory_limit_kb(mut self, kb: u64) -> Self {
        self.memory_limit_kb = kb;
        self
    }

    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    pub fn skip_metadata(mut self, on: bool) -> Self {
        self.skip_metadata = on;
        self
    }

    fn parse_options(&self) -> ParseOptions {
        ParseOptions { max_entries: self.max_entries, skip_metadata: self.skip_metadata, exact: false }
    }

    fn diagnostics(&self) -> Diagnostics {
        if self.recovery { Diagnostics::lenient() } else { Diagnostics::strict() }
    }

    fn decode_context(&self) -> DecodeContext {
        DecodeContext::new(MemoryBudget::new(self.memory_limit_kb), self.password.clone())
    }
}

// ── Encoded-header source ────────────────────────────────────────────────────

/// Decodes metadata blocks straight from storage.
pub(crate) struct HeaderSource<'a> {
    storage: &'a Arc<dyn Storage>,
    options: &'a OpenOptions,
}

impl MetadataSource for HeaderSource<'_> {
    fn unpack(&mut self, block: &WordBlock) -> Result<Vec<u8>> {
        let len = self.storage.len()?;
        if SUPERBLOCK_SIZE as u64 + block.end() > len {
            return Err(ArchiveError::corrupted(format!(
                "metadata block runs to {}, past end of file {len}",
                SUPERBLOCK_SIZE as u64 + block.end()
            )));
        }
        let mut ctx = self.options.decode_context();
        let decoded = block.open(Arc::clone(self.storage), &mut ctx).and_then(|mut src| {
            let mut out = Vec::with_capacity(block.u_size.min(HEADER_PREALLOC_LIMIT) as usize);
            src.read_to_end(&mut out)?;
            Ok(out)
        });
        match decoded {
            Err(e) if block.is_encrypted() && self.options.password.is_some() && is_decode_failure(&e) => {
                debug!(error = %e, "encrypted metadata failed to decode");
                Err(ArchiveError::WrongPassword)
            }
            other => other,
        }
    }
}

/// Errors a wrong key produces downstream of the cipher.
fn is_decode_failure(e: &ArchiveError) -> bool {
    e.is_corruption() || matches!(e, ArchiveError::WrongPassword | ArchiveError::UnexpectedEof)
}

/// Relocate the metadata of `storage` by scanning its tail.
pub fn scan(storage: &Arc<dyn Storage>, options: &OpenOptions) -> Result<(ArchiveMetadata, ScanReport)> {
    let mut source = HeaderSource { storage, options };
    scanner::locate_metadata(storage.as_ref(), &options.parse_options(), &mut source, None)
}

// ── Summary ──────────────────────────────────────────────────────────────────

/// Archive-level facts for `info --json`.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub version:         String,
    pub file_len:        u64,
    pub entries:         usize,
    pub files:           usize,
    pub directories:     usize,
    pub blocks:          usize,
    pub packed_size:     u64,
    pub unpacked_size:   u64,
    pub metadata_size:   u64,
    pub methods:         Vec<String>,
    pub encrypted:       bool,
    pub recovered:       bool,
    pub warnings:        Vec<String>,
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Decoded block stream with a lazily applied forward skip.
struct BlockStream {
    source: BoxSource,
    /// Logical position, pending skip included.
    pos:    u64,
    skip:   u64,
    failed: bool,
}

impl BlockStream {
    fn new(source: BoxSource) -> Self {
        Self { source, pos: 0, skip: 0, failed: false }
    }

    /// Move to `target`.  Backward moves are impossible.
    fn advance_to(&mut self, target: u64) -> bool {
        if target < self.pos {
            return false;
        }
        self.skip += target - self.pos;
        self.pos = target;
        true
    }

    fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.skip > 0 {
            skip_exact(&mut self.source, self.skip)?;
            self.skip = 0;
        }
        self.source.read(buf)
    }
}

impl Read for BlockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_pending(buf) {
            Ok(n) => {
                self.pos += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }
}

struct Cursor {
    block:  usize,
    stream: BlockStream,
}

/// Stream of one entry's bytes.
pub struct EntryReader<'a> {
    inner: Option<ChecksumReader<ExactReader<&'a mut BlockStream>>>,
}

impl EntryReader<'_> {
    fn empty() -> Self {
        Self { inner: None }
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Some(r) => r.read(buf),
            None    => Ok(0),
        }
    }
}

pub struct ArchiveReader {
    storage:    Arc<dyn Storage>,
    closed:     Arc<AtomicBool>,
    superblock: Superblock,
    blocks:     Arc<Vec<WordBlock>>,
    entries:    Arc<EntryTable>,
    options:    OpenOptions,
    cursor:     Option<Cursor>,
    warnings:   Vec<String>,
    scan:       Option<ScanReport>,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("blocks", &self.blocks.len())
            .field("entries", &self.entries.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_storage(Arc::new(file), options)
    }

    pub fn from_bytes(bytes: Vec<u8>, options: OpenOptions) -> Result<Self> {
        Self::from_storage(Arc::new(bytes), options)
    }

    pub fn from_storage(storage: Arc<dyn Storage>, options: OpenOptions) -> Result<Self> {
        let file_len = storage.len()?;
        let mut head = [0u8; SUPERBLOCK_SIZE];
        if file_len < SUPERBLOCK_SIZE as u64 {
            let n = file_len as usize;
            storage.read_exact_at(0, &mut head[..n])?;
            let probe = n.min(MAGIC.len());
            return Err(if head[..probe] == MAGIC[..probe] && n > 0 {
                ArchiveError::UnexpectedEof
            } else {
                ArchiveError::BadMagic
            });
        }
        storage.read_exact_at(0, &mut head)?;
        let (superblock, header_ok) = Superblock::parse(&head)?;

        let mut diag = options.diagnostics();
        let mut scan_report = None;
        let meta = if !header_ok && superblock.is_unfinished() {
            if !options.recovery {
                return Err(ArchiveError::corrupted("start header was never written (unfinished archive)"));
            }
            warn!("start header is unfinished; scanning for metadata");
            let (meta, report) = scan(&storage, &options)?;
            debug!(summary = %report.summary(), "recovery scan");
            for w in &report.warnings {
                diag.soft(ArchiveError::corrupted(w.clone()))?;
            }
            scan_report = Some(report);
            meta
        } else {
            if !header_ok {
                let stored = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
                diag.soft(ArchiveError::ChecksumMismatch {
                    what:     "start header",
                    expected: stored,
                    actual:   crc32fast::hash(&head[12..]),
                })?;
            }
            Self::read_metadata(&storage, &superblock, file_len, &options, &mut diag)?
        };

        if scan_report.is_none() && meta.data_end() > superblock.next_header_offset {
            diag.soft(ArchiveError::corrupted(format!(
                "blocks run to {} but metadata starts at {}",
                meta.data_end(),
                superblock.next_header_offset
            )))?;
        }

        debug!(
            blocks  = meta.blocks.len(),
            entries = meta.entries.len(),
            warnings = diag.warnings().len(),
            "opened archive"
        );
        Ok(Self {
            storage,
            closed: Arc::new(AtomicBool::new(false)),
            superblock,
            blocks: Arc::new(meta.blocks),
            entries: Arc::new(EntryTable::new(meta.entries)),
            options,
            cursor: None,
            warnings: diag.into_warnings(),
            scan: scan_report,
        })
    }

    fn read_metadata(
        storage:    &Arc<dyn Storage>,
        superblock: &Superblock,
        file_len:   u64,
        options:    &OpenOptions,
        diag:       &mut Diagnostics,
    ) -> Result<ArchiveMetadata> {
        if superblock.next_header_size == 0 {
            return Ok(ArchiveMetadata::default());
        }
        let end = superblock
            .metadata_position()
            .and_then(|pos| pos.checked_add(superblock.next_header_size))
            .filter(|&end| end <= file_len)
            .ok_or_else(|| {
                ArchiveError::corrupted(format!(
                    "metadata at {} (+{} bytes) lies outside the {file_len}-byte file",
                    superblock.next_header_offset, superblock.next_header_size
                ))
            })?;
        let mut buf = vec![0u8; superblock.next_header_size as usize];
        storage.read_exact_at(end - superblock.next_header_size, &mut buf)?;

        let actual = crc32fast::hash(&buf);
        if actual != superblock.next_header_crc {
            diag.soft(ArchiveError::ChecksumMismatch {
                what:     "metadata",
                expected: superblock.next_header_crc,
                actual,
            })?;
        }
        let mut source = HeaderSource { storage, options };
        parse_metadata(&buf, &options.parse_options(), diag, &mut source)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn entries(&self) -> &EntryTable { &self.entries }
    pub fn blocks(&self) -> &[WordBlock] { &self.blocks }
    pub fn superblock(&self) -> &Superblock { &self.superblock }
    pub fn warnings(&self) -> &[String] { &self.warnings }
    pub fn scan_report(&self) -> Option<&ScanReport> { self.scan.as_ref() }
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    pub(crate) fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Entry by name.  Fails when the archive holds duplicate names.
    pub fn find(&self, name: &str) -> Result<Option<&Entry>> {
        self.entries.find(name)
    }

    pub fn position(&self, name: &str) -> Result<Option<usize>> {
        self.entries.position(name)
    }

    pub fn summary(&self) -> Result<ArchiveSummary> {
        let mut methods: Vec<String> = Vec::new();
        for b in self.blocks.iter() {
            for name in b.graph.method_names() {
                if !methods.contains(&name) {
                    methods.push(name);
                }
            }
        }
        Ok(ArchiveSummary {
            version:       format!("{}.{}", self.superblock.major, self.superblock.minor),
            file_len:      self.storage.len()?,
            entries:       self.entries.len(),
            files:         self.entries.iter().filter(|e| !e.is_directory).count(),
            directories:   self.entries.iter().filter(|e| e.is_directory).count(),
            blocks:        self.blocks.len(),
            packed_size:   self.blocks.iter().map(WordBlock::packed_len).sum(),
            unpacked_size: self.blocks.iter().map(|b| b.u_size).sum(),
            metadata_size: self.superblock.next_header_size,
            methods,
            encrypted:     self.blocks.iter().any(WordBlock::is_encrypted),
            recovered:     self.scan.is_some(),
            warnings:      self.warnings.clone(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ArchiveError::Closed);
        }
        Ok(())
    }

    // ── Sequential access ────────────────────────────────────────────────────

    /// Fresh decode pipeline over block `index`.
    pub fn open_block(&self, index: usize) -> Result<BoxSource> {
        self.check_open()?;
        let block = self
            .blocks
            .get(index)
            .ok_or_else(|| ArchiveError::corrupted(format!("no block {index}")))?;
        let mut ctx = self.options.decode_context();
        block.open(self.storage(), &mut ctx)
    }

    /// Decode block `index` completely and check its stored CRC.
    pub fn verify_block(&self, index: usize) -> Result<u64> {
        self.check_open()?;
        let block = self
            .blocks
            .get(index)
            .ok_or_else(|| ArchiveError::corrupted(format!("no block {index}")))?;
        let mut ctx = self.options.decode_context();
        block.verify(self.storage(), &mut ctx)
    }

    pub fn get_input(&mut self, index: usize) -> Result<EntryReader<'_>> {
        self.check_open()?;
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| ArchiveError::corrupted(format!("no entry {index}")))?
            .clone();
        let Some(bi) = entry.block else {
            return Ok(EntryReader::empty());
        };
        let block = self
            .blocks
            .get(bi)
            .ok_or_else(|| ArchiveError::corrupted(format!("entry {:?} refers to missing block {bi}", entry.name)))?;
        if entry.offset.checked_add(entry.size).map_or(true, |end| end > block.u_size) {
            return Err(ArchiveError::corrupted(format!(
                "entry {:?} extends past the end of block {bi}",
                entry.name
            )));
        }

        let reusable = matches!(
            &self.cursor,
            Some(c) if c.block == bi && !c.stream.failed && c.stream.pos <= entry.offset
        );
        let mut cursor = match self.cursor.take().filter(|_| reusable) {
            Some(c) => c,
            None    => Cursor { block: bi, stream: BlockStream::new(self.open_block(bi)?) },
        };
        cursor.stream.advance_to(entry.offset);

        let expected = if self.options.recovery { None } else { entry.crc };
        let cursor = self.cursor.insert(cursor);
        let limited = ExactReader::new(&mut cursor.stream, entry.size);
        Ok(EntryReader { inner: Some(ChecksumReader::new(limited, expected, "entry")) })
    }

    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let size = self.entries.get(index).map_or(0, |e| e.size);
        let mut out = Vec::with_capacity(size.min(HEADER_PREALLOC_LIMIT) as usize);
        self.get_input(index)?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Mark the archive closed.  Block tasks that have not started yet fail
    /// with [`ArchiveError::Closed`]; the password reference is dropped.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.options.password = None;
        self.cursor = None;
    }

    // ── Parallel access ──────────────────────────────────────────────────────

    /// Decode every block as an independent task on `scheduler`.
    ///
    /// `callback` receives the entry index, the entry and a reader over its
    /// bytes; whatever it leaves unread is skipped before the next entry.
    /// Entries without a block are not visited.
    pub fn parallel_decompress<F>(&self, scheduler: &dyn Scheduler, callback: F) -> Result<DecompressJoin>
    where
        F: Fn(usize, &Entry, &mut dyn Read) -> Result<()> + Send + Sync + 'static,
    {
        self.check_open()?;
        let callback = Arc::new(callback);
        let (tx, rx) = mpsc::channel();
        for bi in 0..self.blocks.len() {
            let job = BlockJob {
                block:    bi,
                storage:  self.storage(),
                blocks:   Arc::clone(&self.blocks),
                entries:  Arc::clone(&self.entries),
                closed:   Arc::clone(&self.closed),
                options:  self.options.clone(),
                callback: Arc::clone(&callback),
            };
            let mut guard = CountDown { tx: tx.clone(), block: bi, result: None };
            scheduler.submit(Box::new(move || {
                guard.result = Some(job.run());
            }));
        }
        Ok(DecompressJoin { rx, pending: self.blocks.len() })
    }
}

// ── Block tasks ──────────────────────────────────────────────────────────────

struct BlockJob<F: ?Sized> {
    block:    usize,
    storage:  Arc<dyn Storage>,
    blocks:   Arc<Vec<WordBlock>>,
    entries:  Arc<EntryTable>,
    closed:   Arc<AtomicBool>,
    options:  OpenOptions,
    callback: Arc<F>,
}

impl<F> BlockJob<F>
where
    F: Fn(usize, &Entry, &mut dyn Read) -> Result<()> + Send + Sync + ?Sized,
{
    fn run(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArchiveError::Closed);
        }
        let block = &self.blocks[self.block];
        let mut ctx = self.options.decode_context();
        let mut stream = BlockStream::new(block.open(Arc::clone(&self.storage), &mut ctx)?);
        let mut count = 0u64;
        for (idx, entry) in self.entries.block_entries(block.first_entry) {
            if self.closed.load(Ordering::Acquire) {
                return Err(ArchiveError::Closed);
            }
            if !stream.advance_to(entry.offset) {
                return Err(ArchiveError::corrupted(format!(
                    "entry {:?} overlaps its predecessor in block {}",
                    entry.name, self.block
                )));
            }
            let expected = if self.options.recovery { None } else { entry.crc };
            let mut sub = ChecksumReader::new(ExactReader::new(&mut stream, entry.size), expected, "entry");
            (self.callback)(idx, entry, &mut sub)?;
            stream.advance_to(entry.offset + entry.size);
            count += 1;
        }
        debug!(block = self.block, entries = count, "block decompressed");
        Ok(())
    }
}

/// Sends the task's outcome exactly once, whether it finished, failed,
/// panicked or was dropped unrun.
struct CountDown {
    tx:     mpsc::Sender<(usize, Result<()>)>,
    block:  usize,
    result: Option<Result<()>>,
}

impl Drop for CountDown {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(ArchiveError::corrupted(format!("block task {} did not complete", self.block))));
        let _ = self.tx.send((self.block, result));
    }
}

/// Countdown over the block tasks of one [`ArchiveReader::parallel_decompress`] call.
#[must_use = "dropping the join discards task errors"]
pub struct DecompressJoin {
    rx:      mpsc::Receiver<(usize, Result<()>)>,
    pending: usize,
}

impl DecompressJoin {
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Block until every task has reported; returns the first error.
    pub fn wait(mut self) -> Result<()> {
        let mut first = None;
        while self.pending > 0 {
            match self.rx.recv() {
                Ok((block, result)) => {
                    self.pending -= 1;
                    if let Err(e) = result {
                        debug!(block, error = %e, "block task failed");
                        first.get_or_insert(e);
                    }
                }
                Err(_) => {
                    first.get_or_insert(ArchiveError::corrupted("block tasks vanished without reporting"));
                    break;
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_stream::writer::{ArchiveWriter, SolidMode, WriteOptions};
    use crate::scheduler::InlineScheduler;
    use std::io::{Cursor as IoCursor, Write};
    use std::sync::Mutex;

    fn archive(entries: &[(&str, &[u8])], solid: SolidMode) -> Vec<u8> {
        let options = WriteOptions::default().solid(solid);
        let mut w = ArchiveWriter::new(IoCursor::new(Vec::new()), options).unwrap();
        for (name, data) in entries {
            w.begin_entry(Entry::file(*name), Some(data.len() as u64)).unwrap();
            w.write_all(data).unwrap();
            w.close_entry().unwrap();
        }
        w.finish().unwrap();
        w.into_inner().unwrap().into_inner()
    }

    #[test]
    fn sequential_reads_reuse_block_stream() {
        let bytes = archive(&[("a", b"alpha"), ("b", b"bravo"), ("c", b"charlie")], SolidMode::Single);
        let mut r = ArchiveReader::from_bytes(bytes, OpenOptions::new()).unwrap();
        assert_eq!(r.blocks().len(), 1);
        assert_eq!(r.read_entry(0).unwrap(), b"alpha");
        // skip "b" entirely
        assert_eq!(r.read_entry(2).unwrap(), b"charlie");
        // backwards forces a fresh pipeline
        assert_eq!(r.read_entry(1).unwrap(), b"bravo");
    }

    #[test]
    fn partially_read_entry_does_not_disturb_the_next() {
        let bytes = archive(&[("a", b"0123456789"), ("b", b"tail")], SolidMode::Single);
        let mut r = ArchiveReader::from_bytes(bytes, OpenOptions::new()).unwrap();
        let mut first = [0u8; 3];
        r.get_input(0).unwrap().read_exact(&mut first).unwrap();
        assert_eq!(&first, b"012");
        assert_eq!(r.read_entry(1).unwrap(), b"tail");
    }

    #[test]
    fn closed_reader_refuses_work() {
        let bytes = archive(&[("a", b"x")], SolidMode::Single);
        let mut r = ArchiveReader::from_bytes(bytes, OpenOptions::new()).unwrap();
        r.close();
        assert!(matches!(r.read_entry(0), Err(ArchiveError::Closed)));
        assert!(matches!(
            r.parallel_decompress(&InlineScheduler, |_, _, _| Ok(())),
            Err(ArchiveError::Closed)
        ));
    }

    #[test]
    fn parallel_visits_entries_in_offset_order() {
        let bytes = archive(
            &[("a", b"one"), ("b", b"two"), ("c", b"three"), ("d", b"four")],
            SolidMode::Bytes(6),
        );
        let r = ArchiveReader::from_bytes(bytes, OpenOptions::new()).unwrap();
        // [one two] [three] [four]: "four" would overflow the second block
        assert_eq!(r.blocks().len(), 3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        r.parallel_decompress(&InlineScheduler, move |idx, _, rd| {
            let mut s = String::new();
            rd.read_to_string(&mut s)?;
            sink.lock().unwrap().push((idx, s));
            Ok(())
        })
        .unwrap()
        .wait()
        .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (0, "one".to_string()));
        assert_eq!(seen[3], (3, "four".to_string()));
    }

    #[test]
    fn callback_error_reaches_join() {
        let bytes = archive(&[("a", b"one")], SolidMode::Single);
        let r = ArchiveReader::from_bytes(bytes, OpenOptions::new()).unwrap();
        let join = r
            .parallel_decompress(&InlineScheduler, |_, _, _| Err(ArchiveError::corrupted("stop")))
            .unwrap();
        assert!(join.wait().is_err());
    }

    #[test]
    fn short_file_is_not_an_archive() {
        assert!(matches!(ArchiveReader::from_bytes(b"PK\x03\x04".to_vec(), OpenOptions::new()), Err(ArchiveError::BadMagic)));
        assert!(matches!(
            ArchiveReader::from_bytes(MAGIC[..4].to_vec(), OpenOptions::new()),
            Err(ArchiveError::UnexpectedEof)
        ));
    }
}
