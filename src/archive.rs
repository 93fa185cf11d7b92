//! High-level [`Archive`] API: the primary embedding surface.
//!
//! ```no_run
//! use solid7z::archive::{Archive, PackOptions};
//!
//! // Write
//! let mut ar = Archive::create("out.7z", PackOptions::default())?;
//! ar.add_file("readme.txt", b"Hello, world!")?;
//! ar.finalize()?;
//!
//! // Read
//! let mut ar = Archive::open("out.7z")?;
//! let data = ar.read_file("readme.txt")?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::codec::{Codec, CodecId, DEFAULT_COMPRESSION_LEVEL};
use crate::crypto::KdfParams;
use crate::error::{ArchiveError, Result};
use crate::index::{Entry, FileInfo, FileTime};
use crate::io_stream::{ArchiveReader, ArchiveSummary, ArchiveWriter, HeaderCompression, OpenOptions, SolidMode, WriteOptions};
use crate::scheduler::Scheduler;

// ── PackOptions ───────────────────────────────────────────────────────────────

/// Configuration for [`Archive::create`] and [`Archive::append`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub codec:              CodecId,
    pub level:              i32,
    /// Put the x86 branch splitter in front of the codec.
    pub branch_filter:      bool,
    pub solid:              SolidMode,
    pub header_compression: HeaderCompression,
    /// When set, every block and the metadata are AES-256-GCM encrypted with
    /// an Argon2id-derived key.
    pub password:           Option<String>,
    pub kdf:                Option<KdfParams>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            codec:              CodecId::Zstd,
            level:              DEFAULT_COMPRESSION_LEVEL,
            branch_filter:      false,
            solid:              SolidMode::default(),
            header_compression: HeaderCompression::default(),
            password:           None,
            kdf:                None,
        }
    }
}

impl PackOptions {
    pub fn write_options(&self) -> Result<WriteOptions> {
        let main: Arc<dyn Codec> = self.codec.encoder(self.level)?;
        let mut options = WriteOptions::default()
            .solid(self.solid)
            .header_compression(self.header_compression);
        options = if self.branch_filter {
            let side: Arc<dyn Codec> = CodecId::Lzma.encoder(self.level)?;
            options.graph(crate::graph::CoderGraph::branch_split(main, side)?)
        } else {
            options.codecs(vec![main])
        };
        if let Some(pwd) = &self.password {
            if self.branch_filter {
                return Err(ArchiveError::WriterState("encryption needs a linear codec chain".into()));
            }
            options = options.encrypt(pwd, self.kdf.unwrap_or_else(KdfParams::generate))?;
        }
        Ok(options)
    }
}

// ── ArchiveMode ───────────────────────────────────────────────────────────────

enum ArchiveMode {
    Read(ArchiveReader),
    Write(ArchiveWriter<File>),
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path: PathBuf,
    mode: ArchiveMode,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    pub fn open_encrypted<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        Self::open_with(path, OpenOptions::default().password(password))
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let reader = ArchiveReader::open(&path, options)?;
        Ok(Self { path, mode: ArchiveMode::Read(reader) })
    }

    pub fn create<P: AsRef<Path>>(path: P, opts: PackOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let writer = ArchiveWriter::create(&path, opts.write_options()?)?;
        Ok(Self { path, mode: ArchiveMode::Write(writer) })
    }

    /// Reopen an existing archive to add entries after its last block.
    pub fn append<P: AsRef<Path>>(path: P, opts: PackOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let writer = ArchiveWriter::append(&path, opts.write_options()?)?;
        Ok(Self { path, mode: ArchiveMode::Write(writer) })
    }

    // ── Write ─────────────────────────────────────────────────────────────────

    fn writer(&mut self) -> Result<&mut ArchiveWriter<File>> {
        match &mut self.mode {
            ArchiveMode::Write(w) => Ok(w),
            ArchiveMode::Read(_)  => Err(read_only()),
        }
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.writer()?.add_entry(Entry::file(name).with_mtime(FileTime::now()), data)
    }

    pub fn add_directory(&mut self, name: &str) -> Result<()> {
        self.writer()?.add_entry(Entry::directory(name).with_mtime(FileTime::now()), &[])
    }

    /// Add a file or a whole directory tree from disk under `name`.
    /// Returns the number of entries added.
    pub fn add_path<P: AsRef<Path>>(&mut self, source: P, name: &str) -> Result<usize> {
        let source = source.as_ref();
        let meta = fs::metadata(source)?;
        let mtime = meta.modified().ok().map(FileTime::from_system_time);
        if meta.is_dir() {
            let mut entry = Entry::directory(name);
            entry.mtime = mtime;
            self.writer()?.add_entry(with_mode(entry, &meta), &[])?;
            let mut children: Vec<_> = fs::read_dir(source)?.collect::<io::Result<_>>()?;
            children.sort_by_key(|c| c.file_name());
            let mut added = 1;
            for child in children {
                let child_name = format!("{name}/{}", child.file_name().to_string_lossy());
                added += self.add_path(child.path(), &child_name)?;
            }
            Ok(added)
        } else {
            let mut entry = Entry::file(name);
            entry.mtime = mtime;
            let mut file = File::open(source)?;
            self.writer()?.add_reader(with_mode(entry, &meta), &mut file, Some(meta.len()))?;
            Ok(1)
        }
    }

    /// Write the metadata and patch the start header.  Must be called once.
    pub fn finalize(&mut self) -> Result<u64> {
        self.writer()?.finish()
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    fn reader(&mut self) -> Result<&mut ArchiveReader> {
        match &mut self.mode {
            ArchiveMode::Read(r)  => Ok(r),
            ArchiveMode::Write(_) => Err(write_only()),
        }
    }

    pub fn list(&self) -> Vec<FileInfo> {
        match &self.mode {
            ArchiveMode::Read(r)  => r.entries().iter().map(Entry::info).collect(),
            ArchiveMode::Write(w) => w.entries().iter().map(Entry::info).collect(),
        }
    }

    pub fn stat(&self, name: &str) -> Option<FileInfo> {
        self.list().into_iter().find(|f| f.name == name)
    }

    pub fn summary(&mut self) -> Result<ArchiveSummary> {
        self.reader()?.summary()
    }

    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let reader = self.reader()?;
        let index = reader
            .position(name)?
            .ok_or_else(|| ArchiveError::Io(io::Error::new(io::ErrorKind::NotFound, format!("File not found: {name}"))))?;
        reader.read_entry(index)
    }

    /// Decode every entry and check its CRC.  Returns the bytes checked.
    pub fn test(&mut self) -> Result<u64> {
        let reader = self.reader()?;
        let mut total = 0;
        for index in 0..reader.entries().len() {
            total += io::copy(&mut reader.get_input(index)?, &mut io::sink())?;
        }
        Ok(total)
    }

    /// Extract all entries into `dest`, creating it if necessary.
    /// Returns the number of entries written.
    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> Result<usize> {
        let dest = dest.as_ref();
        let reader = self.reader()?;
        prepare_tree(dest, reader)?;
        let mut written = 0;
        for index in 0..reader.entries().len() {
            let Some(entry) = reader.entries().get(index).cloned() else { continue };
            if !entry.has_stream() {
                continue;
            }
            let target = safe_join(dest, &entry.name)?;
            let mut out = File::create(&target)?;
            io::copy(&mut reader.get_input(index)?, &mut out)?;
            restore_metadata(&out, &target, &entry)?;
            written += 1;
        }
        debug!(dest = %dest.display(), files = written, "extracted");
        Ok(written + empty_count(reader))
    }

    /// Like [`extract_all`](Self::extract_all) but decodes blocks on `scheduler`.
    pub fn extract_parallel<P: AsRef<Path>>(&mut self, dest: P, scheduler: &dyn Scheduler) -> Result<usize> {
        let dest = dest.as_ref().to_owned();
        let reader = self.reader()?;
        prepare_tree(&dest, reader)?;
        let streams = reader.entries().iter().filter(|e| e.has_stream()).count();
        let root = dest.clone();
        let join = reader.parallel_decompress(scheduler, move |_, entry, data| {
            let target = safe_join(&root, &entry.name)?;
            let mut out = File::create(&target)?;
            io::copy(data, &mut out)?;
            restore_metadata(&out, &target, entry)
        })?;
        join.wait()?;
        debug!(dest = %dest.display(), files = streams, "extracted in parallel");
        Ok(streams + empty_count(reader))
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }

    pub fn warnings(&self) -> &[String] {
        match &self.mode {
            ArchiveMode::Read(r)  => r.warnings(),
            ArchiveMode::Write(_) => &[],
        }
    }

    /// Drop the password and stop in-flight block tasks.
    pub fn close(&mut self) {
        if let ArchiveMode::Read(r) = &mut self.mode {
            r.close();
        }
    }
}

// ── Extraction helpers ───────────────────────────────────────────────────────

/// Resolve an entry name below `dest`.  Absolute names and `..` are refused.
pub fn safe_join(dest: &Path, name: &str) -> Result<PathBuf> {
    let mut out = dest.to_path_buf();
    let normalized = name.replace('\\', "/");
    for part in Path::new(&normalized).components() {
        match part {
            Component::Normal(p) => out.push(p),
            Component::CurDir    => {}
            _ => return Err(ArchiveError::corrupted(format!("unsafe entry path {name:?}"))),
        }
    }
    if out == dest {
        return Err(ArchiveError::corrupted(format!("empty entry path {name:?}")));
    }
    Ok(out)
}

/// Create directories, empty files and the parents of every stored file.
fn prepare_tree(dest: &Path, reader: &ArchiveReader) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in reader.entries() {
        if entry.is_anti {
            continue;
        }
        let target = safe_join(dest, &entry.name)?;
        if entry.is_directory {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !entry.has_stream() {
            let out = File::create(&target)?;
            restore_metadata(&out, &target, entry)?;
        }
    }
    Ok(())
}

fn empty_count(reader: &ArchiveReader) -> usize {
    reader.entries().iter().filter(|e| !e.has_stream() && !e.is_anti).count()
}

fn restore_metadata(file: &File, path: &Path, entry: &Entry) -> Result<()> {
    if let Some(t) = entry.mtime.and_then(FileTime::to_datetime) {
        file.set_modified(SystemTime::from(t))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(unix)]
fn with_mode(entry: Entry, meta: &fs::Metadata) -> Entry {
    use std::os::unix::fs::PermissionsExt;
    entry.with_unix_mode(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn with_mode(entry: Entry, _: &fs::Metadata) -> Entry {
    entry
}

fn read_only()  -> ArchiveError { ArchiveError::WriterState("archive is read-only".into()) }
fn write_only() -> ArchiveError { ArchiveError::WriterState("archive is write-only".into()) }
