//! Entry table: the archive's logical files in present order.
//!
//! Entries that own bytes point at a block and an offset inside that block's
//! decoded stream; entries sharing a block are chained through `next` in
//! offset order.  Directories, anti-items and zero-length files own no block.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::{ArchiveError, Result};

/// FILE_ATTRIBUTE_DIRECTORY
pub const ATTR_DIRECTORY: u32 = 0x10;
/// Set when the high 16 bits carry a unix mode.
pub const ATTR_UNIX_EXTENSION: u32 = 0x8000;

// ── FileTime ─────────────────────────────────────────────────────────────────

/// 100 ns ticks since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileTime(pub u64);

const TICKS_PER_SEC: u64 = 10_000_000;
const UNIX_EPOCH_SECS: u64 = 11_644_473_600;

impl FileTime {
    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        let secs = t.timestamp() as i128 + UNIX_EPOCH_SECS as i128;
        let ticks = secs * TICKS_PER_SEC as i128 + (t.timestamp_subsec_nanos() / 100) as i128;
        FileTime(ticks.clamp(0, u64::MAX as i128) as u64)
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        Self::from_datetime(DateTime::<Utc>::from(t))
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = (self.0 / TICKS_PER_SEC) as i64 - UNIX_EPOCH_SECS as i64;
        let nanos = (self.0 % TICKS_PER_SEC) as u32 * 100;
        Utc.timestamp_opt(secs, nanos).single()
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub name:         String,
    pub size:         u64,
    pub crc:          Option<u32>,
    pub is_directory: bool,
    pub is_anti:      bool,
    pub ctime:        Option<FileTime>,
    pub atime:        Option<FileTime>,
    pub mtime:        Option<FileTime>,
    pub attributes:   Option<u32>,
    pub(crate) block:  Option<usize>,
    pub(crate) offset: u64,
    pub(crate) next:   Option<usize>,
}

impl Entry {
    pub fn file(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_directory: true, ..Self::default() }
    }

    /// Deletion marker: removes `name` when the archive is applied as an update.
    pub fn anti(name: impl Into<String>, directory: bool) -> Self {
        Self { name: name.into(), is_directory: directory, is_anti: true, ..Self::default() }
    }

    pub fn with_mtime(mut self, t: FileTime) -> Self {
        self.mtime = Some(t);
        self
    }

    pub fn with_attributes(mut self, attributes: u32) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_unix_mode(mut self, mode: u32) -> Self {
        let base = if self.is_directory { ATTR_DIRECTORY } else { 0 };
        self.attributes = Some(base | ATTR_UNIX_EXTENSION | (mode << 16));
        self
    }

    pub fn unix_mode(&self) -> Option<u32> {
        self.attributes
            .filter(|a| a & ATTR_UNIX_EXTENSION != 0)
            .map(|a| a >> 16)
    }

    pub fn has_stream(&self) -> bool { self.block.is_some() }
    pub fn block_index(&self) -> Option<usize> { self.block }
    pub fn offset(&self) -> u64 { self.offset }
    pub fn next_in_block(&self) -> Option<usize> { self.next }

    /// Zero-length regular file stored without a block.
    pub fn is_empty_file(&self) -> bool {
        self.block.is_none() && !self.is_directory
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            name:       self.name.clone(),
            size:       self.size,
            crc:        self.crc.map(|c| format!("{c:08x}")),
            directory:  self.is_directory,
            anti:       self.is_anti,
            block:      self.block,
            modified:   self.mtime.and_then(FileTime::to_datetime).map(|t| t.to_rfc3339()),
            attributes: self.attributes,
        }
    }
}

/// Listing row for `list --json`.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name:       String,
    pub size:       u64,
    pub crc:        Option<String>,
    pub directory:  bool,
    pub anti:       bool,
    pub block:      Option<usize>,
    pub modified:   Option<String>,
    pub attributes: Option<u32>,
}

// ── Attribute counts ─────────────────────────────────────────────────────────

/// How many entries carry each optional attribute; picks bitmap vs.
/// all-defined encoding when the metadata is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeCounts {
    pub empty:      usize,
    pub empty_file: usize,
    pub anti:       usize,
    pub ctime:      usize,
    pub atime:      usize,
    pub mtime:      usize,
    pub attributes: usize,
    pub crc:        usize,
}

impl AttributeCounts {
    pub fn tally(&mut self, e: &Entry) {
        if !e.has_stream() {
            self.empty += 1;
            if !e.is_directory {
                self.empty_file += 1;
            }
        } else if e.crc.is_some() {
            self.crc += 1;
        }
        self.anti += e.is_anti as usize;
        self.ctime += e.ctime.is_some() as usize;
        self.atime += e.atime.is_some() as usize;
        self.mtime += e.mtime.is_some() as usize;
        self.attributes += e.attributes.is_some() as usize;
    }

    pub fn untally(&mut self, e: &Entry) {
        let mut one = AttributeCounts::default();
        one.tally(e);
        *self = self.saturating_sub(&one);
    }

    pub fn merge(&mut self, other: &AttributeCounts) {
        self.empty += other.empty;
        self.empty_file += other.empty_file;
        self.anti += other.anti;
        self.ctime += other.ctime;
        self.atime += other.atime;
        self.mtime += other.mtime;
        self.attributes += other.attributes;
        self.crc += other.crc;
    }

    fn saturating_sub(&self, o: &AttributeCounts) -> AttributeCounts {
        AttributeCounts {
            empty:      self.empty.saturating_sub(o.empty),
            empty_file: self.empty_file.saturating_sub(o.empty_file),
            anti:       self.anti.saturating_sub(o.anti),
            ctime:      self.ctime.saturating_sub(o.ctime),
            atime:      self.atime.saturating_sub(o.atime),
            mtime:      self.mtime.saturating_sub(o.mtime),
            attributes: self.attributes.saturating_sub(o.attributes),
            crc:        self.crc.saturating_sub(o.crc),
        }
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut counts = Self::default();
        for e in entries {
            counts.tally(e);
        }
        counts
    }
}

// ── EntryTable ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EntryTable {
    entries:   Vec<Entry>,
    by_name:   HashMap<String, usize>,
    duplicate: Option<String>,
}

impl EntryTable {
    pub fn new(entries: Vec<Entry>) -> Self {
        let mut by_name = HashMap::with_capacity(entries.len());
        let mut duplicate = None;
        for (i, e) in entries.iter().enumerate() {
            if by_name.insert(e.name.clone(), i).is_some() && duplicate.is_none() {
                duplicate = Some(e.name.clone());
            }
        }
        Self { entries, by_name, duplicate }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, i: usize) -> Option<&Entry> { self.entries.get(i) }
    pub fn iter(&self) -> std::slice::Iter<'_, Entry> { self.entries.iter() }
    pub fn as_slice(&self) -> &[Entry] { &self.entries }

    /// Entry by name.  Fails when two entries share a name; iterate the
    /// table instead to reach both.
    pub fn find(&self, name: &str) -> Result<Option<&Entry>> {
        Ok(self.position(name)?.map(|i| &self.entries[i]))
    }

    pub fn position(&self, name: &str) -> Result<Option<usize>> {
        if let Some(dup) = &self.duplicate {
            return Err(ArchiveError::corrupted(format!(
                "duplicate entry name {dup:?}; look entries up by position instead"
            )));
        }
        Ok(self.by_name.get(name).copied())
    }

    /// Entries chained from `first`, in offset order.
    pub fn block_entries(&self, first: Option<usize>) -> BlockEntries<'_> {
        BlockEntries { table: self, next: first }
    }

    pub fn into_vec(self) -> Vec<Entry> {
        self.entries
    }
}

impl<'a> IntoIterator for &'a EntryTable {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;
    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

pub struct BlockEntries<'a> {
    table: &'a EntryTable,
    next:  Option<usize>,
}

impl<'a> Iterator for BlockEntries<'a> {
    type Item = (usize, &'a Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next?;
        let e = self.table.entries.get(i)?;
        self.next = e.next;
        Some((i, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetime_round_trips_through_chrono() {
        let t = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        let ft = FileTime::from_datetime(t);
        assert_eq!(ft.to_datetime(), Some(t));
        // 1970-01-01 is 11644473600 s after 1601-01-01
        assert_eq!(FileTime::from_datetime(Utc.timestamp_opt(0, 0).unwrap()).0, 116_444_736_000_000_000);
    }

    #[test]
    fn duplicate_names_fail_lookup() {
        let table = EntryTable::new(vec![Entry::file("a"), Entry::file("b"), Entry::file("a")]);
        assert!(table.find("b").is_err());
        assert_eq!(table.len(), 3);
        let unique = EntryTable::new(vec![Entry::file("a"), Entry::directory("d")]);
        assert!(unique.find("d").unwrap().unwrap().is_directory);
        assert!(unique.find("zz").unwrap().is_none());
    }

    #[test]
    fn counts_track_optional_attributes() {
        let mut stored = Entry::file("x").with_mtime(FileTime(1));
        stored.block = Some(0);
        stored.crc = Some(7);
        let entries = [stored, Entry::directory("d"), Entry::anti("gone", false)];
        let counts = AttributeCounts::from_entries(&entries);
        assert_eq!((counts.empty, counts.empty_file, counts.anti), (2, 1, 1));
        assert_eq!((counts.mtime, counts.crc), (1, 1));
        let mut c = counts;
        c.untally(&entries[2]);
        assert_eq!((c.empty, c.empty_file, c.anti), (1, 0, 0));
    }

    #[test]
    fn unix_mode_lives_in_high_bits() {
        let e = Entry::file("run.sh").with_unix_mode(0o755);
        assert_eq!(e.unix_mode(), Some(0o755));
        assert_eq!(Entry::file("x").unix_mode(), None);
    }
}
