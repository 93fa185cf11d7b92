//! Metadata relocation for archives whose start header was never patched.
//!
//! # How it works
//!
//! A writer that dies before `finish` leaves a start header with offset,
//! length and CRC all zero.  The metadata, when it made it to disk at all,
//! is the last thing in the file.  The scanner therefore walks backward from
//! the end of the file over a bounded window and treats every byte equal to
//! the `Header` (0x01) or `EncodedHeader` (0x17) tag as a candidate start.
//!
//! Each candidate is parsed with [`ParseOptions::exact`] set, so a candidate
//! only wins if its parse consumes precisely the bytes up to end of file and
//! the blocks it describes end before it.  Failures are recorded and
//! discarded.
//!
//! ## Passes
//!
//! | Pass      | Diagnostics               | Purpose                                 |
//! |-----------|---------------------------|-----------------------------------------|
//! | strict    | [`Diagnostics::strict`]   | prefer a candidate that is fully intact |
//! | lenient   | [`Diagnostics::lenient`]  | accept soft damage, keep the warnings   |
//!
//! Within a pass candidates are tried nearest-to-EOF first.
//!
//! ## Progress
//!
//! [`locate_metadata`] accepts an optional [`ProgressFn`] called after every
//! candidate with `(attempts_done, attempts_total)`.

use crate::error::{ArchiveError, Result};
use crate::header::{nid, parse_metadata, ArchiveMetadata, MetadataSource, ParseOptions};
use crate::io_stream::storage::Storage;
use crate::recovery::Diagnostics;
use crate::superblock::SUPERBLOCK_SIZE;

/// How far back from end of file candidates are searched.
pub const SCAN_WINDOW: u64 = 1024 * 1024;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPass {
    Strict,
    Lenient,
}

/// What happened to one candidate in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct Candidate {
    /// Absolute file offset of the tag byte.
    pub position: u64,
    pub tag:      u8,
    pub pass:     ScanPass,
    pub verdict:  Verdict,
}

/// Complete report produced by [`locate_metadata`].
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Absolute range searched, `[window_start, file_len)`.
    pub window_start: u64,
    pub file_len:     u64,
    /// Every attempt, in the order made.
    pub attempts:     Vec<Candidate>,
    /// Winning candidate, if any.
    pub accepted:     Option<Candidate>,
    /// Soft failures tolerated by a lenient win.
    pub warnings:     Vec<String>,
}

impl ScanReport {
    pub fn candidate_count(&self) -> usize {
        self.attempts.iter().filter(|c| c.pass == ScanPass::Strict).count()
    }

    /// Summary line for display.
    pub fn summary(&self) -> String {
        match &self.accepted {
            Some(c) => format!(
                "metadata found at offset {} ({:?} pass, tag {:#04x}) after {} attempt(s), {} warning(s)",
                c.position,
                c.pass,
                c.tag,
                self.attempts.len(),
                self.warnings.len(),
            ),
            None => format!(
                "no metadata found in the last {} bytes ({} candidate(s) rejected)",
                self.file_len - self.window_start,
                self.candidate_count(),
            ),
        }
    }
}

// ── Progress callback ─────────────────────────────────────────────────────────

pub type ProgressFn<'a> = dyn FnMut(u64 /*done*/, u64 /*total*/) + 'a;

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Search the tail of `storage` for a metadata section that parses to EOF.
///
/// Returns the parsed metadata together with the report.  When no candidate
/// parses, the error is a format-corruption error carrying the report's
/// summary; I/O errors reading the window propagate unchanged.
pub fn locate_metadata(
    storage:      &dyn Storage,
    opts:         &ParseOptions,
    source:       &mut dyn MetadataSource,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<(ArchiveMetadata, ScanReport)> {
    let file_len = storage.len()?;
    let data_start = SUPERBLOCK_SIZE as u64;
    if file_len < data_start + 2 {
        return Err(ArchiveError::corrupted("archive too short to hold metadata"));
    }
    let window_start = data_start.max(file_len.saturating_sub(SCAN_WINDOW));
    let mut window = vec![0u8; (file_len - window_start) as usize];
    storage.read_exact_at(window_start, &mut window)?;

    let positions: Vec<usize> = (0..window.len() - 1)
        .rev()
        .filter(|&i| matches!(window[i], nid::HEADER | nid::ENCODED_HEADER))
        .collect();

    let mut report = ScanReport { window_start, file_len, ..ScanReport::default() };
    let exact = ParseOptions { exact: true, ..*opts };
    let total = positions.len() as u64 * 2;
    let mut done = 0u64;

    for pass in [ScanPass::Strict, ScanPass::Lenient] {
        for &i in &positions {
            let position = window_start + i as u64;
            let mut diag = match pass {
                ScanPass::Strict  => Diagnostics::strict(),
                ScanPass::Lenient => Diagnostics::lenient(),
            };
            let outcome = parse_metadata(&window[i..], &exact, &mut diag, source).and_then(|meta| {
                let end = data_start + meta.data_end();
                if end > position {
                    return Err(ArchiveError::corrupted(format!("blocks run to {end}, past the metadata")));
                }
                Ok(meta)
            });
            let mut candidate = Candidate { position, tag: window[i], pass, verdict: Verdict::Accepted };
            done += 1;
            if let Some(cb) = progress.as_deref_mut() {
                cb(done, total);
            }
            match outcome {
                Ok(meta) => {
                    report.attempts.push(candidate.clone());
                    report.accepted = Some(candidate);
                    report.warnings = diag.into_warnings();
                    return Ok((meta, report));
                }
                Err(e) => {
                    candidate.verdict = Verdict::Rejected(e.to_string());
                    report.attempts.push(candidate);
                }
            }
        }
    }
    Err(ArchiveError::corrupted(format!("recovery scan failed: {}", report.summary())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::WordBlock;

    struct NoBlocks;

    impl MetadataSource for NoBlocks {
        fn unpack(&mut self, _: &WordBlock) -> Result<Vec<u8>> {
            Err(ArchiveError::corrupted("no encoded headers here"))
        }
    }

    fn file_with_tail(tail: &[u8]) -> Vec<u8> {
        let mut file = vec![0u8; SUPERBLOCK_SIZE];
        file.extend_from_slice(tail);
        file
    }

    #[test]
    fn finds_minimal_header_at_eof() {
        let file = file_with_tail(&[0xAA, 0x01, 0x17, nid::HEADER, nid::END]);
        let (meta, report) = locate_metadata(&file, &ParseOptions::default(), &mut NoBlocks, None).unwrap();
        assert!(meta.entries.is_empty());
        let won = report.accepted.unwrap();
        assert_eq!(won.position, SUPERBLOCK_SIZE as u64 + 3);
        assert_eq!(won.pass, ScanPass::Strict);
    }

    #[test]
    fn garbage_tail_reports_every_candidate() {
        let file = file_with_tail(&[0x01, 0x17, 0x01, 0xFF]);
        let mut calls = 0;
        let mut cb = |_: u64, _: u64| calls += 1;
        let err = locate_metadata(&file, &ParseOptions::default(), &mut NoBlocks, Some(&mut cb as &mut ProgressFn<'_>)).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(calls, 6);
    }

    #[test]
    fn too_short_to_scan() {
        let file = vec![0u8; SUPERBLOCK_SIZE];
        assert!(locate_metadata(&file, &ParseOptions::default(), &mut NoBlocks, None).is_err());
    }
}
