//! Recovery mode: relaxed integrity checks and header relocation.
//!
//! Soft checks (trailing bytes inside a property, a start header whose CRC
//! fails, stored entry sizes that do not add up) go through [`Diagnostics`].
//! Outside recovery they are ordinary errors; in recovery they are logged with
//! `tracing::warn!` and collected so callers can show them afterwards.
//! Structural failures (truncated metadata, an undecodable graph) stay fatal
//! in both modes.

pub mod scanner;

use tracing::warn;

use crate::error::{ArchiveError, Result};

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    lenient:  bool,
    warnings: Vec<String>,
}

impl Diagnostics {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self { lenient: true, warnings: Vec::new() }
    }

    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    /// Report a check that recovery mode may ignore.
    pub fn soft(&mut self, err: ArchiveError) -> Result<()> {
        if !self.lenient {
            return Err(err);
        }
        warn!(error = %err, "recovery: continuing past integrity failure");
        self.warnings.push(err.to_string());
        Ok(())
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_fails_soft_checks() {
        let mut d = Diagnostics::strict();
        assert!(d.soft(ArchiveError::corrupted("x")).is_err());
        assert!(d.warnings().is_empty());
    }

    #[test]
    fn lenient_mode_collects_warnings() {
        let mut d = Diagnostics::lenient();
        d.soft(ArchiveError::corrupted("trailing bytes")).unwrap();
        assert_eq!(d.into_warnings(), ["Corrupted archive: trailing bytes"]);
    }
}
