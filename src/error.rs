//! Crate-wide error taxonomy.
//!
//! Module-local errors ([`CodecError`], [`CryptoError`]) fold into
//! [`ArchiveError`] so callers match on one enum.  Errors that have to cross
//! an `io::Read`/`io::Write` boundary travel wrapped inside an `io::Error`
//! and are unwrapped again by `From<io::Error>`.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;

#[derive(Error, Debug)]
pub enum ArchiveError {
    // ── format-corruption ────────────────────────────────────────────────────
    #[error("Corrupted archive: {0}")]
    Corrupted(String),
    #[error("Not a 7z archive (bad signature)")]
    BadMagic,
    #[error("Unsupported format version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("{what} CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { what: &'static str, expected: u32, actual: u32 },
    #[error("Malformed coder graph: {0}")]
    MalformedGraph(String),

    // ── unsupported-codec ────────────────────────────────────────────────────
    #[error("Unsupported codec {id}")]
    UnsupportedCodec { id: String },

    // ── missing-credential ───────────────────────────────────────────────────
    #[error("Archive is encrypted but no password was provided")]
    MissingPassword,
    #[error("Wrong password or corrupted encrypted data")]
    WrongPassword,

    // ── resource-exhaustion ──────────────────────────────────────────────────
    #[error("Decode memory limit exceeded: need {needed_kb} KiB, {remaining_kb} KiB left")]
    MemoryLimit { needed_kb: u64, remaining_kb: u64 },

    // ── premature-EOF ────────────────────────────────────────────────────────
    #[error("Unexpected end of data")]
    UnexpectedEof,

    #[error("Archive is closed")]
    Closed,
    #[error("Invalid writer state: {0}")]
    WriterState(String),
    #[error("IO error: {0}")]
    Io(io::Error),
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

impl ArchiveError {
    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        ArchiveError::Corrupted(msg.into())
    }

    /// Wrap into an `io::Error` so it survives a trip through `Read`/`Write`.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            ArchiveError::Io(e) => e,
            ArchiveError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, self),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArchiveError::Corrupted(_)
                | ArchiveError::BadMagic
                | ArchiveError::UnsupportedVersion { .. }
                | ArchiveError::ChecksumMismatch { .. }
                | ArchiveError::MalformedGraph(_)
        )
    }
}

impl From<io::Error> for ArchiveError {
    fn from(e: io::Error) -> Self {
        let is_wrapped = e
            .get_ref()
            .map(|inner| inner.is::<ArchiveError>() || inner.is::<CodecError>())
            .unwrap_or(false);
        if is_wrapped {
            let kind = e.kind();
            if let Some(inner) = e.into_inner() {
                let inner = match inner.downcast::<ArchiveError>() {
                    Ok(archive) => return *archive,
                    Err(other) => other,
                };
                if let Ok(codec) = inner.downcast::<CodecError>() {
                    return ArchiveError::from(*codec);
                }
            }
            return ArchiveError::Io(io::Error::from(kind));
        }
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return ArchiveError::UnexpectedEof;
        }
        ArchiveError::Io(e)
    }
}

impl From<CodecError> for ArchiveError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Unsupported { id }           => ArchiveError::UnsupportedCodec { id },
            CodecError::MissingPassword              => ArchiveError::MissingPassword,
            CodecError::MemoryLimit { needed_kb, remaining_kb } => {
                ArchiveError::MemoryLimit { needed_kb, remaining_kb }
            }
            CodecError::Crypto(c)                    => ArchiveError::from(c),
            CodecError::Io(io)                       => ArchiveError::from(io),
            other                                    => ArchiveError::Corrupted(other.to_string()),
        }
    }
}

impl From<CryptoError> for ArchiveError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed => ArchiveError::WrongPassword,
            CryptoError::MissingKey       => ArchiveError::MissingPassword,
            other                         => ArchiveError::Corrupted(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_error_survives_io_boundary() {
        let err = ArchiveError::ChecksumMismatch { what: "entry", expected: 1, actual: 2 }.into_io();
        match ArchiveError::from(err) {
            ArchiveError::ChecksumMismatch { expected, actual, .. } => {
                assert_eq!((expected, actual), (1, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_eof_maps_to_premature_eof() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert!(matches!(ArchiveError::from(err), ArchiveError::UnexpectedEof));
    }
}
