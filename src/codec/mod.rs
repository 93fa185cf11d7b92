//! Codec units: named byte-stream transforms that the coder graph wires
//! together.
//!
//! # Identity
//! A codec is identified on disk by a short byte string (1–15 bytes), the 7z
//! "method id".  [`CodecId`] is the closed set this build implements; the
//! id → constructor table in [`REGISTRY`] is the only place ids are mapped to
//! implementations.  An id missing from the table does not fail the open: it
//! becomes an [`UnknownCodec`] placeholder that carries its options through
//! unchanged and raises [`CodecError::Unsupported`] only when a pipeline
//! actually tries to run it.
//!
//! # Streams
//! Encoding wraps a downstream [`Sink`] and returns the sink the caller writes
//! plain data into.  Decoding wraps an upstream [`BoxSource`] and returns the
//! decoded source.  Complex codecs (several inputs or outputs) implement
//! [`Codec::complex_encode`] / [`Codec::complex_decode`]; simple codecs get
//! those for free from the single-stream methods.
//!
//! # Direction vocabulary
//! "use" streams are the codec's inputs when decoding (the packed side);
//! "provide" streams are its decoded outputs.

pub mod delta;
pub mod split;
pub mod stream;

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{self, AesCodec, CryptoError, KdfParams, KeySession, Password};

pub use delta::DeltaCodec;
pub use split::X86SplitCodec;
pub use stream::{BrotliCodec, Lz4Codec, LzmaCodec, ZstdCodec};

/// Default compression level handed to level-aware codecs.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

// ── Method ids ───────────────────────────────────────────────────────────────

pub const ID_COPY:      &[u8] = &[0x00];
pub const ID_DELTA:     &[u8] = &[0x03];
pub const ID_LZMA:      &[u8] = &[0x03, 0x01, 0x01];
pub const ID_ZSTD:      &[u8] = &[0x04, 0xF7, 0x11, 0x01];
pub const ID_BROTLI:    &[u8] = &[0x04, 0xF7, 0x11, 0x02];
pub const ID_LZ4:       &[u8] = &[0x04, 0xF7, 0x11, 0x04];
pub const ID_AES_GCM:   &[u8] = &[0x06, 0xF1, 0x07, 0x81];
pub const ID_X86_SPLIT: &[u8] = &[0x7F, 0x03, 0x01, 0x1B];

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    Copy,
    Delta,
    Lzma,
    Zstd,
    Brotli,
    Lz4,
    AesGcm,
    X86Split,
}

impl CodecId {
    pub const ALL: [CodecId; 8] = [
        CodecId::Copy,
        CodecId::Delta,
        CodecId::Lzma,
        CodecId::Zstd,
        CodecId::Brotli,
        CodecId::Lz4,
        CodecId::AesGcm,
        CodecId::X86Split,
    ];

    pub fn method_id(self) -> &'static [u8] {
        match self {
            CodecId::Copy     => ID_COPY,
            CodecId::Delta    => ID_DELTA,
            CodecId::Lzma     => ID_LZMA,
            CodecId::Zstd     => ID_ZSTD,
            CodecId::Brotli   => ID_BROTLI,
            CodecId::Lz4      => ID_LZ4,
            CodecId::AesGcm   => ID_AES_GCM,
            CodecId::X86Split => ID_X86_SPLIT,
        }
    }

    pub fn from_method_id(id: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.method_id() == id)
    }

    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::Copy     => "copy",
            CodecId::Delta    => "delta",
            CodecId::Lzma     => "lzma",
            CodecId::Zstd     => "zstd",
            CodecId::Brotli   => "brotli",
            CodecId::Lz4      => "lz4",
            CodecId::AesGcm   => "aes",
            CodecId::X86Split => "x86split",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        let s = s.to_ascii_lowercase();
        match s.as_str() {
            "none" | "store" => Some(CodecId::Copy),
            _ => Self::ALL.into_iter().find(|c| c.name() == s),
        }
    }

    /// Build an encoder-side instance.  Encryption needs a password and is
    /// built through [`AesCodec::new`] instead.
    pub fn encoder(self, level: i32) -> Result<Arc<dyn Codec>, CodecError> {
        Ok(match self {
            CodecId::Copy     => Arc::new(CopyCodec),
            CodecId::Delta    => Arc::new(DeltaCodec::new(1)),
            CodecId::Lzma     => Arc::new(LzmaCodec::default()),
            CodecId::Zstd     => Arc::new(ZstdCodec::with_level(level)),
            CodecId::Brotli   => Arc::new(BrotliCodec::with_level(level)),
            CodecId::Lz4      => Arc::new(Lz4Codec::default()),
            CodecId::X86Split => Arc::new(X86SplitCodec),
            CodecId::AesGcm   => return Err(CodecError::MissingPassword),
        })
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Id → decoder-side constructor.  Options are applied afterwards.
pub static REGISTRY: &[(CodecId, fn() -> Box<dyn Codec>)] = &[
    (CodecId::Copy,     || -> Box<dyn Codec> { Box::new(CopyCodec) }),
    (CodecId::Delta,    || -> Box<dyn Codec> { Box::new(DeltaCodec::new(1)) }),
    (CodecId::Lzma,     || -> Box<dyn Codec> { Box::new(LzmaCodec::default()) }),
    (CodecId::Zstd,     || -> Box<dyn Codec> { Box::new(ZstdCodec::default()) }),
    (CodecId::Brotli,   || -> Box<dyn Codec> { Box::new(BrotliCodec::default()) }),
    (CodecId::Lz4,      || -> Box<dyn Codec> { Box::new(Lz4Codec::default()) }),
    (CodecId::AesGcm,   || -> Box<dyn Codec> { Box::new(AesCodec::for_decoding()) }),
    (CodecId::X86Split, || -> Box<dyn Codec> { Box::new(X86SplitCodec) }),
];

/// Resolve a coder description read from disk.
///
/// Unknown ids yield an [`UnknownCodec`]; known ids must agree with the
/// stream counts recorded next to them.
pub fn codec_from_disk(
    id:       &[u8],
    uses:     usize,
    provides: usize,
    options:  &[u8],
) -> Result<Arc<dyn Codec>, CodecError> {
    let ctor = CodecId::from_method_id(id)
        .and_then(|cid| REGISTRY.iter().find(|(c, _)| *c == cid))
        .map(|(_, ctor)| *ctor);
    let Some(ctor) = ctor else {
        return Ok(Arc::new(UnknownCodec::new(id, uses, provides, options)));
    };
    let mut codec = ctor();
    if codec.use_count() != uses || codec.provide_count() != provides {
        return Err(CodecError::Wiring(format!(
            "{} declares {}x{} streams, archive records {}x{}",
            codec.name(),
            codec.use_count(),
            codec.provide_count(),
            uses,
            provides
        )));
    }
    codec.read_options(options)?;
    Ok(Arc::from(codec))
}

pub fn format_method_id(id: &[u8]) -> String {
    match CodecId::from_method_id(id) {
        Some(c) => format!("{} ({})", c.name(), hex::encode(id)),
        None    => hex::encode(id),
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Invalid options for {codec}: {reason}")]
    InvalidOptions { codec: &'static str, reason: String },
    /// Raised when a placeholder for an id this build does not know is run.
    #[error("Codec {id} is not available in this build")]
    Unsupported { id: String },
    #[error("Codec requires a password")]
    MissingPassword,
    #[error("Memory limit exceeded: need {needed_kb} KiB, {remaining_kb} KiB left")]
    MemoryLimit { needed_kb: u64, remaining_kb: u64 },
    #[error("Stream wiring error: {0}")]
    Wiring(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

// ── Stream types ─────────────────────────────────────────────────────────────

pub type BoxSource = Box<dyn Read + Send>;

/// A write end that must be explicitly finished so trailing codec state
/// reaches the archive.  `finish` finishes every sink downstream of it.
pub trait Sink: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

pub type BoxSink = Box<dyn Sink>;

// ── Decode context ───────────────────────────────────────────────────────────

/// Decode memory budget in KiB.  Decremented as codecs are instantiated and
/// never restored within one open operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    remaining_kb: u64,
}

impl MemoryBudget {
    pub fn new(limit_kb: u64) -> Self { Self { remaining_kb: limit_kb } }
    pub fn unlimited() -> Self { Self { remaining_kb: u64::MAX } }
    pub fn remaining_kb(&self) -> u64 { self.remaining_kb }

    pub fn charge(&mut self, needed_kb: u64) -> Result<(), CodecError> {
        if needed_kb > self.remaining_kb {
            return Err(CodecError::MemoryLimit { needed_kb, remaining_kb: self.remaining_kb });
        }
        self.remaining_kb -= needed_kb;
        Ok(())
    }
}

/// Everything a decode session threads through the codecs it instantiates.
pub struct DecodeContext {
    pub budget: MemoryBudget,
    password:   Option<Arc<Password>>,
    keys:       KeySession,
}

impl DecodeContext {
    pub fn new(budget: MemoryBudget, password: Option<Arc<Password>>) -> Self {
        Self { budget, password, keys: KeySession::default() }
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Derived key for `params`, computed at most once per session.
    pub fn session_key(&mut self, params: &KdfParams) -> Result<[u8; crypto::KEY_LEN], CodecError> {
        let password = self.password.as_deref().ok_or(CodecError::MissingPassword)?;
        Ok(self.keys.key_for(password, params)?)
    }
}

impl fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("budget", &self.budget)
            .field("password", &self.password.is_some())
            .finish()
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync + fmt::Debug {
    fn method_id(&self) -> &[u8];
    fn name(&self) -> &str;

    fn use_count(&self) -> usize { 1 }
    fn provide_count(&self) -> usize { 1 }
    /// Written as the "complex" coder flag on disk.
    fn is_complex(&self) -> bool { self.use_count() != 1 || self.provide_count() != 1 }
    /// Identity transforms make metadata compression pointless.
    fn is_identity(&self) -> bool { false }

    /// Decode-time working memory in KiB.
    fn memory_usage_kb(&self) -> u64 { 0 }

    fn write_options(&self) -> Vec<u8> { Vec::new() }

    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        if options.is_empty() {
            Ok(())
        } else {
            Err(CodecError::InvalidOptions {
                codec:  "generic",
                reason: format!("{} takes no options, got {} bytes", self.name(), options.len()),
            })
        }
    }

    /// A fresh instance for a new block.  Encoders with per-block parameters
    /// (nonces) regenerate them here.
    fn instantiate(&self) -> Arc<dyn Codec>;

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError>;

    fn decode(
        &self,
        source:       BoxSource,
        expected_len: u64,
        ctx:          &mut DecodeContext,
    ) -> Result<BoxSource, CodecError>;

    /// `sinks` has `use_count()` entries; returns `provide_count()` sinks.
    fn complex_encode(&self, mut sinks: Vec<BoxSink>) -> Result<Vec<BoxSink>, CodecError> {
        match (sinks.pop(), sinks.is_empty()) {
            (Some(sink), true) => Ok(vec![self.encode(sink)?]),
            _ => Err(CodecError::Wiring(format!("{} expects exactly one sink", self.name()))),
        }
    }

    /// `sources` has `use_count()` entries and `sizes` holds the decoded size
    /// of each provided stream; returns `provide_count()` sources.
    fn complex_decode(
        &self,
        mut sources: Vec<BoxSource>,
        sizes:       &[u64],
        ctx:         &mut DecodeContext,
    ) -> Result<Vec<BoxSource>, CodecError> {
        match (sources.pop(), sources.is_empty(), sizes) {
            (Some(src), true, [size]) => Ok(vec![self.decode(src, *size, ctx)?]),
            _ => Err(CodecError::Wiring(format!("{} expects exactly one source", self.name()))),
        }
    }
}

// ── Copy ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyCodec;

impl Codec for CopyCodec {
    fn method_id(&self) -> &[u8] { ID_COPY }
    fn name(&self) -> &str { "copy" }
    fn is_identity(&self) -> bool { true }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(CopyCodec) }
    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> { Ok(sink) }
    fn decode(&self, source: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Ok(source)
    }
}

// ── Unknown ──────────────────────────────────────────────────────────────────

/// Stand-in for a method id this build cannot run.  Keeps the topology and
/// options intact so the archive can still be listed and rewritten.
#[derive(Debug, Clone)]
pub struct UnknownCodec {
    id:       Vec<u8>,
    /// Hex form of `id`.
    label:    String,
    uses:     usize,
    provides: usize,
    options:  Vec<u8>,
}

impl UnknownCodec {
    pub fn new(id: &[u8], uses: usize, provides: usize, options: &[u8]) -> Self {
        Self { id: id.to_vec(), label: hex::encode(id), uses, provides, options: options.to_vec() }
    }

    fn unsupported(&self) -> CodecError {
        CodecError::Unsupported { id: self.label.clone() }
    }
}

impl Codec for UnknownCodec {
    fn method_id(&self) -> &[u8] { &self.id }
    fn name(&self) -> &str { &self.label }
    fn use_count(&self) -> usize { self.uses }
    fn provide_count(&self) -> usize { self.provides }
    fn write_options(&self) -> Vec<u8> { self.options.clone() }
    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        self.options = options.to_vec();
        Ok(())
    }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(self.clone()) }
    fn encode(&self, _: BoxSink) -> Result<BoxSink, CodecError> { Err(self.unsupported()) }
    fn decode(&self, _: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Err(self.unsupported())
    }
    fn complex_encode(&self, _: Vec<BoxSink>) -> Result<Vec<BoxSink>, CodecError> {
        Err(self.unsupported())
    }
    fn complex_decode(
        &self,
        _: Vec<BoxSource>,
        _: &[u64],
        _: &mut DecodeContext,
    ) -> Result<Vec<BoxSource>, CodecError> {
        Err(self.unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_id() {
        for id in CodecId::ALL {
            assert!(REGISTRY.iter().any(|(c, _)| *c == id), "{id} missing");
            assert_eq!(CodecId::from_method_id(id.method_id()), Some(id));
        }
    }

    #[test]
    fn unknown_id_is_deferred() {
        let codec = codec_from_disk(&[0x06, 0xF1, 0x07, 0x01], 1, 1, &[1, 2, 3]).unwrap();
        assert_eq!(codec.write_options(), [1, 2, 3]);
        let mut ctx = DecodeContext::new(MemoryBudget::unlimited(), None);
        let src: BoxSource = Box::new(io::empty());
        assert!(matches!(codec.decode(src, 0, &mut ctx), Err(CodecError::Unsupported { .. })));
    }

    #[test]
    fn stream_count_mismatch_is_rejected() {
        assert!(matches!(codec_from_disk(ID_ZSTD, 2, 1, &[]), Err(CodecError::Wiring(_))));
    }

    #[test]
    fn budget_is_never_restored() {
        let mut budget = MemoryBudget::new(100);
        budget.charge(60).unwrap();
        assert!(budget.charge(60).is_err());
        assert_eq!(budget.remaining_kb(), 40);
    }
}
