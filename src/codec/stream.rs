//! General-purpose compressors wrapped as single-stream codec units.

use std::io::{self, BufReader, Read, Write};
use std::sync::{mpsc, Arc};
use std::thread;

use super::{BoxSink, BoxSource, Codec, CodecError, DecodeContext, Sink, DEFAULT_COMPRESSION_LEVEL};
use super::{ID_BROTLI, ID_LZ4, ID_LZMA, ID_ZSTD};

/// 7-Zip ZS option blobs: `[major, minor, level]`, optionally padded to 5 bytes.
fn level_options(level: u8, minor: u8) -> Vec<u8> {
    vec![1, minor, level]
}

fn parse_level(codec: &'static str, options: &[u8]) -> Result<Option<u8>, CodecError> {
    match options.len() {
        0 => Ok(None),
        3 | 5 => Ok(Some(options[2])),
        n => Err(CodecError::InvalidOptions { codec, reason: format!("expected 3 or 5 bytes, got {n}") }),
    }
}

// ── Zstandard ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn with_level(level: i32) -> Self {
        Self { level: level.clamp(1, 22) }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self { Self::with_level(DEFAULT_COMPRESSION_LEVEL) }
}

struct ZstdSink(zstd::stream::write::Encoder<'static, BoxSink>);

impl Write for ZstdSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.0.write(buf) }
    fn flush(&mut self) -> io::Result<()> { self.0.flush() }
}

impl Sink for ZstdSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish()?.finish()
    }
}

impl Codec for ZstdCodec {
    fn method_id(&self) -> &[u8] { ID_ZSTD }
    fn name(&self) -> &str { "zstd" }
    fn memory_usage_kb(&self) -> u64 { 8 * 1024 }
    fn write_options(&self) -> Vec<u8> { level_options(self.level as u8, 5) }
    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        if let Some(level) = parse_level("zstd", options)? {
            self.level = i32::from(level).clamp(1, 22);
        }
        Ok(())
    }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(*self) }

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> {
        let enc = zstd::stream::write::Encoder::new(sink, self.level)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(Box::new(ZstdSink(enc)))
    }

    fn decode(&self, source: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        let dec = zstd::stream::read::Decoder::new(source)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(Box::new(dec))
    }
}

// ── LZ4 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

struct Lz4Sink(lz4_flex::frame::FrameEncoder<BoxSink>);

impl Write for Lz4Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.0.write(buf) }
    fn flush(&mut self) -> io::Result<()> { self.0.flush() }
}

impl Sink for Lz4Sink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.0.finish().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        inner.finish()
    }
}

impl Codec for Lz4Codec {
    fn method_id(&self) -> &[u8] { ID_LZ4 }
    fn name(&self) -> &str { "lz4" }
    fn memory_usage_kb(&self) -> u64 { 4 * 1024 }
    fn write_options(&self) -> Vec<u8> { level_options(0, 9) }
    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        parse_level("lz4", options).map(|_| ())
    }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(*self) }

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> {
        Ok(Box::new(Lz4Sink(lz4_flex::frame::FrameEncoder::new(sink))))
    }

    fn decode(&self, source: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Ok(Box::new(lz4_flex::frame::FrameDecoder::new(source)))
    }
}

// ── Brotli ───────────────────────────────────────────────────────────────────

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LGWIN:  u32   = 22;

#[derive(Debug, Clone, Copy)]
pub struct BrotliCodec {
    quality: u32,
}

impl BrotliCodec {
    pub fn with_level(level: i32) -> Self {
        Self { quality: level.clamp(0, 11) as u32 }
    }
}

impl Default for BrotliCodec {
    fn default() -> Self { Self::with_level(DEFAULT_COMPRESSION_LEVEL) }
}

struct BrotliSink(brotli::CompressorWriter<BoxSink>);

impl Write for BrotliSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.0.write(buf) }
    fn flush(&mut self) -> io::Result<()> { self.0.flush() }
}

impl Sink for BrotliSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        // into_inner emits the final meta-block.
        self.0.into_inner().finish()
    }
}

impl Codec for BrotliCodec {
    fn method_id(&self) -> &[u8] { ID_BROTLI }
    fn name(&self) -> &str { "brotli" }
    fn memory_usage_kb(&self) -> u64 { (1 << BROTLI_LGWIN) / 1024 + 256 }
    fn write_options(&self) -> Vec<u8> { level_options(self.quality as u8, 1) }
    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        if let Some(level) = parse_level("brotli", options)? {
            self.quality = u32::from(level).min(11);
        }
        Ok(())
    }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(*self) }

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> {
        let writer = brotli::CompressorWriter::new(sink, BROTLI_BUFFER, self.quality, BROTLI_LGWIN);
        Ok(Box::new(BrotliSink(writer)))
    }

    fn decode(&self, source: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Ok(Box::new(brotli::Decompressor::new(source, BROTLI_BUFFER)))
    }
}

// ── LZMA ─────────────────────────────────────────────────────────────────────

/// Properties byte (lc=3, lp=0, pb=2) and dictionary size emitted by the
/// lzma-rs encoder.
const LZMA_ENCODER_PROPS: [u8; 5] = [0x5D, 0x00, 0x00, 0x80, 0x00];

/// Uncompressed bytes per message to the encoder thread.
const LZMA_CHUNK: usize = 64 * 1024;

/// Packed bytes fed to the decoder between drains of its output.
const LZMA_FEED: usize = 4 * 1024;

/// Classic LZMA.  The 5-byte properties header lives in the coder options,
/// the packed stream carries only range-coder output.
///
/// Both directions stream.  The lzma-rs encoder pulls its input, so it runs
/// on a helper thread fed through a bounded channel; the decoder is the
/// push-style `decompress::Stream`, drained after every feed.  Decoding
/// holds at most the window plus one flushed window, which is what
/// `memory_usage_kb` charges.
#[derive(Debug, Clone, Copy)]
pub struct LzmaCodec {
    props: [u8; 5],
}

impl Default for LzmaCodec {
    fn default() -> Self { Self { props: LZMA_ENCODER_PROPS } }
}

impl LzmaCodec {
    fn dict_size(&self) -> u32 {
        u32::from_le_bytes([self.props[1], self.props[2], self.props[3], self.props[4]])
    }
}

/// Encoder-side input.  An empty chunk marks the end; a sender dropped
/// without it aborts the encode.
struct ChunkReader {
    rx:    mpsc::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos:   usize,
    done:  bool,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            let next = self
                .rx
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "LZMA input abandoned"))?;
            self.done = next.is_empty();
            self.chunk = next;
            self.pos = 0;
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Strips the properties header the encoder writes ahead of the stream.
struct RawLzmaOut {
    seen:  usize,
    inner: BoxSink,
}

impl Write for RawLzmaOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let skip = (LZMA_ENCODER_PROPS.len() - self.seen).min(buf.len());
        if buf[..skip] != LZMA_ENCODER_PROPS[self.seen..self.seen + skip] {
            return Err(io::Error::new(io::ErrorKind::Other, "unexpected LZMA encoder properties"));
        }
        self.seen += skip;
        self.inner.write_all(&buf[skip..])?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

fn lzma_encode(rx: mpsc::Receiver<Vec<u8>>, inner: BoxSink) -> io::Result<BoxSink> {
    let mut input = BufReader::with_capacity(LZMA_CHUNK, ChunkReader { rx, chunk: Vec::new(), pos: 0, done: false });
    let mut out = RawLzmaOut { seen: 0, inner };
    let options = lzma_rs::compress::Options {
        unpacked_size: lzma_rs::compress::UnpackedSize::SkipWritingToHeader,
    };
    lzma_rs::lzma_compress_with_options(&mut input, &mut out, &options)?;
    if out.seen < LZMA_ENCODER_PROPS.len() {
        return Err(io::Error::new(io::ErrorKind::Other, "LZMA encoder wrote no properties"));
    }
    Ok(out.inner)
}

struct LzmaSink {
    pending: Vec<u8>,
    tx:      Option<mpsc::SyncSender<Vec<u8>>>,
    worker:  Option<thread::JoinHandle<io::Result<BoxSink>>>,
}

impl LzmaSink {
    fn spawn(inner: BoxSink) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(2);
        let worker = thread::Builder::new()
            .name("lzma-encode".into())
            .spawn(move || lzma_encode(rx, inner))?;
        Ok(Self { pending: Vec::with_capacity(LZMA_CHUNK), tx: Some(tx), worker: Some(worker) })
    }

    fn join(&mut self) -> io::Result<BoxSink> {
        self.tx = None;
        let worker = self
            .worker
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "LZMA encoder already finished"))?;
        worker
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "LZMA encoder thread panicked"))?
    }

    fn send(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        let delivered = match &self.tx {
            Some(tx) => tx.send(chunk).is_ok(),
            None     => false,
        };
        if delivered {
            return Ok(());
        }
        // The worker only hangs up on failure.
        match self.join() {
            Err(e) => Err(e),
            Ok(_)  => Err(io::Error::new(io::ErrorKind::BrokenPipe, "LZMA encoder stopped early")),
        }
    }
}

impl Write for LzmaSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= LZMA_CHUNK {
            let full = std::mem::replace(&mut self.pending, Vec::with_capacity(LZMA_CHUNK));
            self.send(full)?;
        }
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl Sink for LzmaSink {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let rest = std::mem::take(&mut self.pending);
        if !rest.is_empty() {
            self.send(rest)?;
        }
        self.send(Vec::new())?;
        self.join()?.finish()
    }
}

impl Drop for LzmaSink {
    fn drop(&mut self) {
        // Without the end marker the worker fails its next read; wait for it
        // so nothing reaches the inner sink afterwards.
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Pull adapter over the push-style lzma-rs decoder.
struct LzmaSource {
    source: BoxSource,
    stream: Option<lzma_rs::decompress::Stream<Vec<u8>>>,
    input:  Box<[u8]>,
    start:  usize,
    end:    usize,
    out:    Vec<u8>,
    pos:    usize,
}

impl Read for LzmaSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.pos);
                buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let Some(stream) = self.stream.as_mut() else { return Ok(0) };
            if let Some(flushed) = stream.get_output_mut().filter(|o| !o.is_empty()) {
                self.out.clear();
                std::mem::swap(&mut self.out, flushed);
                self.pos = 0;
                continue;
            }
            if self.start == self.end {
                self.start = 0;
                self.end = self.source.read(&mut self.input)?;
                if self.end == 0 {
                    // End of input: the decoder checks the size and flushes
                    // its window.
                    if let Some(stream) = self.stream.take() {
                        self.out = stream.finish().map_err(io::Error::from)?;
                        self.pos = 0;
                    }
                }
                continue;
            }
            let feed = (self.end - self.start).min(LZMA_FEED);
            let used = stream.write(&self.input[self.start..self.start + feed])?;
            // Zero means the declared size is reached; the rest is trailer.
            self.start = if used == 0 { self.end } else { self.start + used };
        }
    }
}

impl Codec for LzmaCodec {
    fn method_id(&self) -> &[u8] { ID_LZMA }
    fn name(&self) -> &str { "lzma" }
    fn memory_usage_kb(&self) -> u64 { u64::from(self.dict_size()) / 512 + (LZMA_FEED / 1024) as u64 + 16 }
    fn write_options(&self) -> Vec<u8> { self.props.to_vec() }
    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        self.props = options.try_into().map_err(|_| CodecError::InvalidOptions {
            codec:  "lzma",
            reason: format!("expected 5 bytes, got {}", options.len()),
        })?;
        if self.props[0] >= 9 * 5 * 5 {
            return Err(CodecError::InvalidOptions { codec: "lzma", reason: "bad properties byte".into() });
        }
        Ok(())
    }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(*self) }

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> {
        Ok(Box::new(LzmaSink::spawn(sink)?))
    }

    fn decode(&self, source: BoxSource, expected_len: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        if expected_len == 0 {
            return Ok(Box::new(io::empty()));
        }
        let options = lzma_rs::decompress::Options {
            unpacked_size: lzma_rs::decompress::UnpackedSize::UseProvided(Some(expected_len)),
            ..Default::default()
        };
        let mut stream = lzma_rs::decompress::Stream::new_with_options(&options, Vec::new());
        stream.write_all(&self.props)?;
        Ok(Box::new(LzmaSource {
            source,
            stream: Some(stream),
            input: vec![0; LZMA_CHUNK].into_boxed_slice(),
            start: 0,
            end: 0,
            out: Vec::new(),
            pos: 0,
        }))
    }
}
