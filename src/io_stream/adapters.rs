//! Small stream adapters shared by the reader and the writer.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::{BoxSink, Sink};
use crate::error::ArchiveError;

// ── Write side ───────────────────────────────────────────────────────────────

/// Archive output shared between a writer and the raw sink of its open block.
pub(crate) struct SharedOut<S>(Arc<Mutex<S>>);

impl<S> Clone for SharedOut<S> {
    fn clone(&self) -> Self {
        SharedOut(Arc::clone(&self.0))
    }
}

impl<S> SharedOut<S> {
    pub(crate) fn new(out: S) -> Self {
        SharedOut(Arc::new(Mutex::new(out)))
    }

    pub(crate) fn lock(&self) -> io::Result<MutexGuard<'_, S>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "archive output lock poisoned"))
    }

    /// Recover the output once every other handle is gone.
    pub(crate) fn into_inner(self) -> Option<S> {
        Arc::try_unwrap(self.0).ok().and_then(|m| m.into_inner().ok())
    }
}

impl<S: Write> Write for SharedOut<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<S: Write + Send> Sink for SharedOut<S> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.flush()
    }
}

/// Counts bytes passing into `inner`.
pub(crate) struct CountingSink {
    inner:   BoxSink,
    counter: Arc<AtomicU64>,
}

impl CountingSink {
    pub(crate) fn new(inner: BoxSink, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Sink for CountingSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.inner.finish()
    }
}

/// In-memory holding area for a secondary raw stream; appended to the archive
/// after the block's pipeline finishes.
#[derive(Clone, Default)]
pub(crate) struct BufferSink(Arc<Mutex<Vec<u8>>>);

impl BufferSink {
    pub(crate) fn take(&self) -> io::Result<Vec<u8>> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "raw buffer lock poisoned"))?;
        Ok(std::mem::take(&mut *guard))
    }
}

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "raw buffer lock poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink for BufferSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

// ── Read side ────────────────────────────────────────────────────────────────

/// Yields exactly `remaining` bytes; an early end of `inner` is an error.
pub(crate) struct ExactReader<R> {
    inner:     R,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    pub(crate) fn new(inner: R, len: u64) -> Self {
        Self { inner, remaining: len }
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(ArchiveError::UnexpectedEof.into_io());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Checks a CRC-32 once the wrapped stream is exhausted.
pub struct ChecksumReader<R> {
    inner:    R,
    hasher:   crc32fast::Hasher,
    expected: Option<u32>,
    what:     &'static str,
    verified: bool,
}

impl<R: Read> ChecksumReader<R> {
    pub(crate) fn new(inner: R, expected: Option<u32>, what: &'static str) -> Self {
        Self { inner, hasher: crc32fast::Hasher::new(), expected, what, verified: false }
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
        } else if !buf.is_empty() && !self.verified {
            self.verified = true;
            if let Some(expected) = self.expected {
                let actual = self.hasher.clone().finalize();
                if actual != expected {
                    return Err(ArchiveError::ChecksumMismatch { what: self.what, expected, actual }.into_io());
                }
            }
        }
        Ok(n)
    }
}

/// Discard exactly `n` bytes.
pub(crate) fn skip_exact<R: Read + ?Sized>(r: &mut R, n: u64) -> io::Result<()> {
    if n == 0 {
        return Ok(());
    }
    let copied = io::copy(&mut r.take(n), &mut io::sink())?;
    if copied != n {
        return Err(ArchiveError::UnexpectedEof.into_io());
    }
    Ok(())
}
