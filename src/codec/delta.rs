use std::io::{self, Read, Write};
use std::sync::Arc;

use super::{BoxSink, BoxSource, Codec, CodecError, DecodeContext, Sink, ID_DELTA};

/// Byte-wise delta filter.  Option byte = distance − 1.
#[derive(Debug, Clone, Copy)]
pub struct DeltaCodec {
    distance: u16,
}

impl DeltaCodec {
    pub fn new(distance: u16) -> Self {
        Self { distance: distance.clamp(1, 256) }
    }
}

#[derive(Clone)]
struct History {
    ring:     [u8; 256],
    pos:      u8,
    distance: u8,
}

impl History {
    fn new(distance: u16) -> Self {
        // distance 256 wraps to 0, which addresses the slot about to be overwritten
        Self { ring: [0; 256], pos: 0, distance: distance as u8 }
    }

    #[inline]
    fn previous(&self) -> u8 {
        self.ring[usize::from(self.pos.wrapping_sub(self.distance))]
    }

    #[inline]
    fn push(&mut self, b: u8) {
        self.ring[usize::from(self.pos)] = b;
        self.pos = self.pos.wrapping_add(1);
    }
}

struct DeltaSink {
    history: History,
    scratch: Vec<u8>,
    inner:   BoxSink,
}

impl Write for DeltaSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        for &b in buf {
            self.scratch.push(b.wrapping_sub(self.history.previous()));
            self.history.push(b);
        }
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

impl Sink for DeltaSink {
    fn finish(self: Box<Self>) -> io::Result<()> { self.inner.finish() }
}

struct DeltaSource {
    history: History,
    inner:   BoxSource,
}

impl Read for DeltaSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        for b in &mut buf[..n] {
            *b = b.wrapping_add(self.history.previous());
            self.history.push(*b);
        }
        Ok(n)
    }
}

impl Codec for DeltaCodec {
    fn method_id(&self) -> &[u8] { ID_DELTA }
    fn name(&self) -> &str { "delta" }
    fn write_options(&self) -> Vec<u8> { vec![(self.distance - 1) as u8] }
    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        match options {
            [d] => {
                self.distance = u16::from(*d) + 1;
                Ok(())
            }
            _ => Err(CodecError::InvalidOptions { codec: "delta", reason: "expected 1 byte".into() }),
        }
    }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(*self) }

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> {
        Ok(Box::new(DeltaSink { history: History::new(self.distance), scratch: Vec::new(), inner: sink }))
    }

    fn decode(&self, source: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Ok(Box::new(DeltaSource { history: History::new(self.distance), inner: source }))
    }
}
