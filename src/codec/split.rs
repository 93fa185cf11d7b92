//! Four-stream x86 branch splitter.
//!
//! Relative `CALL` (E8) and `JMP` (E9) displacements are turned into absolute
//! addresses and moved out of the instruction stream, which makes the main
//! stream and the two address streams compress better independently.
//!
//! Uses (packed side), in slot order:
//!   0. main stream: every byte except converted displacements
//!   1. call addresses (LE u32, one per converted E8)
//!   2. jump addresses (LE u32, one per converted E9)
//!   3. decision bytes: one per E8/E9 opcode, 1 = converted, 0 = literal
//!
//! An opcode is converted whenever four more bytes follow it in the stream;
//! the decoder mirrors that choice from the decision stream.

use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use super::{BoxSink, BoxSource, Codec, CodecError, DecodeContext, Sink, ID_X86_SPLIT};

const STREAMS: usize = 4;

#[inline]
fn is_branch(b: u8) -> bool {
    b == 0xE8 || b == 0xE9
}

#[derive(Debug, Clone, Copy, Default)]
pub struct X86SplitCodec;

// ── Encoder ──────────────────────────────────────────────────────────────────

struct SplitSink {
    main:      BoxSink,
    call:      BoxSink,
    jump:      BoxSink,
    decisions: BoxSink,
    /// Opcode plus however much of its displacement has arrived.
    pending:   Vec<u8>,
    pos:       u32,
    out_main:  Vec<u8>,
    out_call:  Vec<u8>,
    out_jump:  Vec<u8>,
    out_dec:   Vec<u8>,
}

impl SplitSink {
    fn convert(&mut self, op: u8, rel: [u8; 4]) {
        let abs = u32::from_le_bytes(rel).wrapping_add(self.pos.wrapping_add(5));
        self.out_main.push(op);
        self.out_dec.push(1);
        let target = if op == 0xE8 { &mut self.out_call } else { &mut self.out_jump };
        target.extend_from_slice(&abs.to_le_bytes());
        self.pos = self.pos.wrapping_add(5);
    }

    fn literal(&mut self, b: u8) {
        self.out_main.push(b);
        if is_branch(b) {
            self.out_dec.push(0);
        }
        self.pos = self.pos.wrapping_add(1);
    }

    fn drain(&mut self) -> io::Result<()> {
        self.main.write_all(&self.out_main)?;
        self.call.write_all(&self.out_call)?;
        self.jump.write_all(&self.out_jump)?;
        self.decisions.write_all(&self.out_dec)?;
        self.out_main.clear();
        self.out_call.clear();
        self.out_jump.clear();
        self.out_dec.clear();
        Ok(())
    }
}

impl Write for SplitSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(buf);
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            if !is_branch(b) {
                self.literal(b);
                i += 1;
                continue;
            }
            if i + 5 > data.len() {
                break;
            }
            let rel = [data[i + 1], data[i + 2], data[i + 3], data[i + 4]];
            self.convert(b, rel);
            i += 5;
        }
        data.drain(..i);
        self.pending = data;
        self.drain()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl Sink for SplitSink {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        for b in std::mem::take(&mut self.pending) {
            self.literal(b);
        }
        self.drain()?;
        let this = *self;
        this.main.finish()?;
        this.call.finish()?;
        this.jump.finish()?;
        this.decisions.finish()
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

struct SplitSource {
    main:      BufReader<BoxSource>,
    call:      BufReader<BoxSource>,
    jump:      BufReader<BoxSource>,
    decisions: BufReader<BoxSource>,
    pos:       u32,
    remaining: u64,
    ready:     [u8; 5],
    ready_len: usize,
    ready_off: usize,
}

fn read_byte(r: &mut impl Read) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn short_stream(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("x86 split: {what} stream ended early"))
}

impl SplitSource {
    /// Decode the next instruction unit into `ready`.  Returns false at end.
    fn refill(&mut self) -> io::Result<bool> {
        let Some(op) = read_byte(&mut self.main)? else {
            return Ok(false);
        };
        self.ready[0] = op;
        self.ready_len = 1;
        self.ready_off = 0;
        if !is_branch(op) {
            self.pos = self.pos.wrapping_add(1);
            return Ok(true);
        }
        match read_byte(&mut self.decisions)? {
            Some(0) => self.pos = self.pos.wrapping_add(1),
            Some(_) => {
                let src = if op == 0xE8 { &mut self.call } else { &mut self.jump };
                let mut abs = [0u8; 4];
                src.read_exact(&mut abs)
                    .map_err(|_| short_stream(if op == 0xE8 { "call" } else { "jump" }))?;
                let rel = u32::from_le_bytes(abs).wrapping_sub(self.pos.wrapping_add(5));
                self.ready[1..5].copy_from_slice(&rel.to_le_bytes());
                self.ready_len = 5;
                self.pos = self.pos.wrapping_add(5);
            }
            None => return Err(short_stream("decision")),
        }
        Ok(true)
    }
}

impl Read for SplitSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() && self.remaining > 0 {
            if self.ready_off == self.ready_len && !self.refill()? {
                break;
            }
            let avail = (self.ready_len - self.ready_off).min(buf.len() - n);
            let avail = avail.min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            buf[n..n + avail].copy_from_slice(&self.ready[self.ready_off..self.ready_off + avail]);
            self.ready_off += avail;
            self.remaining -= avail as u64;
            n += avail;
        }
        Ok(n)
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

impl Codec for X86SplitCodec {
    fn method_id(&self) -> &[u8] { ID_X86_SPLIT }
    fn name(&self) -> &str { "x86split" }
    fn use_count(&self) -> usize { STREAMS }
    fn memory_usage_kb(&self) -> u64 { 64 }
    fn instantiate(&self) -> Arc<dyn Codec> { Arc::new(*self) }

    fn encode(&self, _: BoxSink) -> Result<BoxSink, CodecError> {
        Err(CodecError::Wiring("x86split needs four output sinks".into()))
    }

    fn decode(&self, _: BoxSource, _: u64, _: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        Err(CodecError::Wiring("x86split needs four input streams".into()))
    }

    fn complex_encode(&self, sinks: Vec<BoxSink>) -> Result<Vec<BoxSink>, CodecError> {
        let [main, call, jump, decisions]: [BoxSink; STREAMS] = sinks
            .try_into()
            .map_err(|v: Vec<BoxSink>| CodecError::Wiring(format!("x86split got {} sinks", v.len())))?;
        Ok(vec![Box::new(SplitSink {
            main,
            call,
            jump,
            decisions,
            pending:  Vec::with_capacity(5),
            pos:      0,
            out_main: Vec::new(),
            out_call: Vec::new(),
            out_jump: Vec::new(),
            out_dec:  Vec::new(),
        })])
    }

    fn complex_decode(
        &self,
        sources: Vec<BoxSource>,
        sizes:   &[u64],
        _:       &mut DecodeContext,
    ) -> Result<Vec<BoxSource>, CodecError> {
        let [main, call, jump, decisions]: [BoxSource; STREAMS] = sources
            .try_into()
            .map_err(|v: Vec<BoxSource>| CodecError::Wiring(format!("x86split got {} sources", v.len())))?;
        let &[remaining] = sizes else {
            return Err(CodecError::Wiring("x86split provides exactly one stream".into()));
        };
        Ok(vec![Box::new(SplitSource {
            main:      BufReader::new(main),
            call:      BufReader::new(call),
            jump:      BufReader::new(jump),
            decisions: BufReader::new(decisions),
            pos:       0,
            remaining,
            ready:     [0; 5],
            ready_len: 0,
            ready_off: 0,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryBudget;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    impl Sink for Shared {
        fn finish(self: Box<Self>) -> io::Result<()> { Ok(()) }
    }

    fn split(data: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        let outs: Vec<Shared> = (0..STREAMS).map(|_| Shared::default()).collect();
        let sinks = outs.iter().map(|s| Box::new(s.clone()) as BoxSink).collect();
        let mut enc = X86SplitCodec.complex_encode(sinks).unwrap().pop().unwrap();
        for piece in data.chunks(chunk) {
            enc.write_all(piece).unwrap();
        }
        enc.finish().unwrap();
        outs.iter().map(|s| s.0.lock().unwrap().clone()).collect()
    }

    fn join(streams: Vec<Vec<u8>>, len: u64) -> Vec<u8> {
        let sources = streams.into_iter().map(|s| Box::new(io::Cursor::new(s)) as BoxSource).collect();
        let mut ctx = DecodeContext::new(MemoryBudget::unlimited(), None);
        let mut dec = X86SplitCodec.complex_decode(sources, &[len], &mut ctx).unwrap().pop().unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn call_displacement_moves_to_call_stream() {
        let code = [0x90, 0xE8, 0x10, 0x00, 0x00, 0x00, 0xC3];
        let streams = split(&code, code.len());
        assert_eq!(streams[0], [0x90, 0xE8, 0xC3]);
        // absolute = rel + offset of next instruction (1 + 5)
        assert_eq!(streams[1], 0x16u32.to_le_bytes());
        assert!(streams[2].is_empty());
        assert_eq!(streams[3], [1]);
        assert_eq!(join(streams, code.len() as u64), code);
    }

    #[test]
    fn trailing_opcode_stays_literal() {
        let code = [0x01, 0xE9, 0x02, 0xE8];
        let streams = split(&code, 1);
        assert_eq!(streams[0], code);
        assert_eq!(streams[3], [0, 0]);
        assert_eq!(join(streams, 4), code);
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let code: Vec<u8> = (0..4096u32).map(|i| if i % 7 == 0 { 0xE8 } else { (i * 31) as u8 }).collect();
        assert_eq!(split(&code, 3), split(&code, 4096));
        assert_eq!(join(split(&code, 13), code.len() as u64), code);
    }
}
