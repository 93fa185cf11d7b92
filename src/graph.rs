//! Coder graph: a DAG of codec units joined by pipes.
//!
//! Every node wraps one [`Codec`].  Each of its input slots ("use" streams,
//! the packed side) is fed by exactly one [`PipeSource`]: a raw packed
//! sub-stream of the block, or a numbered output of another node.  Exactly
//! one output in the whole graph is left unconnected; it carries the block's
//! decoded bytes and its owner is the *root* node.
//!
//! Streams are numbered the 7z way: in-streams and out-streams are counted
//! globally across nodes in node order, and the on-disk description (a 7z
//! "folder") binds in-streams to out-streams by those numbers.
//!
//! Decoding walks from the root toward the raw streams, building each
//! producer once and memoizing its outputs; encoding walks the same way and
//! wraps every produced sink in a byte counter so the block's size table is
//! known as soon as the pipeline finishes.

use std::sync::Arc;

use crate::block::BlockCounters;
use crate::codec::{
    codec_from_disk, BoxSink, BoxSource, Codec, CodecError, DecodeContext, X86SplitCodec,
};
use crate::error::{ArchiveError, Result};
use crate::header::bytes::{ByteReader, ByteSink};
use crate::io_stream::adapters::CountingSink;

pub type NodeId = usize;

const MAX_CODERS:      usize = 64;
const MAX_STREAMS:     usize = 32;
const MAX_OPTIONS_LEN: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeSource {
    /// Raw packed sub-stream of the block.
    RawInput(u32),
    /// Output 0 of another node.
    NodeOutput(NodeId),
    /// A numbered output of a multi-output node.
    NodeOutputIndexed(NodeId, u32),
}

impl PipeSource {
    fn producer(self) -> Option<(NodeId, usize)> {
        match self {
            PipeSource::RawInput(_)                => None,
            PipeSource::NodeOutput(p)              => Some((p, 0)),
            PipeSource::NodeOutputIndexed(p, k)    => Some((p, k as usize)),
        }
    }

    fn from_output(node: NodeId, k: usize) -> Self {
        if k == 0 {
            PipeSource::NodeOutput(node)
        } else {
            PipeSource::NodeOutputIndexed(node, k as u32)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoderNode {
    pub codec:  Arc<dyn Codec>,
    pub inputs: Vec<Option<PipeSource>>,
}

impl CoderNode {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        let inputs = vec![None; codec.use_count()];
        Self { codec, inputs }
    }
}

fn malformed(msg: impl Into<String>) -> ArchiveError {
    ArchiveError::MalformedGraph(msg.into())
}

#[derive(Debug, Clone)]
pub struct CoderGraph {
    nodes:       Vec<CoderNode>,
    root:        NodeId,
    root_output: usize,
    raw_count:   usize,
    out_base:    Vec<usize>,
    in_base:     Vec<usize>,
}

impl CoderGraph {
    // ── Construction ─────────────────────────────────────────────────────────

    /// Single-input/single-output chain.  `codecs` is in data-flow order: the
    /// first codec sees the plain bytes, the last one writes the packed stream.
    pub fn linear(codecs: Vec<Arc<dyn Codec>>) -> Result<Self> {
        if codecs.is_empty() {
            return Err(malformed("empty codec chain"));
        }
        let n = codecs.len();
        let mut builder = GraphBuilder::new();
        for codec in codecs {
            if codec.is_complex() {
                return Err(malformed(format!("{} cannot be part of a linear chain", codec.name())));
            }
            builder.add(codec);
        }
        for i in 0..n - 1 {
            builder.connect(i, 0, PipeSource::NodeOutput(i + 1));
        }
        builder.connect(n - 1, 0, PipeSource::RawInput(0));
        builder.build()
    }

    /// x86 branch split feeding three compressors: the main stream through
    /// `main`, call and jump addresses each through an instance of `side`;
    /// the decision stream is stored raw.
    pub fn branch_split(main: Arc<dyn Codec>, side: Arc<dyn Codec>) -> Result<Self> {
        let mut b = GraphBuilder::new();
        let split = b.add(Arc::new(X86SplitCodec));
        let main = b.add(main);
        let call = b.add(side.instantiate());
        let jump = b.add(side);
        b.connect(split, 0, PipeSource::NodeOutput(main))
            .connect(split, 1, PipeSource::NodeOutput(call))
            .connect(split, 2, PipeSource::NodeOutput(jump))
            .connect(split, 3, PipeSource::RawInput(3))
            .connect(main, 0, PipeSource::RawInput(0))
            .connect(call, 0, PipeSource::RawInput(1))
            .connect(jump, 0, PipeSource::RawInput(2));
        b.build()
    }

    /// Assemble from parsed nodes.  `strict` runs full validation; otherwise
    /// only what is needed to locate the root is checked.
    pub fn from_nodes(nodes: Vec<CoderNode>, strict: bool) -> Result<Self> {
        if nodes.is_empty() {
            return Err(malformed("graph has no nodes"));
        }
        let mut out_base = Vec::with_capacity(nodes.len());
        let mut in_base = Vec::with_capacity(nodes.len());
        let (mut outs, mut ins) = (0, 0);
        for node in &nodes {
            out_base.push(outs);
            in_base.push(ins);
            outs += node.codec.provide_count();
            ins += node.inputs.len();
        }
        let mut bound = vec![false; outs];
        let mut raw_count = 0;
        for src in nodes.iter().flat_map(|n| n.inputs.iter().flatten()) {
            match src.producer() {
                Some((p, k)) => {
                    if p < nodes.len() && k < nodes[p].codec.provide_count() {
                        bound[out_base[p] + k] = true;
                    }
                }
                None => raw_count += 1,
            }
        }
        let unbound: Vec<usize> = (0..outs).filter(|&g| !bound[g]).collect();
        let Some(&root_global) = unbound.first() else {
            return Err(malformed("every output is consumed; the graph has no root"));
        };
        if strict && unbound.len() > 1 {
            return Err(malformed(format!("{} unconnected outputs; exactly one is allowed", unbound.len())));
        }
        let root = out_base.iter().rposition(|&b| b <= root_global).unwrap_or(0);
        let graph = Self {
            root,
            root_output: root_global - out_base[root],
            raw_count,
            out_base,
            in_base,
            nodes,
        };
        if strict {
            graph.validate()?;
        }
        Ok(graph)
    }

    /// Check the topology: every slot filled exactly once, every output used
    /// at most once, raw indices `0..n` each used once, no cycles.
    pub fn validate(&self) -> Result<()> {
        let mut out_used = vec![false; self.output_count()];
        let mut raw_used = vec![false; self.raw_count];
        for (id, node) in self.nodes.iter().enumerate() {
            if node.inputs.len() != node.codec.use_count() {
                return Err(malformed(format!("node {id} has {} slots for {} inputs", node.inputs.len(), node.codec.use_count())));
            }
            for (slot, src) in node.inputs.iter().enumerate() {
                let src = src.ok_or_else(|| malformed(format!("node {id} input {slot} is not connected")))?;
                let (p, k) = match src {
                    PipeSource::RawInput(i) => {
                        let used = raw_used
                            .get_mut(i as usize)
                            .ok_or_else(|| malformed(format!("raw stream {i} out of range")))?;
                        if std::mem::replace(used, true) {
                            return Err(malformed(format!("raw stream {i} feeds more than one input")));
                        }
                        continue;
                    }
                    PipeSource::NodeOutput(p)           => (p, 0),
                    PipeSource::NodeOutputIndexed(p, k) => (p, k as usize),
                };
                if p >= self.nodes.len() || k >= self.nodes[p].codec.provide_count() {
                    return Err(malformed(format!("node {id} input {slot} refers to missing output {p}:{k}")));
                }
                let g = self.out_base[p] + k;
                if std::mem::replace(&mut out_used[g], true) {
                    return Err(malformed(format!("output {p}:{k} feeds more than one input")));
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark { Fresh, Active, Done }
        let mut marks = vec![Mark::Fresh; self.nodes.len()];
        // iterative DFS over producer edges
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Fresh {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            marks[start] = Mark::Active;
            while let Some(top) = stack.last_mut() {
                let (node, slot) = *top;
                top.1 += 1;
                let next = self.nodes[node].inputs.get(slot).copied();
                match next {
                    None => {
                        marks[node] = Mark::Done;
                        stack.pop();
                    }
                    Some(src) => {
                        let Some((p, _)) = src.and_then(PipeSource::producer) else { continue };
                        match marks[p] {
                            Mark::Active => return Err(malformed(format!("cycle through node {p}"))),
                            Mark::Fresh => {
                                marks[p] = Mark::Active;
                                stack.push((p, 0));
                            }
                            Mark::Done => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn nodes(&self) -> &[CoderNode] { &self.nodes }
    pub fn root(&self) -> NodeId { self.root }
    pub fn raw_count(&self) -> usize { self.raw_count }

    pub fn output_count(&self) -> usize {
        self.nodes.iter().map(|n| n.codec.provide_count()).sum()
    }

    pub fn input_count(&self) -> usize {
        self.nodes.iter().map(|n| n.inputs.len()).sum()
    }

    pub fn global_output(&self, node: NodeId, k: usize) -> usize {
        self.out_base[node] + k
    }

    pub fn root_global_output(&self) -> usize {
        self.global_output(self.root, self.root_output)
    }

    /// Position of an output in the block's non-root size table.
    pub fn output_slot(&self, node: NodeId, k: usize) -> Option<usize> {
        let g = self.global_output(node, k);
        let root = self.root_global_output();
        match g.cmp(&root) {
            std::cmp::Ordering::Less    => Some(g),
            std::cmp::Ordering::Equal   => None,
            std::cmp::Ordering::Greater => Some(g - 1),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.nodes.iter().all(|n| n.codec.is_identity())
    }

    pub fn contains(&self, method_id: &[u8]) -> bool {
        self.nodes.iter().any(|n| n.codec.method_id() == method_id)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.codec.name().to_owned()).collect()
    }

    /// Same topology with fresh codec instances, for a new block.
    pub fn instantiate(&self) -> Self {
        let mut fresh = self.clone();
        for node in &mut fresh.nodes {
            node.codec = node.codec.instantiate();
        }
        fresh
    }

    // ── Decode ───────────────────────────────────────────────────────────────

    /// Compose the decode pipeline.  `raw` holds the block's packed
    /// sub-streams in order; `out_sizes` the non-root output sizes.
    pub fn decode(
        &self,
        raw:       Vec<BoxSource>,
        out_sizes: &[u64],
        u_size:    u64,
        ctx:       &mut DecodeContext,
    ) -> Result<BoxSource> {
        if raw.len() != self.raw_count {
            return Err(malformed(format!("{} raw streams for {} raw inputs", raw.len(), self.raw_count)));
        }
        if out_sizes.len() + 1 != self.output_count() {
            return Err(malformed(format!("{} sizes for {} outputs", out_sizes.len() + 1, self.output_count())));
        }
        let mut walk = DecodeWalk {
            graph:    self,
            raw:      raw.into_iter().map(Some).collect(),
            outputs:  (0..self.nodes.len()).map(|_| None).collect(),
            visiting: vec![false; self.nodes.len()],
            out_sizes,
            u_size,
        };
        walk.resolve(self.root, ctx)?;
        walk.take_output(self.root, self.root_output)
    }

    // ── Encode ───────────────────────────────────────────────────────────────

    /// Compose the encode pipeline over the block's raw sinks; returns the
    /// sink that plain data is written into.
    pub fn encode(&self, raw: Vec<BoxSink>, counters: &BlockCounters) -> Result<BoxSink> {
        if raw.len() != self.raw_count {
            return Err(malformed(format!("{} raw sinks for {} raw inputs", raw.len(), self.raw_count)));
        }
        let mut walk = EncodeWalk {
            graph:    self,
            raw:      raw.into_iter().map(Some).collect(),
            provides: (0..self.nodes.len()).map(|_| None).collect(),
            visiting: vec![false; self.nodes.len()],
            counters,
        };
        walk.resolve(self.root)?;
        walk.take_provide(self.root, self.root_output)
    }

    // ── Folder (de)serialization ─────────────────────────────────────────────

    pub fn write_folder(&self, out: &mut Vec<u8>) {
        out.put_number(self.nodes.len() as u64);
        for node in &self.nodes {
            let id = node.codec.method_id();
            let options = node.codec.write_options();
            let complex = node.codec.is_complex();
            let mut flags = (id.len() & 0x0F) as u8;
            if complex {
                flags |= 0x10;
            }
            if !options.is_empty() {
                flags |= 0x20;
            }
            out.push(flags);
            out.extend_from_slice(id);
            if complex {
                out.put_number(node.inputs.len() as u64);
                out.put_number(node.codec.provide_count() as u64);
            }
            if !options.is_empty() {
                out.put_number(options.len() as u64);
                out.extend_from_slice(&options);
            }
        }
        for (id, node) in self.nodes.iter().enumerate() {
            for (slot, src) in node.inputs.iter().enumerate() {
                if let Some((p, k)) = src.and_then(PipeSource::producer) {
                    out.put_number((self.in_base[id] + slot) as u64);
                    out.put_number(self.global_output(p, k) as u64);
                }
            }
        }
        if self.raw_count > 1 {
            for raw in 0..self.raw_count {
                if let Some(g) = self.raw_in_stream(raw as u32) {
                    out.put_number(g as u64);
                }
            }
        }
    }

    fn raw_in_stream(&self, raw: u32) -> Option<usize> {
        self.nodes.iter().enumerate().find_map(|(id, node)| {
            node.inputs
                .iter()
                .position(|s| *s == Some(PipeSource::RawInput(raw)))
                .map(|slot| self.in_base[id] + slot)
        })
    }

    pub fn read_folder(r: &mut ByteReader<'_>, strict: bool) -> Result<Self> {
        let count = r.read_count(MAX_CODERS)?;
        if count == 0 {
            return Err(malformed("folder without coders"));
        }
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let flags = r.read_u8()?;
            if flags & 0x80 != 0 {
                return Err(ArchiveError::UnsupportedCodec { id: "alternative coder methods".into() });
            }
            let id = r.take(usize::from(flags & 0x0F))?;
            let (uses, provides) = if flags & 0x10 != 0 {
                (r.read_count(MAX_STREAMS)?, r.read_count(MAX_STREAMS)?)
            } else {
                (1, 1)
            };
            if uses == 0 || provides == 0 {
                return Err(malformed("coder without streams"));
            }
            let options = if flags & 0x20 != 0 {
                let len = r.read_count(MAX_OPTIONS_LEN)?;
                r.take(len)?
            } else {
                &[]
            };
            let codec = codec_from_disk(id, uses, provides, options).map_err(|e| match e {
                CodecError::Wiring(msg) => malformed(msg),
                other => ArchiveError::from(other),
            })?;
            nodes.push(CoderNode::new(codec));
        }

        let mut in_owner = Vec::new();
        let mut out_owner = Vec::new();
        for (id, node) in nodes.iter().enumerate() {
            in_owner.extend((0..node.inputs.len()).map(|slot| (id, slot)));
            out_owner.extend((0..node.codec.provide_count()).map(|k| (id, k)));
        }
        let bind_pairs = out_owner.len() - 1;
        let mut out_bound = vec![false; out_owner.len()];
        for _ in 0..bind_pairs {
            let in_idx = r.read_count(usize::MAX)?;
            let out_idx = r.read_count(usize::MAX)?;
            let &(node, slot) = in_owner.get(in_idx).ok_or_else(|| malformed(format!("in-stream {in_idx} out of range")))?;
            let &(p, k) = out_owner.get(out_idx).ok_or_else(|| malformed(format!("out-stream {out_idx} out of range")))?;
            if std::mem::replace(&mut out_bound[out_idx], true) {
                return Err(malformed(format!("out-stream {out_idx} bound twice")));
            }
            let target = &mut nodes[node].inputs[slot];
            if target.is_some() {
                return Err(malformed(format!("in-stream {in_idx} bound twice")));
            }
            *target = Some(PipeSource::from_output(p, k));
        }

        let packed = in_owner
            .len()
            .checked_sub(bind_pairs)
            .filter(|&n| n > 0)
            .ok_or_else(|| malformed("no packed streams"))?;
        if packed == 1 {
            let &(node, slot) = in_owner
                .iter()
                .find(|&&(n, s)| nodes[n].inputs[s].is_none())
                .ok_or_else(|| malformed("no unbound in-stream for the packed stream"))?;
            nodes[node].inputs[slot] = Some(PipeSource::RawInput(0));
        } else {
            for raw in 0..packed {
                let in_idx = r.read_count(usize::MAX)?;
                let &(node, slot) = in_owner.get(in_idx).ok_or_else(|| malformed(format!("in-stream {in_idx} out of range")))?;
                let target = &mut nodes[node].inputs[slot];
                if target.is_some() {
                    return Err(malformed(format!("packed stream {raw} targets a bound in-stream")));
                }
                *target = Some(PipeSource::RawInput(raw as u32));
            }
        }
        Self::from_nodes(nodes, strict)
    }
}

// ── Walks ────────────────────────────────────────────────────────────────────

struct DecodeWalk<'g> {
    graph:     &'g CoderGraph,
    raw:       Vec<Option<BoxSource>>,
    outputs:   Vec<Option<Vec<Option<BoxSource>>>>,
    visiting:  Vec<bool>,
    out_sizes: &'g [u64],
    u_size:    u64,
}

impl DecodeWalk<'_> {
    fn size_of(&self, node: NodeId, k: usize) -> Result<u64> {
        match self.graph.output_slot(node, k) {
            None => Ok(self.u_size),
            Some(slot) => self.out_sizes.get(slot).copied().ok_or_else(|| malformed("size table too short")),
        }
    }

    fn take_output(&mut self, node: NodeId, k: usize) -> Result<BoxSource> {
        self.outputs[node]
            .as_mut()
            .and_then(|outs| outs.get_mut(k))
            .and_then(Option::take)
            .ok_or_else(|| malformed(format!("output {node}:{k} consumed twice or missing")))
    }

    fn resolve(&mut self, node: NodeId, ctx: &mut DecodeContext) -> Result<()> {
        if self.outputs[node].is_some() {
            return Ok(());
        }
        if std::mem::replace(&mut self.visiting[node], true) {
            return Err(malformed(format!("cycle through node {node}")));
        }
        let graph = self.graph;
        let coder = &graph.nodes[node];
        let mut inputs = Vec::with_capacity(coder.inputs.len());
        for (slot, src) in coder.inputs.iter().enumerate() {
            let src = src.ok_or_else(|| malformed(format!("node {node} input {slot} is not connected")))?;
            let stream = match src {
                PipeSource::RawInput(i) => self
                    .raw
                    .get_mut(i as usize)
                    .and_then(Option::take)
                    .ok_or_else(|| malformed(format!("raw stream {i} missing or reused")))?,
                PipeSource::NodeOutput(p) | PipeSource::NodeOutputIndexed(p, _) => {
                    if p >= graph.nodes.len() {
                        return Err(malformed(format!("node {p} does not exist")));
                    }
                    let k = match src {
                        PipeSource::NodeOutputIndexed(_, k) => k as usize,
                        _ => 0,
                    };
                    self.resolve(p, ctx)?;
                    self.take_output(p, k)?
                }
            };
            inputs.push(stream);
        }
        ctx.budget.charge(coder.codec.memory_usage_kb())?;
        let provides = coder.codec.provide_count();
        let sizes = (0..provides).map(|k| self.size_of(node, k)).collect::<Result<Vec<_>>>()?;
        let outs = coder.codec.complex_decode(inputs, &sizes, ctx)?;
        if outs.len() != provides {
            return Err(malformed(format!("{} produced {} outputs, expected {provides}", coder.codec.name(), outs.len())));
        }
        self.outputs[node] = Some(outs.into_iter().map(Some).collect());
        self.visiting[node] = false;
        Ok(())
    }
}

struct EncodeWalk<'g> {
    graph:    &'g CoderGraph,
    raw:      Vec<Option<BoxSink>>,
    provides: Vec<Option<Vec<Option<BoxSink>>>>,
    visiting: Vec<bool>,
    counters: &'g BlockCounters,
}

impl EncodeWalk<'_> {
    fn take_provide(&mut self, node: NodeId, k: usize) -> Result<BoxSink> {
        self.provides[node]
            .as_mut()
            .and_then(|p| p.get_mut(k))
            .and_then(Option::take)
            .ok_or_else(|| malformed(format!("output {node}:{k} consumed twice or missing")))
    }

    fn resolve(&mut self, node: NodeId) -> Result<()> {
        if self.provides[node].is_some() {
            return Ok(());
        }
        if std::mem::replace(&mut self.visiting[node], true) {
            return Err(malformed(format!("cycle through node {node}")));
        }
        let graph = self.graph;
        let coder = &graph.nodes[node];
        let mut uses = Vec::with_capacity(coder.inputs.len());
        for (slot, src) in coder.inputs.iter().enumerate() {
            let src = src.ok_or_else(|| malformed(format!("node {node} input {slot} is not connected")))?;
            let (p, k) = match src {
                PipeSource::RawInput(i) => {
                    let sink = self
                        .raw
                        .get_mut(i as usize)
                        .and_then(Option::take)
                        .ok_or_else(|| malformed(format!("raw sink {i} missing or reused")))?;
                    uses.push(sink);
                    continue;
                }
                PipeSource::NodeOutput(p)           => (p, 0),
                PipeSource::NodeOutputIndexed(p, k) => (p, k as usize),
            };
            if p >= graph.nodes.len() {
                return Err(malformed(format!("node {p} does not exist")));
            }
            self.resolve(p)?;
            let sink = self.take_provide(p, k)?;
            uses.push(sink);
        }
        let sinks = coder.codec.complex_encode(uses)?;
        if sinks.len() != coder.codec.provide_count() {
            return Err(malformed(format!("{} produced {} sinks", coder.codec.name(), sinks.len())));
        }
        let counted = sinks
            .into_iter()
            .enumerate()
            .map(|(k, sink)| {
                let counter = self.counters.output(graph.global_output(node, k));
                Some(Box::new(CountingSink::new(sink, counter)) as BoxSink)
            })
            .collect();
        self.provides[node] = Some(counted);
        self.visiting[node] = false;
        Ok(())
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<CoderNode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, codec: Arc<dyn Codec>) -> NodeId {
        self.nodes.push(CoderNode::new(codec));
        self.nodes.len() - 1
    }

    /// Feed input `slot` of `consumer` from `source`.  Out-of-range slots are
    /// reported by [`GraphBuilder::build`].
    pub fn connect(&mut self, consumer: NodeId, slot: usize, source: PipeSource) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(consumer) {
            if slot >= node.inputs.len() {
                node.inputs.resize(slot + 1, None);
            }
            node.inputs[slot] = Some(source);
        }
        self
    }

    pub fn build(&mut self) -> Result<CoderGraph> {
        CoderGraph::from_nodes(std::mem::take(&mut self.nodes), true)
    }
}
