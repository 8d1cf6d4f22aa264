// Compaction turns a sorted list of (key, frequency) records into a smaller
// sorted list by replacing dense subtrees of the key hierarchy with a single
// wildcard record carrying the subtree's total frequency:
//
//   com,example)/a/1 1
//   com,example)/a/2 1        com,example)/a/* 4
//   com,example)/a/3 1   =>   com,example)/b 1
//   com,example)/a/4 1
//   com,example)/b 1
//
// The input is streamed once. For each layer (host and path) we keep a
// "trail": the chain of prefixes the current record sits under, one slot per
// depth. Each open node remembers how many distinct children it has seen, the
// total frequency beneath it, and where in the output its subtree begins.
// When a record arrives that no longer shares a node's prefix, that subtree is
// finished; if some node in it has more children than the cutoff for its
// depth, everything written since that node opened is truncated away and
// replaced by one rollup line. Nothing beyond the trails is held in memory.

use std::{fmt, io::BufRead};

use log::{debug, info};
use serde::Serialize;

use crate::{
    aggregate::{Entry, RunLength},
    config::{Config, Cutoffs},
    fs::Sink,
    record::{parse_line, write_record, Line, RecordError},
    surt::{lossy, Layer, Surt},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub input_lines: u64,
    pub output_lines: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub rollups: u64,
    // Input lines that could not be used as records.
    pub skipped: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.input_lines, self.output_lines, self.input_bytes, self.output_bytes, self.rollups
        )
    }
}

#[derive(Debug, Clone)]
struct Node {
    key: Vec<u8>,
    // Distinct children seen so far.
    ccount: u64,
    // Total frequency of the subtree.
    mcount: u64,
    // Output offset and line index where the subtree starts.
    optr: u64,
    oline: u64,
}

#[derive(Debug)]
struct Trail {
    nodes: Vec<Option<Node>>,
}

impl Trail {
    fn new(max_depth: usize) -> Self {
        Trail {
            nodes: vec![None; max_depth],
        }
    }

    fn max_depth(&self) -> usize {
        self.nodes.len()
    }

    fn is_open(&self) -> bool {
        self.nodes.first().map_or(false, Option::is_some)
    }

    fn reset_from(&mut self, depth: usize) {
        for node in self.nodes.iter_mut().skip(depth) {
            *node = None;
        }
    }
}

#[derive(Debug)]
pub struct Compactor<S: Sink> {
    sink: S,
    cutoffs: Cutoffs,
    host: Trail,
    path: Trail,
    line: Vec<u8>,
    stats: Stats,
}

impl<S: Sink> Compactor<S> {
    pub fn new(sink: S, config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Compactor {
            sink,
            cutoffs: Cutoffs::new(config),
            host: Trail::new(config.host.max_depth),
            path: Trail::new(config.path.max_depth),
            line: Vec::with_capacity(1024),
            stats: Stats::default(),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn trail(&self, layer: Layer) -> &Trail {
        match layer {
            Layer::Host => &self.host,
            Layer::Path => &self.path,
        }
    }

    fn trail_mut(&mut self, layer: Layer) -> &mut Trail {
        match layer {
            Layer::Host => &mut self.host,
            Layer::Path => &mut self.path,
        }
    }

    pub fn skip(&mut self, err: RecordError) {
        debug!("skipping input line: {}", err);
        self.stats.skipped += 1;
    }

    /// Adds one record. Records must arrive in key order. The key is written
    /// back as given; only its canonical form places it in the trails.
    pub fn push(&mut self, key: &[u8], frequency: u64) -> anyhow::Result<()> {
        let surt = match Surt::parse(key) {
            Ok(surt) => surt,
            Err(err) => {
                self.skip(err);
                return Ok(());
            }
        };
        let hosts = surt.prefixes(Layer::Host, self.host.max_depth());
        let paths = surt.prefixes(Layer::Path, self.path.max_depth());

        // Everything the new record is not part of gets closed before any
        // node is opened, so new nodes start after the final rewritten bytes.
        if let Some(depth) = self.split_depth(Layer::Host, &hosts) {
            if self.close_subtree(Layer::Host, depth)? {
                // The path trail pointed into output that was just replaced.
                self.path.reset_from(0);
            }
            self.host.reset_from(depth);
        }
        if let Some(depth) = self.split_depth(Layer::Path, &paths) {
            self.close_subtree(Layer::Path, depth)?;
            self.path.reset_from(depth);
        }
        self.advance(Layer::Host, &hosts, frequency);
        self.advance(Layer::Path, &paths, frequency);

        self.line.clear();
        write_record(&mut self.line, key, frequency);
        self.emit()
    }

    /// Copies a metadata line to the output. Any open subtrees are closed
    /// first, so no later rollup can overwrite the line.
    pub fn push_meta(&mut self, line: &[u8]) -> anyhow::Result<()> {
        // Barrier: records before and after a metadata line are counted and
        // rolled up separately, even when they share a subtree.
        if self.host.is_open() || self.path.is_open() {
            self.flush()?;
        }
        self.line.clear();
        self.line.extend_from_slice(line);
        if !self.line.ends_with(b"\n") {
            self.line.push(b'\n');
        }
        self.emit()
    }

    fn emit(&mut self) -> anyhow::Result<()> {
        self.sink.append_line(&self.line)?;
        self.stats.output_lines += 1;
        Ok(())
    }

    /// The shallowest depth at which the open trail stops matching the new
    /// record's prefixes, either because the prefix differs or because the
    /// record does not reach that deep.
    fn split_depth(&self, layer: Layer, prefixes: &[&[u8]]) -> Option<usize> {
        for (depth, slot) in self.trail(layer).nodes.iter().enumerate() {
            let node = slot.as_ref()?;
            match prefixes.get(depth) {
                Some(prefix) if node.key.as_slice() == *prefix => {}
                _ => return Some(depth),
            }
        }
        None
    }

    /// Walks a layer's trail down the record's prefixes, accumulating into
    /// nodes that are already open and opening the rest.
    fn advance(&mut self, layer: Layer, prefixes: &[&[u8]], frequency: u64) {
        for (depth, prefix) in prefixes.iter().enumerate() {
            if let Some(node) = &mut self.trail_mut(layer).nodes[depth] {
                node.mcount += frequency;
                continue;
            }
            self.open(layer, depth, prefix, frequency);
        }
    }

    fn open(&mut self, layer: Layer, depth: usize, prefix: &[u8], frequency: u64) {
        let node = Node {
            key: prefix.to_vec(),
            ccount: 0,
            mcount: frequency,
            optr: self.sink.offset(),
            oline: self.stats.output_lines,
        };
        let trail = self.trail_mut(layer);
        trail.nodes[depth] = Some(node);
        if depth > 0 {
            if let Some(parent) = &mut trail.nodes[depth - 1] {
                parent.ccount += 1;
            }
        }
    }

    /// Finishes the subtree rooted at `depth`. The shallowest node at or
    /// below `depth` whose child count exceeds its cutoff is rolled up.
    fn close_subtree(&mut self, layer: Layer, depth: usize) -> anyhow::Result<bool> {
        let trail = self.trail(layer);
        let mut target = None;
        for i in depth..trail.max_depth() {
            let node = match &trail.nodes[i] {
                Some(node) => node,
                None => break,
            };
            if i < layer.min_rollup_depth() {
                continue;
            }
            if self.cutoffs.exceeds(layer, i, node.ccount) {
                target = Some(i);
                break;
            }
        }

        let node = match target.and_then(|i| self.trail(layer).nodes[i].clone()) {
            Some(node) => node,
            None => return Ok(false),
        };
        self.rollup(layer, node)?;
        Ok(true)
    }

    fn rollup(&mut self, layer: Layer, node: Node) -> anyhow::Result<()> {
        let mut key = node.key;
        key.push(layer.separator());
        key.push(b'*');
        debug!(
            "rolling up {} {} children into {} (freq {}, line {})",
            layer,
            node.ccount,
            lossy(&key),
            node.mcount,
            node.oline
        );

        self.sink.seek(node.optr)?;
        self.sink.truncate()?;
        self.line.clear();
        write_record(&mut self.line, &key, node.mcount);
        self.sink.append_line(&self.line)?;

        self.stats.output_lines = node.oline + 1;
        self.stats.rollups += 1;
        Ok(())
    }

    // Closes everything still open. Host subtrees take precedence: if one was
    // rolled up, the path subtrees it covered are gone already.
    fn flush(&mut self) -> anyhow::Result<()> {
        if !self.close_subtree(Layer::Host, 0)? {
            self.close_subtree(Layer::Path, 0)?;
        }
        self.host.reset_from(0);
        self.path.reset_from(0);
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<Stats> {
        self.flush()?;
        // Rollups can leave stale bytes past the real end.
        self.sink.truncate()?;
        self.sink.sync()?;
        self.stats.output_bytes = self.sink.offset();
        info!(
            "compacted {} lines into {} ({} rollups, {} skipped)",
            self.stats.input_lines, self.stats.output_lines, self.stats.rollups, self.stats.skipped
        );
        Ok(self.stats)
    }
}

/// Compacts a sorted summary (`<key> <frequency>` per line) into `sink`.
pub fn compact<R, S>(mut input: R, sink: S, config: &Config) -> anyhow::Result<Stats>
where
    R: BufRead,
    S: Sink,
{
    let mut compactor = Compactor::new(sink, config)?;
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        let n = input.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        compactor.stats.input_lines += 1;
        compactor.stats.input_bytes += n as u64;
        match parse_line(&buf) {
            Ok(Line::Meta(_)) => compactor.push_meta(&buf)?,
            Ok(Line::Record(record)) => compactor.push(record.key, record.frequency)?,
            Err(err) => compactor.skip(err),
        }
    }
    compactor.finish()
}

/// Builds a summary from sorted raw captures (CDX/CDXJ lines or bare SURTs),
/// counting repeated keys before compacting.
pub fn generate<R, S>(input: R, sink: S, config: &Config) -> anyhow::Result<Stats>
where
    R: BufRead,
    S: Sink,
{
    let mut compactor = Compactor::new(sink, config)?;
    let mut runs = RunLength::new(input);
    for entry in runs.by_ref() {
        match entry? {
            Entry::Record { key, frequency } => compactor.push(&key, frequency)?,
            Entry::Meta(meta) => compactor.push_meta(&meta)?,
        }
    }
    compactor.stats.input_lines = runs.lines_read;
    compactor.stats.input_bytes = runs.bytes_read;
    compactor.stats.skipped += runs.skipped;
    compactor.finish()
}

#[cfg(test)]
mod test;
