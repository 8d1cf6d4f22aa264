// A summary is searched by trying progressively coarser keys for a query,
// most specific first, and binary searching the sorted file for each:
//
//   com,example)/a/b      the URI itself
//   com,example)/a/b/*    everything under it
//   com,example)/a/*      its parent's subtree
//   com,example)/*        the whole host
//   com,example,*         the domain and its subdomains
//   com,*
//
// Summaries keep keys as they were read, so a query that is not in canonical
// form (a query string, a trailing slash) is first looked for verbatim.
//
// The file is never loaded; each probe seeks to a byte offset and reads one
// line, so lines may have any length.

use std::{
    cmp::Ordering,
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::Context;
use log::debug;

use crate::{
    record::{first_field, parse_line, Line},
    surt::{canonical, lossy},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub key: Vec<u8>,
    pub frequency: u64,
    /// How many segments had to be stripped from the query before a key
    /// matched. Zero means the query itself, or its own subtree, is listed.
    pub distance: usize,
}

impl Hit {
    pub fn write_line<W: Write>(&self, w: &mut W, query: &[u8]) -> io::Result<()> {
        w.write_all(&self.key)?;
        write!(w, " {} {} ", self.frequency, self.distance)?;
        w.write_all(query)?;
        w.write_all(b"\n")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub queries: u64,
    pub hits: u64,
}

fn wildcard(prefix: &[u8], sep: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 2);
    key.extend_from_slice(prefix);
    key.push(sep);
    key.push(b'*');
    key
}

/// The keys that could answer `query`, most specific first.
pub fn candidates(query: &[u8]) -> Vec<Vec<u8>> {
    let key = canonical(query);
    let mut out = vec![key.to_vec(), wildcard(key, b'/')];
    let mut rest = key;
    while rest.contains(&b',') {
        if let [host @ .., b')'] = rest {
            out.push(wildcard(host, b','));
            rest = host;
            continue;
        }
        let idx = match rest.iter().rposition(|b| *b == b',' || *b == b'/') {
            Some(idx) => idx,
            None => break,
        };
        out.push(wildcard(&rest[..idx], rest[idx]));
        rest = &rest[..idx];
    }
    out
}

#[derive(Debug)]
struct Probe {
    // The target compared to the record that was read.
    ord: Ordering,
    frequency: u64,
    end: u64,
}

/// A sorted summary file opened for lookups.
#[derive(Debug)]
pub struct Summary<R: Read + Seek> {
    r: BufReader<R>,
    len: u64,
    buf: Vec<u8>,
}

impl Summary<File> {
    pub fn open<P>(fname: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = File::open(fname.as_ref())
            .with_context(|| format!("opening {}", fname.as_ref().display()))?;
        Summary::new(file)
    }
}

impl<R: Read + Seek> Summary<R> {
    pub fn new(mut inner: R) -> anyhow::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        Ok(Summary {
            r: BufReader::new(inner),
            len,
            buf: Vec::with_capacity(1024),
        })
    }

    fn read_line_at(&mut self, start: u64) -> anyhow::Result<u64> {
        self.r.seek(SeekFrom::Start(start))?;
        self.buf.clear();
        let n = self.r.read_until(b'\n', &mut self.buf)?;
        Ok(start + n as u64)
    }

    // The first line boundary at or after `offset`.
    fn line_start(&mut self, offset: u64) -> anyhow::Result<u64> {
        if offset == 0 {
            return Ok(0);
        }
        self.read_line_at(offset - 1)
    }

    /// Compares `key` against the first record starting in `[start, hi)`.
    /// Metadata and unparseable lines are stepped over.
    fn probe(&mut self, key: &[u8], mut start: u64, hi: u64) -> anyhow::Result<Option<Probe>> {
        while start < hi {
            let end = self.read_line_at(start)?;
            if end == start {
                break;
            }
            if let Ok(Line::Record(record)) = parse_line(&self.buf) {
                return Ok(Some(Probe {
                    ord: key.cmp(record.key),
                    frequency: record.frequency,
                    end,
                }));
            }
            start = end;
        }
        Ok(None)
    }

    /// Returns the frequency recorded for exactly `key`, if any.
    pub fn find(&mut self, key: &[u8]) -> anyhow::Result<Option<u64>> {
        let mut hi = self.len;
        let mut lo = match self.probe(key, 0, hi)? {
            None => return Ok(None),
            Some(p) => match p.ord {
                Ordering::Equal => return Ok(Some(p.frequency)),
                Ordering::Less => return Ok(None),
                Ordering::Greater => p.end,
            },
        };

        // Invariant: any line holding `key` starts in [lo, hi).
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let start = self.line_start(mid)?;
            match self.probe(key, start, hi)? {
                None => hi = mid,
                Some(p) => match p.ord {
                    Ordering::Equal => return Ok(Some(p.frequency)),
                    Ordering::Less => hi = mid,
                    Ordering::Greater => lo = p.end,
                },
            }
        }
        Ok(None)
    }

    /// Finds the most specific record covering `query`. A miss is `Ok(None)`.
    pub fn lookup(&mut self, query: &[u8]) -> anyhow::Result<Option<Hit>> {
        let candidates = candidates(query);
        if candidates[0] != query {
            if let Some(frequency) = self.find(query)? {
                return Ok(Some(Hit {
                    key: query.to_vec(),
                    frequency,
                    distance: 0,
                }));
            }
        }
        for (i, key) in candidates.into_iter().enumerate() {
            if let Some(frequency) = self.find(&key)? {
                return Ok(Some(Hit {
                    key,
                    frequency,
                    distance: i.saturating_sub(1),
                }));
            }
        }
        Ok(None)
    }

    /// Looks up one query per line of `queries`, writing a line to `out` for
    /// every hit.
    pub fn batch_lookup<B, W>(&mut self, mut queries: B, mut out: W) -> anyhow::Result<BatchStats>
    where
        B: BufRead,
        W: Write,
    {
        let mut stats = BatchStats::default();
        let mut line = Vec::with_capacity(1024);
        loop {
            line.clear();
            if queries.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let (query, _) = first_field(&line);
            if query.is_empty() {
                continue;
            }
            stats.queries += 1;
            match self.lookup(query)? {
                Some(hit) => {
                    stats.hits += 1;
                    hit.write_line(&mut out, query)?;
                }
                None => debug!("no match for {}", lossy(query)),
            }
        }
        out.flush()?;
        Ok(stats)
    }
}
