// SURT keys are URIs rewritten so that related resources sort next to each
// other: the host labels are reversed and comma separated, and the path
// follows a closing paren.
//
//   http://www.example.com/a/b?x=1  =>  com,example,www)/a/b?x=1
//
// A key is looked at through two independent layers. The host layer walks the
// domain labels ("com", "com,example", "com,example,www"). The path layer
// walks the whole key split on slashes, so its root is the full host
// ("com,example,www)", "com,example,www)/a", ...).

use std::fmt;

use crate::record::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Host,
    Path,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::Host, Layer::Path];

    pub fn separator(self) -> u8 {
        match self {
            Layer::Host => b',',
            Layer::Path => b'/',
        }
    }

    // The root domain label is never collapsed.
    pub fn min_rollup_depth(self) -> usize {
        match self {
            Layer::Host => 1,
            Layer::Path => 0,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Host => write!(f, "host"),
            Layer::Path => write!(f, "path"),
        }
    }
}

fn is_separator(b: &u8) -> bool {
    *b == b',' || *b == b'/'
}

fn trim_separators(mut key: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = key {
        if !is_separator(first) {
            break;
        }
        key = rest;
    }
    while let [rest @ .., last] = key {
        if !is_separator(last) {
            break;
        }
        key = rest;
    }
    key
}

/// Strips the query string and any leading or trailing separators.
pub fn canonical(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|b| *b == b'?').unwrap_or(raw.len());
    trim_separators(&raw[..end])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surt<'a> {
    key: &'a [u8],
    host: &'a [u8],
}

impl<'a> Surt<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, RecordError> {
        let key = canonical(raw);
        let host = match key.iter().position(|b| *b == b')') {
            Some(idx) => trim_separators(&key[..idx]),
            // Host rollups have no path part at all.
            None if key.ends_with(b",*") => key,
            None => return Err(RecordError::InvalidKey(lossy(raw))),
        };
        if host.is_empty() {
            return Err(RecordError::InvalidKey(lossy(raw)));
        }
        Ok(Surt { key, host })
    }

    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    pub fn host(&self) -> &'a [u8] {
        self.host
    }

    /// Returns the progressive prefixes of this key in the given layer,
    /// shallowest first. At most `max_depth` prefixes are produced; anything
    /// past the last allowed separator stays attached to the final prefix.
    pub fn prefixes(&self, layer: Layer, max_depth: usize) -> Vec<&'a [u8]> {
        let source = match layer {
            Layer::Host => self.host,
            Layer::Path => self.key,
        };
        let sep = layer.separator();
        let mut out: Vec<&'a [u8]> = source
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == sep)
            .map(|(idx, _)| &source[..idx])
            .take(max_depth.saturating_sub(1))
            .collect();
        out.push(source);
        out
    }
}

pub(crate) fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
