// A summary file is plain text, one record per line:
//
//   <key> <frequency>[ <ignored>...]
//
// Lines starting with '!' carry metadata and are copied through untouched.

use thiserror::Error;

use crate::surt::lossy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("malformed record: {0:?}")]
    Malformed(String),
    #[error("key has no host/path separator: {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    Meta(&'a [u8]),
    Record(Record<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub frequency: u64,
}

pub fn is_meta(line: &[u8]) -> bool {
    line.first() == Some(&b'!')
}

pub(crate) fn trim_newline(mut line: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = line {
        line = rest;
    }
    if let [rest @ .., b'\r'] = line {
        line = rest;
    }
    line
}

/// Splits off the first whitespace-delimited field, returning it along with
/// the remainder of the line.
pub(crate) fn first_field(line: &[u8]) -> (&[u8], &[u8]) {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let line = &line[start..];
    let end = line
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(line.len());
    (&line[..end], &line[end..])
}

pub fn parse_line(line: &[u8]) -> Result<Line<'_>, RecordError> {
    let line = trim_newline(line);
    if is_meta(line) {
        return Ok(Line::Meta(line));
    }
    let (key, rest) = first_field(line);
    let (freq, _) = first_field(rest);
    if key.is_empty() || freq.is_empty() {
        return Err(RecordError::Malformed(lossy(line)));
    }
    let frequency = std::str::from_utf8(freq)
        .ok()
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| RecordError::Malformed(lossy(line)))?;
    Ok(Line::Record(Record { key, frequency }))
}

pub fn write_record(buf: &mut Vec<u8>, key: &[u8], frequency: u64) {
    buf.extend_from_slice(key);
    buf.push(b' ');
    buf.extend_from_slice(frequency.to_string().as_bytes());
    buf.push(b'\n');
}
