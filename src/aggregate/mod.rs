use std::io::BufRead;

use crate::{
    record::{first_field, is_meta, trim_newline},
    surt::canonical,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Record { key: Vec<u8>, frequency: u64 },
    Meta(Vec<u8>),
}

/// Collapses a sorted stream of captures (CDX, CDXJ, or bare SURTs, one
/// capture per line, key first) into one record per distinct key, counting
/// how many captures each key had.
///
/// Lines whose key has no `)` (CDX headers, blank lines) end the current run
/// and are dropped. Metadata lines also end the current run and are passed
/// through after it.
pub struct RunLength<R: BufRead> {
    r: R,
    buf: Vec<u8>,
    run: Option<(Vec<u8>, u64)>,
    pending_meta: Option<Vec<u8>>,
    done: bool,

    pub lines_read: u64,
    pub bytes_read: u64,
    pub skipped: u64,
}

impl<R: BufRead> RunLength<R> {
    pub fn new(r: R) -> Self {
        RunLength {
            r,
            buf: Vec::with_capacity(1024),
            run: None,
            pending_meta: None,
            done: false,
            lines_read: 0,
            bytes_read: 0,
            skipped: 0,
        }
    }

    fn flush_run(&mut self) -> Option<Entry> {
        self.run
            .take()
            .map(|(key, frequency)| Entry::Record { key, frequency })
    }

    fn next_entry(&mut self) -> anyhow::Result<Option<Entry>> {
        if let Some(meta) = self.pending_meta.take() {
            return Ok(Some(Entry::Meta(meta)));
        }
        while !self.done {
            self.buf.clear();
            let n = self.r.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                self.done = true;
                break;
            }
            self.lines_read += 1;
            self.bytes_read += n as u64;

            let line = trim_newline(&self.buf);
            if is_meta(line) {
                let meta = self.buf.clone();
                match self.flush_run() {
                    Some(run) => {
                        self.pending_meta = Some(meta);
                        return Ok(Some(run));
                    }
                    None => return Ok(Some(Entry::Meta(meta))),
                }
            }

            let (field, _) = first_field(line);
            if !field.contains(&b')') {
                self.skipped += 1;
                if let Some(run) = self.flush_run() {
                    return Ok(Some(run));
                }
                continue;
            }

            let key = canonical(field);
            if let Some((run_key, count)) = &mut self.run {
                if run_key.as_slice() == key {
                    *count += 1;
                    continue;
                }
            }
            if let Some((key, frequency)) = self.run.replace((key.to_vec(), 1)) {
                return Ok(Some(Entry::Record { key, frequency }));
            }
        }
        Ok(self.flush_run())
    }
}

impl<R: BufRead> Iterator for RunLength<R> {
    type Item = anyhow::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
