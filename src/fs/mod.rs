use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    io::{BufWriter, Seek, SeekFrom, Write},
    path::Path,
    rc::Rc,
};

use anyhow::{bail, Context};

/// The output of a compaction. Besides appending, compaction needs to go back
/// to the start of a subtree it has already written and replace it, so a sink
/// must support absolute seeks and truncation at the current position.
pub trait Sink: std::fmt::Debug {
    /// The offset the next append will land at.
    fn offset(&self) -> u64;
    fn seek(&mut self, offset: u64) -> anyhow::Result<()>;
    /// Discards everything at and after the current offset.
    fn truncate(&mut self) -> anyhow::Result<()>;
    fn append_line(&mut self, line: &[u8]) -> anyhow::Result<()>;
    fn sync(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct FileSink {
    w: BufWriter<File>,
    pos: u64,
}

impl FileSink {
    pub fn create<P>(fname: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(fname.as_ref())
            .with_context(|| format!("creating {}", fname.as_ref().display()))?;
        Ok(FileSink {
            w: BufWriter::new(file),
            pos: 0,
        })
    }
}

impl Sink for FileSink {
    fn offset(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, offset: u64) -> anyhow::Result<()> {
        // BufWriter flushes before seeking.
        self.pos = self.w.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn truncate(&mut self) -> anyhow::Result<()> {
        self.w.flush()?;
        self.w.get_mut().set_len(self.pos)?;
        Ok(())
    }

    fn append_line(&mut self, line: &[u8]) -> anyhow::Result<()> {
        self.w.write_all(line)?;
        self.pos += line.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.w.flush()?;
        self.w.get_ref().sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Write(u64, Vec<u8>),
    Seek(u64),
    Truncate(u64),
    Sync,
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Write(offset, contents) => {
                write!(w, "Write({}, ", offset)?;
                for ch in contents.iter().flat_map(|ch| std::ascii::escape_default(*ch)) {
                    w.write_char(ch as char)?;
                }
                write!(w, ")")?;
            }
            Event::Seek(offset) => {
                write!(w, "Seek({})", offset)?;
            }
            Event::Truncate(offset) => {
                write!(w, "Truncate({})", offset)?;
            }
            Event::Sync => {
                write!(w, "Sync")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockData {
    data: Vec<u8>,
    events: Vec<Event>,

    // After this many operations, fail every further one.
    time_to_crash: Option<usize>,
}

impl MockData {
    fn perform_op(&mut self) -> anyhow::Result<()> {
        match self.time_to_crash {
            Some(0) => bail!("sink is down"),
            Some(x) => self.time_to_crash = Some(x - 1),
            None => {}
        }
        Ok(())
    }

    pub fn schedule_crash(&mut self, ops: usize) {
        self.time_to_crash = Some(ops);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

/// An in-memory sink that records every operation performed on it. Clones
/// share the same underlying buffer, so a test can keep a handle while the
/// compactor owns another.
#[derive(Clone, Debug, Default)]
pub struct MockSink {
    idx: u64,
    pub data: Rc<RefCell<MockData>>,
}

impl MockSink {
    pub fn new() -> Self {
        MockSink::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        (*self.data).borrow().contents().to_vec()
    }
}

impl Sink for MockSink {
    fn offset(&self) -> u64 {
        self.idx
    }

    fn seek(&mut self, offset: u64) -> anyhow::Result<()> {
        let mut d = (*self.data).borrow_mut();
        d.perform_op()?;
        d.events.push(Event::Seek(offset));
        self.idx = offset;
        Ok(())
    }

    fn truncate(&mut self) -> anyhow::Result<()> {
        let mut d = (*self.data).borrow_mut();
        d.perform_op()?;
        d.events.push(Event::Truncate(self.idx));
        let idx = self.idx as usize;
        d.data.truncate(idx);
        Ok(())
    }

    fn append_line(&mut self, line: &[u8]) -> anyhow::Result<()> {
        let mut d = (*self.data).borrow_mut();
        d.perform_op()?;
        d.events.push(Event::Write(self.idx, line.to_vec()));

        let idx = self.idx as usize;
        if d.data.len() < idx + line.len() {
            d.data.resize(idx + line.len(), 0);
        }
        d.data[idx..idx + line.len()].copy_from_slice(line);
        self.idx += line.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        let mut d = (*self.data).borrow_mut();
        d.perform_op()?;
        d.events.push(Event::Sync);
        Ok(())
    }
}

#[test]
fn test_mock_sink() -> anyhow::Result<()> {
    let mut sink = MockSink::new();
    let handle = sink.clone();

    sink.append_line(b"aaa\n")?;
    sink.append_line(b"bbb\n")?;
    assert_eq!(handle.contents(), b"aaa\nbbb\n");

    sink.seek(2)?;
    sink.append_line(b"x\n")?;
    assert_eq!(handle.contents(), b"aax\nbbb\n");
    sink.truncate()?;
    assert_eq!(handle.contents(), b"aax\n");
    assert_eq!(sink.offset(), 4);

    (*handle.data).borrow_mut().schedule_crash(1);
    sink.sync()?;
    assert!(sink.append_line(b"ccc\n").is_err());
    Ok(())
}

#[test]
fn test_file_sink() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.txt");
    let mut sink = FileSink::create(&path)?;

    sink.append_line(b"com,example)/a 1\n")?;
    sink.append_line(b"com,example)/b 1\n")?;
    sink.seek(0)?;
    sink.truncate()?;
    sink.append_line(b"com,example)/* 2\n")?;
    sink.sync()?;

    assert_eq!(sink.offset(), 17);
    assert_eq!(std::fs::read(&path)?, b"com,example)/* 2\n");
    Ok(())
}
