//! Stream demultiplexing
//!
//! powermetrics writes one property list per sample and terminates each with a single NUL
//! byte. [`RecordSplitter`] turns arbitrarily chunked input into whole records;
//! [`RecordReader`] drives it from any [`Read`] source such as the sampler's stdout.

use std::collections::VecDeque;
use std::io::{self, Read};

/// Record terminator on the wire
pub const RECORD_DELIMITER: u8 = 0;

const READ_CHUNK: usize = 64 * 1024;

/// One complete, undecoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord(Vec<u8>);

impl RawRecord {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Incremental NUL-delimited record splitter
///
/// Bytes after the last delimiter stay buffered until more input arrives. The buffer has
/// no size cap; a single record may be arbitrarily large.
#[derive(Debug, Default)]
pub struct RecordSplitter {
    buf: Vec<u8>,
    /// Everything before this offset is known to contain no delimiter
    scanned: usize,
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every record it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawRecord> {
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut start = 0;
        let mut pos = self.scanned;
        while let Some(offset) = self.buf[pos..].iter().position(|&b| b == RECORD_DELIMITER) {
            let end = pos + offset;
            // back-to-back delimiters carry no record
            if end > start {
                records.push(RawRecord(self.buf[start..end].to_vec()));
            }
            start = end + 1;
            pos = start;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        records
    }

    /// Bytes waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// End of stream: drop the incomplete tail, returning how many bytes were discarded
    pub fn finish(&mut self) -> usize {
        let discarded = self.buf.len();
        self.buf.clear();
        self.scanned = 0;
        discarded
    }
}

/// Lazy iterator of records read from a byte stream
///
/// Yields `Err` once for a read error and then ends. A truncated record at end of stream is
/// discarded, never yielded.
pub struct RecordReader<R> {
    reader: R,
    splitter: RecordSplitter,
    ready: VecDeque<RawRecord>,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            splitter: RecordSplitter::new(),
            ready: VecDeque::new(),
            chunk: vec![0; READ_CHUNK],
            done: false,
        }
    }

    /// Give back the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }

            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.done = true;
                    let discarded = self.splitter.finish();
                    if discarded > 0 {
                        log::debug!("Discarding {} bytes of truncated record at end of stream", discarded);
                    }
                }
                Ok(n) => {
                    let records = self.splitter.push(&self.chunk[..n]);
                    self.ready.extend(records);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.done = true;
                    self.splitter.finish();
                    return Some(Err(e));
                }
            }
        }
    }
}
