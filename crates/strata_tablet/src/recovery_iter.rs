//! Merging iterator over the files of multiple sorted recovery logs.
//!
//! A pull-based min-heap of reader cursors: each retained reader contributes
//! its peeked head entry; advancing the output pops the heap, refills from
//! that reader, and re-sifts. The output key sequence is non-decreasing and
//! may contain equal keys; `DeduplicatingIterator` collapses those runs.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tracing::debug;

use crate::error::RecoveryError;
use crate::sorted_log::{LogReadContext, ResolvedSortedLog, SortedLogReader};
use crate::wal::{KeyRange, LogEvent, LogFileKey, LogFileValue};

pub type LogEntry = (LogFileKey, LogFileValue);

#[derive(Debug)]
struct HeadEntry {
    key: LogFileKey,
    value: LogFileValue,
    reader: usize,
}

impl PartialEq for HeadEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeadEntry {}

impl PartialOrd for HeadEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.reader.cmp(&other.reader))
    }
}

/// Merges the files of a set of recovery log directories into one ordered
/// stream over an optional key range.
///
/// The iterator exclusively owns every reader it retains and releases all of
/// them on drop; construction failures release the readers already opened
/// before the error propagates. The stream is finite and non-restartable.
#[derive(Debug)]
pub struct RecoveryLogsIterator {
    readers: Vec<SortedLogReader>,
    heap: BinaryHeap<Reverse<HeadEntry>>,
    failed: bool,
}

impl RecoveryLogsIterator {
    /// Open every file of every directory, seek to `range`, and retain the
    /// readers that have data in range. With `check_first_key`, the first
    /// entry of each directory's first file must be OPEN; callers set it only
    /// on the outermost scan of a recovery so the guard runs once.
    pub fn new<'a, I>(
        dirs: I,
        range: Option<KeyRange>,
        check_first_key: bool,
        ctx: &LogReadContext,
    ) -> Result<Self, RecoveryError>
    where
        I: IntoIterator<Item = &'a ResolvedSortedLog>,
    {
        let mut readers: Vec<SortedLogReader> = Vec::new();
        let mut heap = BinaryHeap::new();

        for dir in dirs {
            debug!(dir = %dir, "opening recovery log dir");

            if check_first_key && !dir.children().is_empty() {
                validate_first_key(dir, ctx)?;
            }

            for file in dir.children() {
                let mut reader = SortedLogReader::open(file, ctx)?;
                if let Some(range) = &range {
                    reader.seek(range.clone());
                }
                match reader.next()? {
                    Some((key, value)) => {
                        debug!(file = %file.display(), "log file has data in range");
                        let idx = readers.len();
                        readers.push(reader);
                        heap.push(Reverse(HeadEntry {
                            key,
                            value,
                            reader: idx,
                        }));
                    }
                    None => {
                        debug!(file = %file.display(), "log file has no data in range");
                        reader.close();
                    }
                }
            }
        }

        Ok(Self {
            readers,
            heap,
            failed: false,
        })
    }

    /// Release every retained reader. Also happens on drop.
    pub fn close(&mut self) {
        self.heap.clear();
        for reader in &mut self.readers {
            reader.close();
        }
    }
}

impl Iterator for RecoveryLogsIterator {
    type Item = Result<LogEntry, RecoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Reverse(head) = self.heap.pop()?;
        match self.readers[head.reader].next() {
            Ok(Some((key, value))) => self.heap.push(Reverse(HeadEntry {
                key,
                value,
                reader: head.reader,
            })),
            Ok(None) => {}
            Err(e) => {
                self.failed = true;
                self.close();
                return Some(Err(e));
            }
        }
        Some(Ok((head.key, head.value)))
    }
}

fn validate_first_key(dir: &ResolvedSortedLog, ctx: &LogReadContext) -> Result<(), RecoveryError> {
    let first = &dir.children()[0];
    let mut reader = SortedLogReader::open(first, ctx)?;
    if let Some((key, _)) = reader.next()? {
        if key.event != LogEvent::Open {
            return Err(RecoveryError::corrupt(
                dir.name(),
                format!("first log entry is not OPEN: {key}"),
            ));
        }
    }
    Ok(())
}

/// Collapses any run of entries whose keys compare equal down to the first.
/// Identical keys arise when the same WAL made it into more than one
/// recovery directory.
pub struct DeduplicatingIterator<I>
where
    I: Iterator<Item = Result<LogEntry, RecoveryError>>,
{
    source: I,
    peeked: Option<Result<LogEntry, RecoveryError>>,
}

impl<I> DeduplicatingIterator<I>
where
    I: Iterator<Item = Result<LogEntry, RecoveryError>>,
{
    pub fn new(source: I) -> Self {
        Self {
            source,
            peeked: None,
        }
    }
}

impl<I> Iterator for DeduplicatingIterator<I>
where
    I: Iterator<Item = Result<LogEntry, RecoveryError>>,
{
    type Item = Result<LogEntry, RecoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.peeked.take() {
            Some(entry) => entry,
            None => self.source.next()?,
        };
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        loop {
            match self.source.next() {
                Some(Ok((key, _))) if key == entry.0 => continue,
                other => {
                    self.peeked = other;
                    break;
                }
            }
        }
        Some(Ok(entry))
    }
}
