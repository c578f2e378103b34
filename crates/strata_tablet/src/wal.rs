//! Write-ahead log event model: the key/value codec of sorted recovery logs.
//!
//! Ordering contract:
//! - Keys order by (event class, tablet id, seq). The event class collapses
//!   COMPACTION_START/COMPACTION_FINISH into one class and
//!   MUTATION/MANY_MUTATIONS into another, so a single range scan keyed by one
//!   event of a class observes the whole class.
//! - Key equality is equality of that triple; the filename/extent payloads do
//!   not participate. The external sorter and the merging iterator both rely
//!   on exactly this order.
//! - The encoded form leads with the class, a sign-flipped tablet id, and a
//!   sign-flipped seq, all big-endian, so encoded keys sort byte-wise
//!   consistently with the logical order.

use std::cmp::Ordering;
use std::fmt;

use crate::codec::{put_bytes, put_u32, put_u64, read_bytes_at, read_u32_at, read_u64_at, read_u8_at};
use crate::extent::KeyExtent;
use crate::mutation::Mutation;

/// Kinds of events recorded in a write-ahead log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogEvent {
    /// First entry of every log; written when the log is created.
    Open,
    /// Associates a tablet extent with a tablet id for one load of the tablet.
    DefineTablet,
    /// A compaction began; carries the output file name.
    CompactionStart,
    /// A compaction finished; all mutations at or below its seq are on disk.
    CompactionFinish,
    /// A single mutation.
    Mutation,
    /// A batch of mutations recorded under one key.
    ManyMutations,
}

impl LogEvent {
    /// Collapsed ordinal used by the total order.
    pub fn sort_class(self) -> u8 {
        match self {
            LogEvent::Open => 0,
            LogEvent::DefineTablet => 1,
            LogEvent::CompactionStart | LogEvent::CompactionFinish => 2,
            LogEvent::Mutation | LogEvent::ManyMutations => 3,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            LogEvent::Open => 0,
            LogEvent::DefineTablet => 1,
            LogEvent::CompactionStart => 2,
            LogEvent::CompactionFinish => 3,
            LogEvent::Mutation => 4,
            LogEvent::ManyMutations => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LogEvent::Open),
            1 => Some(LogEvent::DefineTablet),
            2 => Some(LogEvent::CompactionStart),
            3 => Some(LogEvent::CompactionFinish),
            4 => Some(LogEvent::Mutation),
            5 => Some(LogEvent::ManyMutations),
            _ => None,
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogEvent::Open => "OPEN",
            LogEvent::DefineTablet => "DEFINE_TABLET",
            LogEvent::CompactionStart => "COMPACTION_START",
            LogEvent::CompactionFinish => "COMPACTION_FINISH",
            LogEvent::Mutation => "MUTATION",
            LogEvent::ManyMutations => "MANY_MUTATIONS",
        };
        f.write_str(name)
    }
}

/// Sort key of every WAL entry.
///
/// `tablet_id` identifies one load-instance of a tablet on a server; -1 is an
/// invalid sentinel that appears only in scan-range endpoints. Starting scan
/// ranges at -1 makes a corrupt persisted -1 land inside the scan where the
/// sign checks reject it.
#[derive(Clone, Debug)]
pub struct LogFileKey {
    pub event: LogEvent,
    pub tablet_id: i32,
    pub seq: i64,
    /// Output file of a COMPACTION_START; absent otherwise.
    pub filename: Option<String>,
    /// Extent being defined by a DEFINE_TABLET; absent otherwise.
    pub tablet: Option<KeyExtent>,
}

impl LogFileKey {
    pub fn open() -> Self {
        Self::bare(LogEvent::Open, 0, 0)
    }

    pub fn define_tablet(tablet_id: i32, seq: i64, extent: KeyExtent) -> Self {
        let mut key = Self::bare(LogEvent::DefineTablet, tablet_id, seq);
        key.tablet = Some(extent);
        key
    }

    pub fn compaction_start(tablet_id: i32, seq: i64, filename: impl Into<String>) -> Self {
        let mut key = Self::bare(LogEvent::CompactionStart, tablet_id, seq);
        key.filename = Some(filename.into());
        key
    }

    pub fn compaction_finish(tablet_id: i32, seq: i64) -> Self {
        Self::bare(LogEvent::CompactionFinish, tablet_id, seq)
    }

    pub fn mutation(tablet_id: i32, seq: i64) -> Self {
        Self::bare(LogEvent::Mutation, tablet_id, seq)
    }

    pub fn many_mutations(tablet_id: i32, seq: i64) -> Self {
        Self::bare(LogEvent::ManyMutations, tablet_id, seq)
    }

    fn bare(event: LogEvent, tablet_id: i32, seq: i64) -> Self {
        Self {
            event,
            tablet_id,
            seq,
            filename: None,
            tablet: None,
        }
    }

    /// Smallest key of `event`'s class.
    pub fn min_key(event: LogEvent) -> Self {
        Self::bare(event, -1, 0)
    }

    /// Largest key of `event`'s class.
    pub fn max_key(event: LogEvent) -> Self {
        Self::bare(event, i32::MAX, i64::MAX)
    }

    /// Smallest key of `event`'s class for one tablet id.
    pub fn min_key_for(event: LogEvent, tablet_id: i32) -> Self {
        Self::bare(event, tablet_id, 0)
    }

    /// Largest key of `event`'s class for one tablet id.
    pub fn max_key_for(event: LogEvent, tablet_id: i32) -> Self {
        Self::bare(event, tablet_id, i64::MAX)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(self.event.sort_class());
        put_u32(&mut out, (self.tablet_id as u32) ^ 0x8000_0000);
        put_u64(&mut out, (self.seq as u64) ^ 0x8000_0000_0000_0000);
        out.push(self.event.code());
        match self.event {
            LogEvent::DefineTablet => {
                // written by the sorter only for well-formed keys
                if let Some(extent) = &self.tablet {
                    extent.encode_into(&mut out);
                }
            }
            LogEvent::CompactionStart => {
                if let Some(filename) = &self.filename {
                    put_bytes(&mut out, filename.as_bytes());
                }
            }
            _ => {}
        }
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let class = read_u8_at(buf, &mut offset)?;
        let tablet_id = (read_u32_at(buf, &mut offset)? ^ 0x8000_0000) as i32;
        let seq = (read_u64_at(buf, &mut offset)? ^ 0x8000_0000_0000_0000) as i64;
        let code = read_u8_at(buf, &mut offset)?;
        let event = LogEvent::from_code(code)
            .ok_or_else(|| anyhow::anyhow!("unknown event code {code}"))?;
        anyhow::ensure!(
            event.sort_class() == class,
            "event {event} does not belong to sort class {class}"
        );

        let mut key = Self::bare(event, tablet_id, seq);
        match event {
            LogEvent::DefineTablet => {
                key.tablet = Some(KeyExtent::decode_from(buf, &mut offset)?);
            }
            LogEvent::CompactionStart => {
                let filename = read_bytes_at(buf, &mut offset)?;
                key.filename = Some(
                    String::from_utf8(filename)
                        .map_err(|_| anyhow::anyhow!("compaction filename is not utf-8"))?,
                );
            }
            _ => {}
        }
        anyhow::ensure!(offset == buf.len(), "trailing bytes after {event} key");
        Ok(key)
    }
}

impl PartialEq for LogFileKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LogFileKey {}

impl PartialOrd for LogFileKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogFileKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event
            .sort_class()
            .cmp(&other.event.sort_class())
            .then(self.tablet_id.cmp(&other.tablet_id))
            .then(self.seq.cmp(&other.seq))
    }
}

impl fmt::Display for LogFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tid:{} seq:{}", self.event, self.tablet_id, self.seq)?;
        if let Some(filename) = &self.filename {
            write!(f, " file:{filename}")?;
        }
        if let Some(tablet) = &self.tablet {
            write!(f, " tablet:{tablet}")?;
        }
        Ok(())
    }
}

/// Inclusive range over the total order, used to bound scans.
#[derive(Clone, Debug)]
pub struct KeyRange {
    start: LogFileKey,
    end: LogFileKey,
}

impl KeyRange {
    pub fn new(start: LogFileKey, end: LogFileKey) -> Self {
        Self { start, end }
    }

    /// The whole class of `event`, bounded to one tablet id.
    pub fn for_tablet(event: LogEvent, tablet_id: i32) -> Self {
        Self::new(
            LogFileKey::min_key_for(event, tablet_id),
            LogFileKey::max_key_for(event, tablet_id),
        )
    }

    /// The whole class of `event` across all tablets.
    pub fn for_event(event: LogEvent) -> Self {
        Self::new(LogFileKey::min_key(event), LogFileKey::max_key(event))
    }

    pub fn start(&self) -> &LogFileKey {
        &self.start
    }

    pub fn end(&self) -> &LogFileKey {
        &self.end
    }

    pub fn is_before_start(&self, key: &LogFileKey) -> bool {
        *key < self.start
    }

    pub fn is_after_end(&self, key: &LogFileKey) -> bool {
        *key > self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start, self.end)
    }
}

/// Value of a WAL entry: the mutations of a MUTATION or MANY_MUTATIONS event,
/// empty for every other event kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFileValue {
    pub mutations: Vec<Mutation>,
}

impl LogFileValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self { mutations }
    }

    pub fn one(mutation: Mutation) -> Self {
        Self::new(vec![mutation])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.mutations.len() as u32);
        for mutation in &self.mutations {
            mutation.encode_into(&mut out);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let count = read_u32_at(buf, &mut offset)? as usize;
        let mut mutations = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            mutations.push(Mutation::decode_from(buf, &mut offset)?);
        }
        anyhow::ensure!(offset == buf.len(), "trailing bytes after log value");
        Ok(Self { mutations })
    }
}
