//! Tablet recovery and compaction scheduling core for the Strata sorted
//! key/value store.
//!
//! Recovery data flow: recovery log directories -> sorted log readers ->
//! merging iterator -> recovery engine -> mutation receiver. The engine
//! narrows the log set to the directories that define the tablet's most
//! recent load, derives the sequence number replay must resume from out of
//! the compaction events and the tablet's current file set, and replays the
//! remaining mutations in the WAL total order.
//!
//! The compaction job queue subsystem shares the same concurrency model:
//! per-resource-group bounded priority queues fed by metadata-scan producers
//! and drained by workers, with deferred dequeue and generation-based
//! staleness eviction.

pub mod compaction_queue;
pub mod config;
pub mod error;
pub mod extent;
pub mod mutation;
pub mod recovery;
pub mod recovery_iter;
pub mod retry;
pub mod sorted_log;
pub mod wal;

mod codec;

pub use compaction_queue::{
    CompactionJob, CompactionJobPriorityQueue, CompactionJobQueues, CompactionKind, JobWaiter,
    ResourceGroupId,
};
pub use config::RecoveryConfig;
pub use error::RecoveryError;
pub use extent::{DataLevel, KeyExtent, TableId};
pub use mutation::{ColumnUpdate, Mutation};
pub use recovery::{MutationReceiver, TabletRecoveryEngine};
pub use recovery_iter::{DeduplicatingIterator, RecoveryLogsIterator};
pub use retry::RetryPolicy;
pub use sorted_log::{
    LogReadContext, ResolvedSortedLog, SortedLogReader, SortedLogWriter,
};
pub use wal::{KeyRange, LogEvent, LogFileKey, LogFileValue};
