//! Tablet recovery: extract a tablet's mutations from a set of sorted
//! write-ahead logs and replay them into a receiver.
//!
//! The algorithm runs in phases:
//! - find the maximum tablet id that defines the extent across all logs; a
//!   tablet reloaded on the same server gets a new, higher id, and only the
//!   most recent load's events matter
//! - narrow to the logs that define that id, opening one directory at a time
//!   to bound resident index memory
//! - derive the recovery sequence number from COMPACTION_START/FINISH events
//!   and the files currently recorded in the tablet's metadata
//! - replay every mutation at or above that sequence number, in order

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::extent::KeyExtent;
use crate::mutation::Mutation;
use crate::recovery_iter::{DeduplicatingIterator, RecoveryLogsIterator};
use crate::retry::RetryPolicy;
use crate::sorted_log::{LogReadContext, ResolvedSortedLog};
use crate::wal::{KeyRange, LogEvent, LogFileKey};

/// Sink for replayed mutations. The engine delivers mutations in the WAL
/// total order; a receiver that sees a recovery fail is expected to discard
/// what it received or restart.
pub trait MutationReceiver {
    fn receive(&mut self, mutation: Mutation);
}

impl<F: FnMut(Mutation)> MutationReceiver for F {
    fn receive(&mut self, mutation: Mutation) {
        self(mutation)
    }
}

/// Rebuilds one tablet's unflushed state from sorted recovery logs.
///
/// Engines are cheap; a server loading several tablets concurrently runs one
/// engine per load, sharing the caches inside the read context.
pub struct TabletRecoveryEngine {
    ctx: LogReadContext,
    validate_first_key: bool,
}

impl TabletRecoveryEngine {
    pub fn new(config: &RecoveryConfig, ctx: LogReadContext) -> Self {
        Self {
            ctx,
            validate_first_key: config.validate_first_key,
        }
    }

    /// True iff any of `dirs` defines `extent`, i.e. replay would deliver
    /// events for it.
    pub fn needs_recovery(
        &self,
        extent: &KeyExtent,
        dirs: &[ResolvedSortedLog],
    ) -> Result<bool, RecoveryError> {
        let (tablet_id, _) = self.find_logs_that_define_tablet(extent, dirs)?;
        Ok(tablet_id != -1)
    }

    /// Replay `extent`'s mutations from `dirs` into `receiver`.
    ///
    /// `tablet_files` is the set of file paths currently recorded in the
    /// tablet's metadata; it decides whether a trailing COMPACTION_START with
    /// no FINISH actually completed. A tablet absent from every log needs no
    /// replay and succeeds without delivering anything.
    pub fn recover(
        &self,
        extent: &KeyExtent,
        dirs: &[ResolvedSortedLog],
        tablet_files: &HashSet<String>,
        receiver: &mut dyn MutationReceiver,
    ) -> Result<(), RecoveryError> {
        let (tablet_id, logs) = self.find_logs_that_define_tablet(extent, dirs)?;

        if tablet_id == -1 {
            let names: Vec<String> = dirs.iter().map(|d| d.name()).collect();
            info!(extent = %extent, logs = ?names, "tablet is not defined in recovery logs");
            return Ok(());
        }
        info!(
            found = logs.len(),
            total = dirs.len(),
            tablet_id,
            extent = %extent,
            "found logs defining tablet"
        );

        let recovery_seq = self.find_recovery_seq(&logs, tablet_files, tablet_id)?;

        let names: Vec<String> = logs.iter().map(|l| l.name()).collect();
        info!(
            extent = %extent,
            tablet_id,
            seq = recovery_seq,
            logs = ?names,
            "recovering mutations"
        );

        self.playback_mutations(&logs, receiver, tablet_id, recovery_seq)
    }

    /// `recover`, retried with bounded backoff on transient I/O failures.
    /// Corruption and invariant violations surface immediately. Each retry
    /// replays from the start, so the receiver must discard partial state
    /// before the next attempt.
    pub fn recover_with_retry(
        &self,
        extent: &KeyExtent,
        dirs: &[ResolvedSortedLog],
        tablet_files: &HashSet<String>,
        receiver: &mut dyn MutationReceiver,
        policy: &RetryPolicy,
    ) -> Result<(), RecoveryError> {
        let mut retry = policy.start();
        loop {
            match self.recover(extent, dirs, tablet_files, receiver) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && retry.can_retry() => {
                    let delay = retry.next_delay();
                    warn!(
                        extent = %extent,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        attempt = retry.attempts(),
                        "transient recovery failure, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Maximum tablet id defining `extent` in `dirs`, or -1 if none. The
    /// root extent also matches the legacy old-root extent.
    fn find_max_tablet_id(
        &self,
        extent: &KeyExtent,
        dirs: &[&ResolvedSortedLog],
    ) -> Result<i32, RecoveryError> {
        let mut tablet_id = -1;

        let alternative = extent.is_root().then(KeyExtent::old_root);
        let range = KeyRange::for_event(LogEvent::DefineTablet);
        let iter = RecoveryLogsIterator::new(
            dirs.iter().copied(),
            Some(range),
            self.validate_first_key,
            &self.ctx,
        )?;

        for entry in iter {
            let (key, _) = entry?;

            if key.event != LogEvent::DefineTablet {
                return Err(RecoveryError::invariant(format!(
                    "non tablet definition event in definition scan: {key}"
                )));
            }
            let Some(tablet) = &key.tablet else {
                return Err(RecoveryError::invariant(format!(
                    "tablet definition without an extent: {key}"
                )));
            };

            if tablet == extent || alternative.as_ref() == Some(tablet) {
                if key.tablet_id < 0 {
                    return Err(RecoveryError::invariant(format!(
                        "negative tablet id {} for {}",
                        key.tablet_id, extent
                    )));
                }
                // the merge delivers definitions in id order
                if tablet_id != -1 && key.tablet_id < tablet_id {
                    return Err(RecoveryError::invariant(format!(
                        "tablet ids out of order for {}: {} after {}",
                        extent, key.tablet_id, tablet_id
                    )));
                }
                tablet_id = key.tablet_id;
            }
        }
        Ok(tablet_id)
    }

    /// Run the definition scan against each directory individually and group
    /// directories by the tablet id they observed; the group with the largest
    /// id wins. Opening one directory at a time keeps at most one file index
    /// resident, and a tablet usually appears in a small fraction of dirs.
    fn find_logs_that_define_tablet<'a>(
        &self,
        extent: &KeyExtent,
        dirs: &'a [ResolvedSortedLog],
    ) -> Result<(i32, Vec<&'a ResolvedSortedLog>), RecoveryError> {
        let mut groups: HashMap<i32, Vec<&'a ResolvedSortedLog>> = HashMap::new();

        for dir in dirs {
            let tablet_id = self.find_max_tablet_id(extent, &[dir])?;
            if tablet_id == -1 {
                debug!(extent = %extent, dir = %dir, "tablet not found in recovery log");
            } else {
                debug!(extent = %extent, tablet_id, dir = %dir, "found tablet in recovery log");
                groups.entry(tablet_id).or_default().push(dir);
            }
        }

        Ok(groups
            .into_iter()
            .max_by_key(|(id, _)| *id)
            .unwrap_or((-1, Vec::new())))
    }

    /// Sequence number replay must resume from, derived from the compaction
    /// events of `tablet_id` and the tablet's current file set.
    fn find_recovery_seq(
        &self,
        logs: &[&ResolvedSortedLog],
        tablet_files: &HashSet<String>,
        tablet_id: i32,
    ) -> Result<i64, RecoveryError> {
        let mut suffixes = HashSet::new();
        for path in tablet_files {
            suffixes.insert(path_suffix(path)?);
        }

        let mut last_start: i64 = 0;
        let mut last_finish: i64 = 0;
        let mut last_start_file: Option<String> = None;
        let mut last_event: Option<LogEvent> = None;

        let range = KeyRange::for_tablet(LogEvent::CompactionStart, tablet_id);
        let iter = RecoveryLogsIterator::new(logs.iter().copied(), Some(range), false, &self.ctx)?;

        for entry in DeduplicatingIterator::new(iter) {
            let (key, _) = entry?;

            if key.seq < 0 {
                return Err(RecoveryError::invariant(format!(
                    "unexpected negative seq {} for tablet id {}",
                    key.seq, tablet_id
                )));
            }
            if key.tablet_id != tablet_id {
                return Err(RecoveryError::invariant(format!(
                    "compaction scan for tablet id {tablet_id} saw {key}"
                )));
            }
            if key.seq < last_finish.max(last_start) {
                return Err(RecoveryError::invariant(format!(
                    "compaction events out of order: {key} after start {last_start} finish {last_finish}"
                )));
            }

            match key.event {
                LogEvent::CompactionStart => {
                    last_start = key.seq;
                    last_start_file = key.filename.clone();
                }
                LogEvent::CompactionFinish => {
                    if key.seq <= last_start {
                        return Err(RecoveryError::invariant(format!(
                            "compaction finish seq not past start: {} {} {}",
                            key.tablet_id, key.seq, last_start
                        )));
                    }
                    if last_event == Some(LogEvent::CompactionFinish) {
                        return Err(RecoveryError::invariant(format!(
                            "consecutive COMPACTION_FINISH events: {} {} {}",
                            key.tablet_id, last_finish, key.seq
                        )));
                    }
                    last_finish = key.seq;
                }
                _ => {
                    return Err(RecoveryError::invariant(format!(
                        "non compaction event in compaction scan: {key}"
                    )));
                }
            }
            last_event = Some(key.event);
        }

        if last_event == Some(LogEvent::CompactionStart) {
            let Some(file) = &last_start_file else {
                return Err(RecoveryError::invariant(format!(
                    "compaction start without a file for tablet id {tablet_id}"
                )));
            };
            let suffix = path_suffix(file)?;
            if suffixes.contains(&suffix) {
                // No finish event, but the start's output file made it into
                // the tablet metadata, so the compaction completed.
                debug!(
                    tablet_id,
                    seq = last_start,
                    file = %suffix,
                    "compaction start considered finished; output file present in metadata"
                );
                return Ok(last_start);
            }
        }

        // A finish at seq S means everything <= S is on disk; resuming one
        // below S tolerates writer reordering at the boundary.
        Ok((last_finish - 1).max(0))
    }

    /// Deliver every mutation of `tablet_id` with seq >= `recovery_seq`.
    fn playback_mutations(
        &self,
        logs: &[&ResolvedSortedLog],
        receiver: &mut dyn MutationReceiver,
        tablet_id: i32,
        recovery_seq: i64,
    ) -> Result<(), RecoveryError> {
        let mut start = LogFileKey::min_key_for(LogEvent::Mutation, tablet_id);
        start.seq = recovery_seq;
        let end = LogFileKey::max_key_for(LogEvent::Mutation, tablet_id);

        let iter = RecoveryLogsIterator::new(
            logs.iter().copied(),
            Some(KeyRange::new(start, end)),
            false,
            &self.ctx,
        )?;

        for entry in iter {
            let (key, value) = entry?;

            if key.tablet_id != tablet_id {
                return Err(RecoveryError::invariant(format!(
                    "mutation scan for tablet id {tablet_id} saw {key}"
                )));
            }
            if key.seq < recovery_seq {
                return Err(RecoveryError::invariant(format!(
                    "mutation below recovery seq {recovery_seq}: {key}"
                )));
            }
            match key.event {
                LogEvent::Mutation | LogEvent::ManyMutations => {
                    debug!(count = value.mutations.len(), key = %key, "recovering mutations for key");
                    for mutation in value.mutations {
                        receiver.receive(mutation);
                    }
                }
                _ => {
                    return Err(RecoveryError::invariant(format!(
                        "non mutation event in mutation scan: {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Two-component suffix (`parent_dir/file_name`) used to match a compaction
/// output path against the tablet's metadata file set. Metadata and WAL may
/// record the same file under different volume prefixes.
fn path_suffix(path: &str) -> Result<String, RecoveryError> {
    let mut components = path.rsplit('/').filter(|c| !c.is_empty());
    let file = components.next();
    let parent = components.next();
    match (parent, file) {
        (Some(parent), Some(file)) => Ok(format!("{parent}/{file}")),
        _ => Err(RecoveryError::invariant(format!("bad file path {path}"))),
    }
}
