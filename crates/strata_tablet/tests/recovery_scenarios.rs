//! End-to-end tablet recovery scenarios over synthesized recovery logs.
//!
//! Test flow:
//! 1) Write one or more sorted recovery log directories with the writer half
//!    of the file format, exactly as the log sorter would.
//! 2) Run the recovery engine for a tablet extent against those directories.
//! 3) Assert on the mutations delivered to the receiver, or on the error.
//!
//! Covered behavior:
//! - the recovery sequence number derived from compaction start/finish
//!   events and the tablet's metadata file set
//! - tablet re-load (a newer tablet id supersedes older ones)
//! - multi-directory merge, deduplication of doubled logs, corruption and
//!   invariant failures, the crypto seam, and idempotence

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{
    cleanup_dir, mutation_value, rows_of, temp_dir, user_extent, write_sorted_log_dir,
    write_sorted_log_dir_with, RotatingCrypto,
};
use strata_tablet::sorted_log::LogReadContext;
use strata_tablet::{
    KeyExtent, LogFileKey, LogFileValue, Mutation, RecoveryConfig, RecoveryError,
    ResolvedSortedLog, TabletRecoveryEngine,
};

fn engine() -> TabletRecoveryEngine {
    TabletRecoveryEngine::new(&RecoveryConfig::default(), LogReadContext::default())
}

fn recover_rows(
    engine: &TabletRecoveryEngine,
    extent: &KeyExtent,
    dirs: &[ResolvedSortedLog],
    tablet_files: &HashSet<String>,
) -> Result<Vec<String>, RecoveryError> {
    let mut delivered: Vec<Mutation> = Vec::new();
    let mut receiver = |m: Mutation| delivered.push(m);
    engine.recover(extent, dirs, tablet_files, &mut receiver)?;
    Ok(rows_of(&delivered))
}

/// One log, one file: a finished compaction at seq 4 makes replay resume at
/// seq 3, so only the mutation at seq 5 comes back.
#[test]
fn finished_compaction_bounds_replay() {
    let root = temp_dir("finished_compaction");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("m1")),
            (
                LogFileKey::compaction_start(5, 3, "/v1/tables/5/t-0001/f1.rf"),
                LogFileValue::empty(),
            ),
            (LogFileKey::compaction_finish(5, 4), LogFileValue::empty()),
            (LogFileKey::mutation(5, 5), mutation_value("m2")),
        ]],
    );

    let engine = engine();
    let dirs = vec![log];
    assert!(engine
        .needs_recovery(&extent, &dirs)
        .expect("needs_recovery"));

    let rows = recover_rows(&engine, &extent, &dirs, &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["m2"]);

    cleanup_dir(&root);
}

/// A compaction start with no finish, but whose output file is in the
/// tablet's metadata, counts as finished.
#[test]
fn unfinished_compaction_with_file_in_metadata() {
    let root = temp_dir("start_file_present");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("m1")),
            (
                LogFileKey::compaction_start(5, 3, "/v2/tables/5/t-0001/f1.rf"),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 5), mutation_value("m2")),
        ]],
    );

    // metadata recorded the same file under a different volume; only the
    // two-component suffix has to match
    let tablet_files: HashSet<String> =
        std::iter::once("/v1/tables/5/t-0001/f1.rf".to_string()).collect();

    let rows = recover_rows(&engine(), &extent, &[log], &tablet_files).expect("recover");
    assert_eq!(rows, vec!["m2"]);

    cleanup_dir(&root);
}

/// Same log, but the start's output file is nowhere in the metadata: the
/// compaction never finished, so everything replays.
#[test]
fn unfinished_compaction_without_file_replays_all() {
    let root = temp_dir("start_file_absent");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("m1")),
            (
                LogFileKey::compaction_start(5, 3, "/v2/tables/5/t-0001/f1.rf"),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 5), mutation_value("m2")),
        ]],
    );

    let rows = recover_rows(&engine(), &extent, &[log], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["m1", "m2"]);

    cleanup_dir(&root);
}

/// A tablet unloaded and reloaded on the same server gets a higher tablet
/// id; only the latest load's mutations replay.
#[test]
fn reloaded_tablet_uses_newest_tablet_id() {
    let root = temp_dir("reload");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("old1")),
            (LogFileKey::mutation(5, 3), mutation_value("old2")),
            (
                LogFileKey::define_tablet(9, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(9, 2), mutation_value("new1")),
            (LogFileKey::mutation(9, 3), mutation_value("new2")),
        ]],
    );

    let rows = recover_rows(&engine(), &extent, &[log], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["new1", "new2"]);

    cleanup_dir(&root);
}

/// A log whose first entry is not OPEN fails construction before anything
/// is delivered.
#[test]
fn log_not_starting_with_open_is_corrupt() {
    let root = temp_dir("no_open");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("m1")),
        ]],
    );

    let engine = engine();
    let err = recover_rows(&engine, &extent, &[log.clone()], &HashSet::new()).unwrap_err();
    assert!(matches!(err, RecoveryError::CorruptLog { .. }));
    assert!(engine.needs_recovery(&extent, &[log.clone()]).is_err());

    // diagnostic replay: the guard can be configured off
    let permissive = TabletRecoveryEngine::new(
        &RecoveryConfig {
            validate_first_key: false,
            ..RecoveryConfig::default()
        },
        LogReadContext::default(),
    );
    let rows = recover_rows(&permissive, &extent, &[log], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["m1"]);

    cleanup_dir(&root);
}

/// Mutations for one tablet spread over several directories and files merge
/// back into seq order, and directories that never define the tablet are
/// left out of the replay.
#[test]
fn merges_across_directories_in_order() {
    let root = temp_dir("multi_dir");
    let extent = user_extent("8");
    let log1 = write_sorted_log_dir(
        &root,
        "wal1",
        &[
            vec![
                (LogFileKey::open(), LogFileValue::empty()),
                (
                    LogFileKey::define_tablet(3, 1, extent.clone()),
                    LogFileValue::empty(),
                ),
                (LogFileKey::mutation(3, 2), mutation_value("a")),
                (LogFileKey::mutation(3, 5), mutation_value("d")),
            ],
            vec![(LogFileKey::mutation(3, 6), mutation_value("e"))],
        ],
    );
    let log2 = write_sorted_log_dir(
        &root,
        "wal2",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(3, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(3, 3), mutation_value("b")),
            (LogFileKey::mutation(3, 4), mutation_value("c")),
        ]],
    );
    // a log for some other tablet entirely
    let other = write_sorted_log_dir(
        &root,
        "wal3",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(1, 1, user_extent("2")),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(1, 2), mutation_value("zz")),
        ]],
    );

    let dirs = vec![log1, log2, other];
    let rows = recover_rows(&engine(), &extent, &dirs, &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["a", "b", "c", "d", "e"]);

    cleanup_dir(&root);
}

/// The same WAL sorted into two recovery directories: deduplication keeps
/// the doubled compaction events from tripping the consecutive-finish
/// invariant. Mutation playback does not deduplicate; mutation keys are
/// unique per WAL in practice, so the doubled delivery below is the doubled
/// input, not reordering.
#[test]
fn doubled_log_directories_deduplicate() {
    let root = temp_dir("doubled");
    let extent = user_extent("5");
    let entries = vec![
        (LogFileKey::open(), LogFileValue::empty()),
        (
            LogFileKey::define_tablet(5, 1, extent.clone()),
            LogFileValue::empty(),
        ),
        (LogFileKey::mutation(5, 2), mutation_value("m1")),
        (
            LogFileKey::compaction_start(5, 3, "/v1/tables/5/t-0001/f1.rf"),
            LogFileValue::empty(),
        ),
        (LogFileKey::compaction_finish(5, 4), LogFileValue::empty()),
        (LogFileKey::mutation(5, 5), mutation_value("m2")),
    ];
    let log1 = write_sorted_log_dir(&root, "wal1", &[entries.clone()]);
    let log2 = write_sorted_log_dir(&root, "wal2", &[entries]);

    let rows =
        recover_rows(&engine(), &extent, &[log1, log2], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["m2", "m2"]);

    cleanup_dir(&root);
}

/// Two COMPACTION_FINISH events with no intervening start is a writer bug
/// and aborts the recovery.
#[test]
fn consecutive_finish_events_violate_invariant() {
    let root = temp_dir("double_finish");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (
                LogFileKey::compaction_start(5, 3, "/v1/tables/5/t-0001/f1.rf"),
                LogFileValue::empty(),
            ),
            (LogFileKey::compaction_finish(5, 4), LogFileValue::empty()),
            (LogFileKey::compaction_finish(5, 6), LogFileValue::empty()),
            (LogFileKey::mutation(5, 7), mutation_value("m")),
        ]],
    );

    let err = recover_rows(&engine(), &extent, &[log], &HashSet::new()).unwrap_err();
    assert!(matches!(err, RecoveryError::Invariant { .. }));

    cleanup_dir(&root);
}

/// A tablet file path without a parent directory cannot be suffix-matched
/// and is rejected as an invariant violation.
#[test]
fn bare_tablet_file_path_is_rejected() {
    let root = temp_dir("bad_tablet_file");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("m1")),
        ]],
    );

    let tablet_files: HashSet<String> = std::iter::once("f1.rf".to_string()).collect();
    let err = recover_rows(&engine(), &extent, &[log], &tablet_files).unwrap_err();
    assert!(matches!(err, RecoveryError::Invariant { .. }));

    cleanup_dir(&root);
}

/// A tablet absent from every log needs no replay and recovers vacuously.
#[test]
fn absent_tablet_recovers_empty() {
    let root = temp_dir("absent");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(1, 1, user_extent("2")),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(1, 2), mutation_value("other")),
        ]],
    );

    let extent = user_extent("5");
    let engine = engine();
    let dirs = vec![log];
    assert!(!engine
        .needs_recovery(&extent, &dirs)
        .expect("needs_recovery"));
    let rows = recover_rows(&engine, &extent, &dirs, &HashSet::new()).expect("recover");
    assert!(rows.is_empty());

    cleanup_dir(&root);
}

/// The root tablet also matches definitions recorded under the legacy
/// old-root extent.
#[test]
fn root_tablet_matches_legacy_extent() {
    let root = temp_dir("old_root");
    let root_extent = KeyExtent::whole_table(strata_tablet::TableId::root());
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(2, 1, KeyExtent::old_root()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(2, 2), mutation_value("rootm")),
        ]],
    );

    let rows =
        recover_rows(&engine(), &root_extent, &[log], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["rootm"]);

    cleanup_dir(&root);
}

/// MANY_MUTATIONS values deliver every contained mutation in order.
#[test]
fn many_mutations_deliver_in_order() {
    let root = temp_dir("many");
    let extent = user_extent("5");
    let batch = LogFileValue::new(vec![
        common::mutation("batch1"),
        common::mutation("batch2"),
        common::mutation("batch3"),
    ]);
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("single")),
            (LogFileKey::many_mutations(5, 3), batch),
        ]],
    );

    let rows = recover_rows(&engine(), &extent, &[log], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["single", "batch1", "batch2", "batch3"]);

    cleanup_dir(&root);
}

/// Recovery through an encrypting crypto service round-trips.
#[test]
fn encrypted_logs_recover() {
    let root = temp_dir("crypto");
    let extent = user_extent("5");
    let crypto = Arc::new(RotatingCrypto { shift: 13 });
    let log = write_sorted_log_dir_with(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("secret")),
        ]],
        crypto.clone(),
    );

    let ctx = LogReadContext {
        crypto,
        ..LogReadContext::default()
    };
    let engine = TabletRecoveryEngine::new(&RecoveryConfig::default(), ctx);
    let rows = recover_rows(&engine, &extent, &[log.clone()], &HashSet::new()).expect("recover");
    assert_eq!(rows, vec!["secret"]);

    // without the service the blocks fail to decode
    let plain_engine = TabletRecoveryEngine::new(
        &RecoveryConfig::default(),
        LogReadContext::default(),
    );
    let err = recover_rows(&plain_engine, &extent, &[log], &HashSet::new()).unwrap_err();
    assert!(matches!(err, RecoveryError::CorruptLog { .. }));

    cleanup_dir(&root);
}

/// Running the same recovery twice delivers the same mutation sequence.
#[test]
fn recovery_is_idempotent() {
    let root = temp_dir("idempotent");
    let extent = user_extent("5");
    let log = write_sorted_log_dir(
        &root,
        "wal1",
        &[vec![
            (LogFileKey::open(), LogFileValue::empty()),
            (
                LogFileKey::define_tablet(5, 1, extent.clone()),
                LogFileValue::empty(),
            ),
            (LogFileKey::mutation(5, 2), mutation_value("m1")),
            (
                LogFileKey::compaction_start(5, 3, "/v1/tables/5/t-0001/f1.rf"),
                LogFileValue::empty(),
            ),
            (LogFileKey::compaction_finish(5, 4), LogFileValue::empty()),
            (LogFileKey::mutation(5, 5), mutation_value("m2")),
            (LogFileKey::mutation(5, 6), mutation_value("m3")),
        ]],
    );

    let engine = engine();
    let dirs = vec![log];
    let first = recover_rows(&engine, &extent, &dirs, &HashSet::new()).expect("first recover");
    let second = recover_rows(&engine, &extent, &dirs, &HashSet::new()).expect("second recover");
    assert_eq!(first, second);
    assert_eq!(first, vec!["m2", "m3"]);

    cleanup_dir(&root);
}
