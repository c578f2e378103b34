//! Shared helpers for integration tests: synthesizing sorted recovery log
//! directories the way the external sorter lays them out.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_tablet::sorted_log::{LogCrypto, PlaintextLogCrypto};
use strata_tablet::{
    KeyExtent, LogFileKey, LogFileValue, Mutation, ResolvedSortedLog, SortedLogWriter, TableId,
};

/// Fresh per-test directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "strata_tablet_it_{name}_{}_{}",
        std::process::id(),
        nanos
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn cleanup_dir(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

/// Extent of a user-table tablet covering all rows.
pub fn user_extent(table: &str) -> KeyExtent {
    KeyExtent::whole_table(TableId::new(table))
}

pub fn mutation(row: &str) -> Mutation {
    let mut m = Mutation::new(row.as_bytes().to_vec());
    m.put(b"col".to_vec(), b"val".to_vec());
    m
}

pub fn mutation_value(row: &str) -> LogFileValue {
    LogFileValue::one(mutation(row))
}

/// Write one recovery log directory. Entries are handed over in narrative
/// order and sorted here, which is exactly what the log sorter does before
/// recovery ever sees a directory.
pub fn write_sorted_log_dir(
    root: &Path,
    name: &str,
    files: &[Vec<(LogFileKey, LogFileValue)>],
) -> ResolvedSortedLog {
    write_sorted_log_dir_with(root, name, files, Arc::new(PlaintextLogCrypto))
}

pub fn write_sorted_log_dir_with(
    root: &Path,
    name: &str,
    files: &[Vec<(LogFileKey, LogFileValue)>],
    crypto: Arc<dyn LogCrypto>,
) -> ResolvedSortedLog {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("create log dir");
    for (i, entries) in files.iter().enumerate() {
        let mut entries = entries.clone();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let path = dir.join(format!("part-r-{i:05}.slf"));
        let mut writer =
            SortedLogWriter::create(&path, Arc::clone(&crypto)).expect("create sorted log");
        for (key, value) in &entries {
            writer.append(key, value).expect("append log entry");
        }
        writer.finish().expect("finish sorted log");
    }
    std::fs::write(dir.join("finished"), b"").expect("write finished marker");
    ResolvedSortedLog::resolve(&dir).expect("resolve log dir")
}

/// Rows delivered to a receiver, for assertions.
pub fn rows_of(mutations: &[Mutation]) -> Vec<String> {
    mutations
        .iter()
        .map(|m| String::from_utf8_lossy(m.row()).into_owned())
        .collect()
}

/// Byte-rotating test cipher; enough to prove readers round-trip through the
/// crypto seam rather than reading raw bytes.
pub struct RotatingCrypto {
    pub shift: u8,
}

impl LogCrypto for RotatingCrypto {
    fn encrypt_block(&self, mut plain: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        for byte in &mut plain {
            *byte = byte.wrapping_add(self.shift);
        }
        Ok(plain)
    }

    fn decrypt_block(&self, mut stored: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        for byte in &mut stored {
            *byte = byte.wrapping_sub(self.shift);
        }
        Ok(stored)
    }
}
