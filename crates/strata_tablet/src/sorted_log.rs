//! Sorted recovery log files: resolved directories, the block-framed file
//! format, reader/writer, and the injected capabilities (crypto, caches).
//!
//! File layout:
//! - header: 8-byte magic, u16 version
//! - blocks: `[stored_len u32][crc32 u32][stored bytes]`; the crc covers the
//!   stored (possibly encrypted) bytes, and the plaintext of a block is a run
//!   of `[key_len][key][val_len][val]` records
//!
//! Records are globally sorted; block boundaries are physical only. A reader
//! holds one OS file handle and one decoded block at a time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use crc32fast::Hasher;

use crate::codec::read_bytes_at;
use crate::error::RecoveryError;
use crate::wal::{KeyRange, LogFileKey, LogFileValue};

const SORTED_LOG_MAGIC: &[u8; 8] = b"STRATAWL";
const SORTED_LOG_VERSION: u16 = 1;
const HEADER_LEN: u64 = 10;
const BLOCK_TARGET_BYTES: usize = 32 * 1024;

/// Marker file the sorter writes when a directory's sort has completed.
pub const SORT_FINISHED_MARKER: &str = "finished";

/// Block-level crypto seam. Sorted logs written on an encrypting server are
/// decrypted block-by-block during recovery; the identity service covers the
/// unencrypted case.
pub trait LogCrypto: Send + Sync {
    fn encrypt_block(&self, plain: Vec<u8>) -> anyhow::Result<Vec<u8>>;
    fn decrypt_block(&self, stored: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// Identity crypto for unencrypted logs.
pub struct PlaintextLogCrypto;

impl LogCrypto for PlaintextLogCrypto {
    fn encrypt_block(&self, plain: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(plain)
    }

    fn decrypt_block(&self, stored: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(stored)
    }
}

/// Memoizes file lengths so a recovery that reopens many files avoids
/// repeated metadata calls. Shared, externally synchronized, read-mostly.
pub struct FileLenCache {
    inner: Mutex<HashMap<PathBuf, u64>>,
}

impl FileLenCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn len(&self, path: &Path) -> std::io::Result<u64> {
        if let Ok(cache) = self.inner.lock() {
            if let Some(len) = cache.get(path) {
                return Ok(*len);
            }
        }
        let len = fs::metadata(path)?.len();
        if let Ok(mut cache) = self.inner.lock() {
            cache.insert(path.to_path_buf(), len);
        }
        Ok(len)
    }
}

impl Default for FileLenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared cache of verified plaintext blocks, keyed by (file, block offset).
pub trait BlockCacheProvider: Send + Sync {
    fn get(&self, path: &Path, offset: u64) -> Option<Arc<[u8]>>;
    fn put(&self, path: &Path, offset: u64, block: Arc<[u8]>);
}

/// Bounded FIFO block cache. Recovery reads each block a small number of
/// times in close succession, so insertion-order eviction is enough.
pub struct MemoryBlockCache {
    capacity_bytes: usize,
    inner: Mutex<MemoryBlockCacheState>,
}

struct MemoryBlockCacheState {
    blocks: HashMap<(PathBuf, u64), Arc<[u8]>>,
    order: VecDeque<(PathBuf, u64)>,
    bytes: usize,
}

impl MemoryBlockCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            inner: Mutex::new(MemoryBlockCacheState {
                blocks: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
            }),
        }
    }
}

impl BlockCacheProvider for MemoryBlockCache {
    fn get(&self, path: &Path, offset: u64) -> Option<Arc<[u8]>> {
        let state = self.inner.lock().ok()?;
        state.blocks.get(&(path.to_path_buf(), offset)).cloned()
    }

    fn put(&self, path: &Path, offset: u64, block: Arc<[u8]>) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let key = (path.to_path_buf(), offset);
        if state.blocks.contains_key(&key) {
            return;
        }
        state.bytes += block.len();
        state.order.push_back(key.clone());
        state.blocks.insert(key, block);
        while state.bytes > self.capacity_bytes {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if let Some(evicted) = state.blocks.remove(&oldest) {
                state.bytes -= evicted.len();
            }
        }
    }
}

/// Capabilities injected into readers: crypto plus the optional shared caches.
#[derive(Clone)]
pub struct LogReadContext {
    pub crypto: Arc<dyn LogCrypto>,
    pub file_len_cache: Option<Arc<FileLenCache>>,
    pub block_cache: Option<Arc<dyn BlockCacheProvider>>,
}

impl Default for LogReadContext {
    fn default() -> Self {
        Self {
            crypto: Arc::new(PlaintextLogCrypto),
            file_len_cache: None,
            block_cache: None,
        }
    }
}

/// A recovery log directory resolved to its ordered set of sorted files.
#[derive(Clone, Debug)]
pub struct ResolvedSortedLog {
    dir: PathBuf,
    children: Vec<PathBuf>,
}

impl ResolvedSortedLog {
    /// List `dir`'s sorted files in name order, skipping dot-files and the
    /// sort-completion marker.
    pub fn resolve(dir: impl Into<PathBuf>) -> Result<Self, RecoveryError> {
        let dir = dir.into();
        let entries = fs::read_dir(&dir).map_err(|e| RecoveryError::io(&dir, e))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecoveryError::io(&dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == SORT_FINISHED_MARKER {
                continue;
            }
            children.push(path);
        }
        children.sort();
        Ok(Self { dir, children })
    }

    /// Build a resolved log from parts already known to the caller, e.g. the
    /// sorter handing off files it just wrote.
    pub fn from_parts(dir: impl Into<PathBuf>, children: Vec<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            children,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn children(&self) -> &[PathBuf] {
        &self.children
    }

    /// Directory name, for diagnostics.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }
}

impl fmt::Display for ResolvedSortedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir.display())
    }
}

/// Reader over one sorted log file: a lazy, seekable, finite sequence of
/// decoded entries, delivered in the WAL total order.
pub struct SortedLogReader {
    path: PathBuf,
    file: Option<File>,
    file_len: u64,
    crypto: Arc<dyn LogCrypto>,
    block_cache: Option<Arc<dyn BlockCacheProvider>>,
    next_block_offset: u64,
    pending: VecDeque<(LogFileKey, LogFileValue)>,
    range: Option<KeyRange>,
    last_key: Option<LogFileKey>,
}

impl fmt::Debug for SortedLogReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedLogReader")
            .field("path", &self.path)
            .field("file_len", &self.file_len)
            .field("next_block_offset", &self.next_block_offset)
            .field("pending", &self.pending)
            .field("range", &self.range)
            .field("last_key", &self.last_key)
            .finish()
    }
}

impl SortedLogReader {
    /// Open `path` and validate its header. The reader holds an OS file
    /// handle until it is closed, dropped, or runs off the end of its range.
    pub fn open(path: &Path, ctx: &LogReadContext) -> Result<Self, RecoveryError> {
        let mut file = File::open(path).map_err(|e| RecoveryError::io(path, e))?;
        let file_len = match &ctx.file_len_cache {
            Some(cache) => cache.len(path).map_err(|e| RecoveryError::io(path, e))?,
            None => file
                .metadata()
                .map_err(|e| RecoveryError::io(path, e))?
                .len(),
        };
        if file_len < HEADER_LEN {
            return Err(RecoveryError::corrupt(
                path.display().to_string(),
                "truncated header",
            ));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| RecoveryError::io(path, e))?;
        if &header[0..8] != SORTED_LOG_MAGIC {
            return Err(RecoveryError::corrupt(
                path.display().to_string(),
                "bad magic",
            ));
        }
        let version = u16::from_be_bytes([header[8], header[9]]);
        if version != SORTED_LOG_VERSION {
            return Err(RecoveryError::corrupt(
                path.display().to_string(),
                format!("unsupported version {version}"),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            file_len,
            crypto: Arc::clone(&ctx.crypto),
            block_cache: ctx.block_cache.clone(),
            next_block_offset: HEADER_LEN,
            pending: VecDeque::new(),
            range: None,
            last_key: None,
        })
    }

    /// Restrict the reader to entries within `range`. Entries below the range
    /// start are skipped; the first entry past the range end ends the stream
    /// and releases the file handle.
    pub fn seek(&mut self, range: KeyRange) {
        self.range = Some(range);
    }

    /// Next entry in order, or `None` at end of stream.
    pub fn next(&mut self) -> Result<Option<(LogFileKey, LogFileValue)>, RecoveryError> {
        loop {
            if let Some((key, value)) = self.pending.pop_front() {
                if let Some(last) = &self.last_key {
                    if key < *last {
                        return Err(RecoveryError::corrupt(
                            self.path.display().to_string(),
                            format!("keys out of order: {key} after {last}"),
                        ));
                    }
                }
                self.last_key = Some(key.clone());
                if let Some(range) = &self.range {
                    if range.is_before_start(&key) {
                        continue;
                    }
                    if range.is_after_end(&key) {
                        self.close();
                        return Ok(None);
                    }
                }
                return Ok(Some((key, value)));
            }
            if !self.load_next_block()? {
                return Ok(None);
            }
        }
    }

    /// Release the underlying file handle. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
        self.pending.clear();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_next_block(&mut self) -> Result<bool, RecoveryError> {
        let offset = self.next_block_offset;
        if offset >= self.file_len {
            self.close();
            return Ok(false);
        }
        if offset + 8 > self.file_len {
            return Err(RecoveryError::corrupt(
                self.path.display().to_string(),
                "truncated block header",
            ));
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| RecoveryError::io(&self.path, e))?;
        let mut block_header = [0u8; 8];
        file.read_exact(&mut block_header)
            .map_err(|e| RecoveryError::io(&self.path, e))?;
        let stored_len = u32::from_be_bytes([
            block_header[0],
            block_header[1],
            block_header[2],
            block_header[3],
        ]) as u64;
        let expected_crc = u32::from_be_bytes([
            block_header[4],
            block_header[5],
            block_header[6],
            block_header[7],
        ]);
        if offset + 8 + stored_len > self.file_len {
            return Err(RecoveryError::corrupt(
                self.path.display().to_string(),
                "truncated block",
            ));
        }

        let plain = match self
            .block_cache
            .as_ref()
            .and_then(|cache| cache.get(&self.path, offset))
        {
            Some(cached) => cached,
            None => {
                let mut stored = vec![0u8; stored_len as usize];
                file.read_exact(&mut stored)
                    .map_err(|e| RecoveryError::io(&self.path, e))?;
                let mut hasher = Hasher::new();
                hasher.update(&stored);
                if hasher.finalize() != expected_crc {
                    return Err(RecoveryError::corrupt(
                        self.path.display().to_string(),
                        format!("block checksum mismatch at offset {offset}"),
                    ));
                }
                let plain: Arc<[u8]> = self
                    .crypto
                    .decrypt_block(stored)
                    .map_err(|e| {
                        RecoveryError::corrupt(
                            self.path.display().to_string(),
                            format!("block decrypt failed at offset {offset}: {e}"),
                        )
                    })?
                    .into();
                if let Some(cache) = &self.block_cache {
                    cache.put(&self.path, offset, Arc::clone(&plain));
                }
                plain
            }
        };

        self.decode_block(&plain)?;
        self.next_block_offset = offset + 8 + stored_len;
        Ok(true)
    }

    fn decode_block(&mut self, plain: &[u8]) -> Result<(), RecoveryError> {
        let mut offset = 0usize;
        while offset < plain.len() {
            match Self::decode_record(plain, &mut offset) {
                Ok(entry) => self.pending.push_back(entry),
                Err(e) => {
                    return Err(RecoveryError::corrupt(
                        self.path.display().to_string(),
                        format!("undecodable entry: {e}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn decode_record(
        plain: &[u8],
        offset: &mut usize,
    ) -> anyhow::Result<(LogFileKey, LogFileValue)> {
        let key = read_bytes_at(plain, offset)?;
        let value = read_bytes_at(plain, offset)?;
        Ok((LogFileKey::decode(&key)?, LogFileValue::decode(&value)?))
    }
}

/// Writer half of the format, used by the log sorter and by tests that
/// synthesize recovery directories. Appends must be in the WAL total order.
pub struct SortedLogWriter {
    path: PathBuf,
    file: File,
    crypto: Arc<dyn LogCrypto>,
    buf: Vec<u8>,
    last_key: Option<LogFileKey>,
}

impl SortedLogWriter {
    pub fn create(path: &Path, crypto: Arc<dyn LogCrypto>) -> anyhow::Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("create sorted log {}", path.display()))?;
        file.write_all(SORTED_LOG_MAGIC)?;
        file.write_all(&SORTED_LOG_VERSION.to_be_bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            crypto,
            buf: Vec::with_capacity(BLOCK_TARGET_BYTES),
            last_key: None,
        })
    }

    pub fn append(&mut self, key: &LogFileKey, value: &LogFileValue) -> anyhow::Result<()> {
        if let Some(last) = &self.last_key {
            anyhow::ensure!(
                key >= last,
                "sorted log append out of order: {key} after {last}"
            );
        }
        self.last_key = Some(key.clone());
        let encoded_key = key.encode();
        let encoded_value = value.encode();
        self.buf
            .extend_from_slice(&(encoded_key.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(&encoded_key);
        self.buf
            .extend_from_slice(&(encoded_value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(&encoded_value);
        if self.buf.len() >= BLOCK_TARGET_BYTES {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.flush_block()?;
        self.file
            .sync_all()
            .with_context(|| format!("sync sorted log {}", self.path.display()))?;
        Ok(())
    }

    fn flush_block(&mut self) -> anyhow::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let plain = std::mem::take(&mut self.buf);
        let stored = self.crypto.encrypt_block(plain).context("encrypt block")?;
        let mut hasher = Hasher::new();
        hasher.update(&stored);
        let crc = hasher.finalize();
        self.file.write_all(&(stored.len() as u32).to_be_bytes())?;
        self.file.write_all(&crc.to_be_bytes())?;
        self.file.write_all(&stored)?;
        Ok(())
    }
}
