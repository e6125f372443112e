//! Durable file-backed KV store with a write-ahead log and checkpoints.
//!
//! An in-memory BTreeMap serves reads. Every write batch is appended to the
//! log as one length-prefixed bincode record and fsynced before it becomes
//! visible, so a batch is either wholly replayed after a crash or not at
//! all. Checkpoints snapshot the map to a temp file, fsync it, rename it into
//! place and truncate the log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::kvstore::{apply_ops, scan, BatchOp, KvPair, KvStore, StoreError, Value};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

/// Default number of log records after which the store checkpoints itself.
pub const DEFAULT_CHECKPOINT_EVERY: u64 = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    ops: Vec<BatchOp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct WalWriter {
    file: File,
    /// Length of the log up to the last fully written record.
    len: u64,
    seq: u64,
    records_since_checkpoint: u64,
    poisoned: bool,
}

impl WalWriter {
    fn open(path: &Path) -> std::io::Result<WalWriter> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(WalWriter {
            file,
            len,
            seq: 0,
            records_since_checkpoint: 0,
            poisoned: false,
        })
    }

    fn append(&mut self, entry: &WalEntry) -> Result<(), StoreError> {
        if self.poisoned {
            return Err(StoreError::Kv(
                "write-ahead log could not be repaired after a failed append".to_string(),
            ));
        }
        let encoded = bincode::serialize(entry)?;
        let mut record = Vec::with_capacity(4 + encoded.len());
        record.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        record.extend_from_slice(&encoded);

        let written = self
            .file
            .write_all(&record)
            .and_then(|_| self.file.sync_all());
        if let Err(e) = written {
            self.rollback();
            return Err(e.into());
        }
        self.len += record.len() as u64;
        self.records_since_checkpoint += 1;
        Ok(())
    }

    /// Cut off whatever part of a failed append reached the file, so later
    /// records are not stranded behind it on replay.
    fn rollback(&mut self) {
        let repaired = self
            .file
            .set_len(self.len)
            .and_then(|_| self.file.sync_all());
        match repaired {
            Ok(()) => warn!(len = self.len, "rolled back partial log append"),
            Err(e) => {
                error!(len = self.len, error = %e, "cannot roll back partial log append, refusing further writes");
                self.poisoned = true;
            }
        }
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        self.records_since_checkpoint = 0;
        Ok(())
    }
}

/// Persistent file-backed KV store.
///
/// On open, loads the last checkpoint and replays the log. The log lock is
/// held across "append, then apply", so readers never observe a batch that
/// is not yet durable and batches are applied in log order.
pub struct PersistentKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    wal: Arc<Mutex<WalWriter>>,
    dir: PathBuf,
    checkpoint_every: u64,
}

impl PersistentKvStore {
    /// Opens or creates a store in `dir` with the default checkpoint cadence.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Self::open_with(dir, DEFAULT_CHECKPOINT_EVERY)
    }

    /// Opens or creates a store in `dir`, checkpointing after every
    /// `checkpoint_every` log records (0 disables automatic checkpoints).
    pub fn open_with(dir: &Path, checkpoint_every: u64) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;

        let mut data = BTreeMap::new();
        let mut seq = load_checkpoint(&dir.join(CHECKPOINT_FILENAME), &mut data)?;
        let (replayed, last_seq) = replay_wal(&dir.join(WAL_FILENAME), &mut data, seq)?;
        seq = last_seq;

        debug!(
            dir = %dir.display(),
            keys = data.len(),
            replayed,
            "opened persistent state store"
        );

        let mut wal = WalWriter::open(&dir.join(WAL_FILENAME))?;
        wal.seq = seq;
        wal.records_since_checkpoint = replayed;
        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            wal: Arc::new(Mutex::new(wal)),
            dir: dir.to_path_buf(),
            checkpoint_every,
        })
    }

    /// Snapshot the current state and truncate the log.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let mut wal = self.wal.lock().map_err(|e| StoreError::Kv(e.to_string()))?;
        self.checkpoint_locked(&mut wal)
    }

    fn checkpoint_locked(&self, wal: &mut WalWriter) -> Result<(), StoreError> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let data = self.data.read().map_err(|e| StoreError::Kv(e.to_string()))?;
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let encoded = bincode::serialize(&Checkpoint {
            seq: wal.seq,
            entries,
        })?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        wal.truncate()?;
        Ok(())
    }
}

fn load_checkpoint(path: &Path, data: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<u64, StoreError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }
    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| StoreError::Kv(format!("failed to deserialize checkpoint: {}", e)))?;
    data.extend(checkpoint.entries);
    Ok(checkpoint.seq)
}

/// Replays log records newer than `after_seq`. Returns (records replayed, last seq).
fn replay_wal(
    path: &Path,
    data: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    after_seq: u64,
) -> Result<(u64, u64), StoreError> {
    if !path.exists() {
        return Ok((0, after_seq));
    }
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut offset = 0usize;
    let mut replayed = 0u64;
    let mut last_seq = after_seq;
    while offset + 4 <= bytes.len() {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len_buf) as usize;
        let body = offset + 4..offset + 4 + len;
        if body.end > bytes.len() {
            break;
        }
        let entry: WalEntry = match bincode::deserialize(&bytes[body.clone()]) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), offset, error = %e, "discarding unreadable log tail");
                offset = bytes.len();
                break;
            }
        };
        offset = body.end;
        if entry.seq <= after_seq {
            continue;
        }
        last_seq = entry.seq;
        apply_ops(data, entry.ops);
        replayed += 1;
    }

    if offset < bytes.len() {
        warn!(
            path = %path.display(),
            discarded_bytes = bytes.len() - offset,
            "discarding torn log record"
        );
        OpenOptions::new().write(true).open(path)?.set_len(offset as u64)?;
    }

    Ok((replayed, last_seq))
}

impl KvStore for PersistentKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        let data = self.data.read().map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.write_batch(vec![BatchOp::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write_batch(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let data = self.data.read().map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(scan(&data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut wal = self.wal.lock().map_err(|e| StoreError::Kv(e.to_string()))?;
        let entry = WalEntry {
            seq: wal.seq + 1,
            ops,
        };
        wal.append(&entry)?;
        wal.seq = entry.seq;

        {
            let mut data = self.data.write().map_err(|e| StoreError::Kv(e.to_string()))?;
            apply_ops(&mut data, entry.ops);
        }

        if self.checkpoint_every > 0 && wal.records_since_checkpoint >= self.checkpoint_every {
            self.checkpoint_locked(&mut wal)?;
        }
        Ok(())
    }
}
