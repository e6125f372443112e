//! Durable replication checkpoints, membership mirror and named WAL sets.
//!
//! Logical layout over the byte-keyed [`KvStore`], parts separated by NUL:
//!
//! | key                                 | value                        |
//! |-------------------------------------|------------------------------|
//! | `src \0 source \0 group`            | bincode [`GroupCheckpoint`]  |
//! | `mem \0 target \0 group \0 user`    | role, upper-case             |
//! | `set \0 target \0 set_name \0 value`| empty                        |
//!
//! The per-source checkpoint is the row of the sentinel group
//! [`ALL_GROUPS_SENTINEL`]. Every multi-row operation is one atomic
//! [`KvStore::write_batch`].

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use groupsync_core::{Difference, GroupSet, Membership, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kvstore::{BatchOp, KvStore, MemoryKvStore, StoreError};

/// Reserved group id holding a source's global checkpoint.
pub const ALL_GROUPS_SENTINEL: &str = "_GROUPSYNC_ALL_GROUPS_";

const SEP: u8 = 0;
const SOURCE_PREFIX: &str = "src";
const MEMBERSHIP_PREFIX: &str = "mem";
const SET_PREFIX: &str = "set";

/// Per-(source, group) checkpoint row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCheckpoint {
    /// When the group was last fully synced (epoch ms, 0 if never).
    pub last_sync_time_ms: u64,
    /// Failed sync attempts since the last success.
    pub failure_count: u64,
}

/// Named per-target durable sets, used by targets as a write-ahead log for
/// multi-step remote mutations.
pub trait TargetStore: Send + Sync {
    /// Members of the named set; empty if it was never written.
    fn read_set(&self, target_id: &str, set_name: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Replace the named set with `values`.
    fn write_set(
        &self,
        target_id: &str,
        set_name: &str,
        values: &BTreeSet<String>,
    ) -> Result<(), StoreError>;

    /// Remove every member of the named set.
    fn clear_set(&self, target_id: &str, set_name: &str) -> Result<(), StoreError>;
}

/// Durable replication state shared by every replicator in the process.
pub struct ReplicationState {
    store: Arc<dyn KvStore>,
    // Serializes read-modify-write operations.
    rmw: Mutex<()>,
}

fn key(parts: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(SEP);
        }
        out.extend_from_slice(part.as_bytes());
    }
    out
}

fn prefix(parts: &[&str]) -> Vec<u8> {
    let mut out = key(parts);
    out.push(SEP);
    out
}

fn last_part(key: &[u8]) -> String {
    let start = key.iter().rposition(|b| *b == SEP).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&key[start..]).into_owned()
}

impl ReplicationState {
    /// State over an arbitrary KV backend.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            rmw: Mutex::new(()),
        }
    }

    /// Non-durable state, for tests and dry runs.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    fn checkpoint(&self, source_id: &str, group: &str) -> Result<GroupCheckpoint, StoreError> {
        match self.store.get(&key(&[SOURCE_PREFIX, source_id, group]))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(GroupCheckpoint::default()),
        }
    }

    fn put_checkpoint(
        &self,
        source_id: &str,
        group: &str,
        checkpoint: &GroupCheckpoint,
    ) -> Result<(), StoreError> {
        self.store.put(
            key(&[SOURCE_PREFIX, source_id, group]),
            bincode::serialize(checkpoint)?,
        )
    }

    /// High-water mark of the last fully clean cycle for `source_id` (0 if never).
    pub fn last_update_for_source(&self, source_id: &str) -> Result<u64, StoreError> {
        self.last_sync_time_for_group(source_id, ALL_GROUPS_SENTINEL)
    }

    /// Advance the source's global checkpoint to `now_ms`.
    pub fn mark_source_as_updated(&self, source_id: &str, now_ms: u64) -> Result<(), StoreError> {
        self.mark_group_as_synced(source_id, ALL_GROUPS_SENTINEL, now_ms)
    }

    /// When `group` was last synced from `source_id` (0 if never).
    pub fn last_sync_time_for_group(&self, source_id: &str, group: &str) -> Result<u64, StoreError> {
        Ok(self.checkpoint(source_id, group)?.last_sync_time_ms)
    }

    /// Replace the group's checkpoint: synced at `now_ms`, no failures.
    pub fn mark_group_as_synced(
        &self,
        source_id: &str,
        group: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.put_checkpoint(
            source_id,
            group,
            &GroupCheckpoint {
                last_sync_time_ms: now_ms,
                failure_count: 0,
            },
        )
    }

    /// Bump the durable failure counter for a group, creating the row if needed.
    pub fn increment_failure_count(&self, source_id: &str, group: &str) -> Result<u64, StoreError> {
        let _guard = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let mut checkpoint = self.checkpoint(source_id, group)?;
        checkpoint.failure_count += 1;
        self.put_checkpoint(source_id, group, &checkpoint)?;
        Ok(checkpoint.failure_count)
    }

    /// Durable failure counter for a group.
    pub fn failure_count(&self, source_id: &str, group: &str) -> Result<u64, StoreError> {
        Ok(self.checkpoint(source_id, group)?.failure_count)
    }

    /// Every per-group checkpoint recorded for a source, excluding the
    /// global one.
    pub fn group_checkpoints(
        &self,
        source_id: &str,
    ) -> Result<Vec<(String, GroupCheckpoint)>, StoreError> {
        let rows = self.store.scan_prefix(&prefix(&[SOURCE_PREFIX, source_id]))?;
        let mut out = Vec::with_capacity(rows.len());
        for (k, v) in rows {
            let group = last_part(&k);
            if group == ALL_GROUPS_SENTINEL {
                continue;
            }
            out.push((group, bincode::deserialize(&v)?));
        }
        Ok(out)
    }

    /// Replace the mirrored membership of exactly the groups in `groups`.
    pub fn store_remote_memberships(
        &self,
        target_id: &str,
        groups: &GroupSet,
    ) -> Result<(), StoreError> {
        let _guard = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let mut ops = Vec::new();
        for group in groups {
            for (k, _) in self
                .store
                .scan_prefix(&prefix(&[MEMBERSHIP_PREFIX, target_id, group.name()]))?
            {
                ops.push(BatchOp::Delete { key: k });
            }

            let mut seen = HashSet::new();
            for membership in group.members() {
                if !seen.insert(membership.user_id.as_str()) {
                    warn!(
                        target_id = %target_id,
                        group = %group.name(),
                        user = %membership.user_id,
                        "duplicate remote membership skipped"
                    );
                    continue;
                }
                ops.push(BatchOp::Put {
                    key: key(&[MEMBERSHIP_PREFIX, target_id, group.name(), &membership.user_id]),
                    value: membership.role.as_str().as_bytes().to_vec(),
                });
            }
        }
        debug!(target_id = %target_id, groups = groups.len(), "storing remote memberships");
        self.store.write_batch(ops)
    }

    /// Mirror the effect of successfully applied edits.
    pub fn apply_diffs(&self, target_id: &str, diffs: &[Difference]) -> Result<(), StoreError> {
        let _guard = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let mut ops = Vec::new();
        for diff in diffs {
            match diff {
                Difference::MemberAdd { group, user_id, role } => ops.push(BatchOp::Put {
                    key: key(&[MEMBERSHIP_PREFIX, target_id, &group.name, user_id]),
                    value: role.as_str().as_bytes().to_vec(),
                }),
                Difference::MemberDrop { group, user_id } => ops.push(BatchOp::Delete {
                    key: key(&[MEMBERSHIP_PREFIX, target_id, &group.name, user_id]),
                }),
                Difference::MemberRoleChange { group, user_id, role } => {
                    let k = key(&[MEMBERSHIP_PREFIX, target_id, &group.name, user_id]);
                    let earlier_add = ops
                        .iter()
                        .any(|op| matches!(op, BatchOp::Put { key: pending, .. } if *pending == k));
                    if earlier_add || self.store.get(&k)?.is_some() {
                        ops.push(BatchOp::Put {
                            key: k,
                            value: role.as_str().as_bytes().to_vec(),
                        });
                    }
                }
                Difference::MetadataChange { .. } => {}
            }
        }
        self.store.write_batch(ops)
    }

    /// Mirrored membership of one group on a target.
    pub fn remote_memberships(
        &self,
        target_id: &str,
        group: &str,
    ) -> Result<Vec<Membership>, StoreError> {
        let rows = self
            .store
            .scan_prefix(&prefix(&[MEMBERSHIP_PREFIX, target_id, group]))?;
        let mut out = Vec::with_capacity(rows.len());
        for (k, v) in rows {
            let role: Role = String::from_utf8_lossy(&v)
                .parse()
                .map_err(|e| StoreError::Kv(format!("corrupt membership row: {}", e)))?;
            out.push(Membership::new(last_part(&k), role));
        }
        Ok(out)
    }
}

impl TargetStore for ReplicationState {
    fn read_set(&self, target_id: &str, set_name: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .store
            .scan_prefix(&prefix(&[SET_PREFIX, target_id, set_name]))?
            .into_iter()
            .map(|(k, _)| last_part(&k))
            .collect())
    }

    fn write_set(
        &self,
        target_id: &str,
        set_name: &str,
        values: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let _guard = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let mut ops: Vec<BatchOp> = self
            .store
            .scan_prefix(&prefix(&[SET_PREFIX, target_id, set_name]))?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        ops.extend(values.iter().map(|value| BatchOp::Put {
            key: key(&[SET_PREFIX, target_id, set_name, value]),
            value: Vec::new(),
        }));
        self.store.write_batch(ops)
    }

    fn clear_set(&self, target_id: &str, set_name: &str) -> Result<(), StoreError> {
        self.write_set(target_id, set_name, &BTreeSet::new())
    }
}
