//! Group source over a JSON export of the group definition tables.
//!
//! The export looks like:
//!
//! ```json
//! {"groups": [{"group_id": "MATH:101", "description": "Calculus",
//!              "ready_for_sync_time": 1700000000000, "deleted": false,
//!              "members": [{"email": "alice@example.edu", "role": "viewer"}]}]}
//! ```
//!
//! Sync acknowledgements go to a sidecar `<path>.status.json` mapping group
//! name to the time it was last synced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use groupsync_core::{current_time_ms, Group, GroupSet, Role};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::source::GroupSource;

#[derive(Debug, Deserialize)]
struct Export {
    #[serde(default)]
    groups: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    group_id: String,
    #[serde(default)]
    description: String,
    ready_for_sync_time: u64,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    members: Vec<MemberRow>,
}

#[derive(Debug, Deserialize)]
struct MemberRow {
    email: String,
    role: String,
}

/// Reads groups from a JSON export file.
pub struct FileGroupSource {
    id: String,
    path: PathBuf,
    status_path: PathBuf,
    status_lock: Mutex<()>,
}

/// Lower-case, with `:` replaced so the name is a valid group key.
pub fn normalize_group_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace(':', "-")
}

fn parse_role(raw: &str) -> Option<Role> {
    if raw.eq_ignore_ascii_case("viewer") {
        return Some(Role::Member);
    }
    raw.parse().ok()
}

impl FileGroupSource {
    /// Source `id` reading `path`.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut status = path.clone().into_os_string();
        status.push(".status.json");
        Self {
            id: id.into(),
            path,
            status_path: PathBuf::from(status),
            status_lock: Mutex::new(()),
        }
    }

    /// Sidecar file holding sync acknowledgements.
    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    /// Acknowledged sync times by group name.
    pub async fn synced_groups(&self) -> Result<BTreeMap<String, u64>, SyncError> {
        match tokio::fs::read(&self.status_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn build_group(&self, row: GroupRow) -> Group {
        let name = normalize_group_name(&row.group_id);
        let mut group = Group::new(name, row.description).with_last_modified_ms(row.ready_for_sync_time);
        if row.deleted {
            debug!(source = %self.id, group = %group.name(), "group deleted at source, syncing as empty");
            return group;
        }
        for member in row.members {
            match parse_role(&member.role) {
                Some(role) => {
                    group.add_member(member.email.trim().to_lowercase(), role);
                }
                None => warn!(
                    source = %self.id,
                    group = %group.name(),
                    user = %member.email,
                    role = %member.role,
                    "skipping member with unknown role"
                ),
            }
        }
        group
    }
}

#[async_trait]
impl GroupSource for FileGroupSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn updated_groups_since(&self, since_ms: u64) -> Result<GroupSet, SyncError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let export: Export = serde_json::from_slice(&bytes)?;

        let mut result = GroupSet::new();
        for value in export.groups {
            let row: GroupRow = match serde_json::from_value(value) {
                Ok(row) => row,
                Err(e) => {
                    warn!(source = %self.id, error = %e, "skipping unreadable group row");
                    continue;
                }
            };
            if row.ready_for_sync_time < since_ms {
                continue;
            }
            let group = self.build_group(row);
            if result.contains(group.name()) {
                warn!(source = %self.id, group = %group.name(), "duplicate group row skipped");
                continue;
            }
            result.get_or_insert(group);
        }

        debug!(source = %self.id, since_ms, groups = result.len(), "read group export");
        Ok(result)
    }

    async fn mark_group_as_synced(&self, group: &Group) -> Result<(), SyncError> {
        let _guard = self.status_lock.lock().await;
        let mut status = self.synced_groups().await?;
        status.insert(group.name().to_string(), current_time_ms());

        let mut tmp = self.status_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&status)?).await?;
        tokio::fs::rename(&tmp, &self.status_path).await?;

        info!(source = %self.id, group = %group.name(), "marked group as synced");
        Ok(())
    }
}
