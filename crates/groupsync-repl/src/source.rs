//! The authoritative side of a replication pair.
//!
//! A source is the system of record for group membership (a database export,
//! a learning-management system). The replicator polls it for groups changed
//! since its last checkpoint.

use async_trait::async_trait;
use groupsync_core::{Group, GroupSet};

use crate::error::SyncError;

/// Abstract source of authoritative group snapshots.
#[async_trait]
pub trait GroupSource: Send + Sync {
    /// Stable identifier, used as the checkpoint key in replication state.
    fn id(&self) -> &str;

    /// Groups changed at or after `since_ms` (epoch milliseconds).
    ///
    /// Best-effort: entries that cannot be read should be skipped and logged
    /// rather than failing the whole call.
    ///
    /// # Arguments
    /// * `since_ms` - Lower bound of the modification window.
    ///
    /// # Returns
    /// A snapshot of every changed group with its full membership.
    async fn updated_groups_since(&self, since_ms: u64) -> Result<GroupSet, SyncError>;

    /// Notification that `group` was fully synced to the target.
    ///
    /// Lets a source clear its own "pending" marker. May be a no-op.
    async fn mark_group_as_synced(&self, group: &Group) -> Result<(), SyncError>;
}
