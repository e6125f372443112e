//! The mirrored side of a replication pair.

use async_trait::async_trait;
use groupsync_core::{Difference, Group, GroupSet};

use crate::error::SyncError;
use crate::state::TargetStore;

/// Abstract group-hosting service kept in line with a source.
///
/// Implementations rate-limit their own remote calls and use the
/// [`TargetStore`] named sets to make multi-step mutations resumable.
#[async_trait]
pub trait GroupTarget: Send + Sync {
    /// Stable identifier, used as the key for mirrored memberships and WAL sets.
    fn id(&self) -> &str;

    /// Current remote state of the named groups.
    ///
    /// # Arguments
    /// * `names` - Group names to look up.
    ///
    /// # Returns
    /// A snapshot holding only the groups that exist remotely.
    async fn fetch_groups_for_names(&self, names: &[String]) -> Result<GroupSet, SyncError>;

    /// Create groups that do not exist yet and apply their default settings.
    ///
    /// Creation and configuration are separate remote operations; an
    /// implementation must record pending work in `store` before the first
    /// one so a restart between them can resume.
    async fn create_new_groups(
        &self,
        groups: &[Group],
        store: &dyn TargetStore,
    ) -> Result<(), SyncError>;

    /// Apply edits remotely.
    ///
    /// # Returns
    /// The subset of `diffs` that was applied. Partial success is normal.
    async fn apply_diffs(
        &self,
        diffs: &[Difference],
        store: &dyn TargetStore,
    ) -> Result<Vec<Difference>, SyncError>;
}
