//! Edit operations that move a target snapshot toward a source snapshot.

use std::fmt;

use crate::model::{Group, Role};

/// Value-level identity of the group an edit refers to.
///
/// Captured from the authoritative group when the edit is computed, so a
/// [`Difference`] can only exist for a group that was present in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupRef {
    /// Group name (natural key).
    pub name: String,
    /// Group description at the time the edit was computed.
    pub description: String,
}

impl From<&Group> for GroupRef {
    fn from(group: &Group) -> Self {
        Self {
            name: group.name().to_string(),
            description: group.description().to_string(),
        }
    }
}

/// Category of a [`Difference`], for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DifferenceKind {
    /// Group metadata (description) change.
    MetadataChange,
    /// Member addition.
    MemberAdd,
    /// Member removal.
    MemberDrop,
    /// Member role change.
    MemberRoleChange,
}

/// One atomic edit. Immutable once computed; equal by tag and fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Difference {
    /// The group's description must be updated.
    MetadataChange {
        /// Group to update, carrying the new description.
        group: GroupRef,
    },
    /// A user must be added with the given role.
    MemberAdd {
        /// Target group.
        group: GroupRef,
        /// User to add.
        user_id: String,
        /// Role to grant.
        role: Role,
    },
    /// A user must be removed.
    MemberDrop {
        /// Target group.
        group: GroupRef,
        /// User to remove.
        user_id: String,
    },
    /// An existing member's role must change.
    MemberRoleChange {
        /// Target group.
        group: GroupRef,
        /// Member whose role changes.
        user_id: String,
        /// The new role.
        role: Role,
    },
}

impl Difference {
    /// Metadata change for `group`.
    pub fn metadata_change(group: &Group) -> Self {
        Difference::MetadataChange {
            group: group.into(),
        }
    }

    /// Member addition to `group`.
    pub fn member_add(group: &Group, user_id: impl Into<String>, role: Role) -> Self {
        Difference::MemberAdd {
            group: group.into(),
            user_id: user_id.into(),
            role,
        }
    }

    /// Member removal from `group`.
    pub fn member_drop(group: &Group, user_id: impl Into<String>) -> Self {
        Difference::MemberDrop {
            group: group.into(),
            user_id: user_id.into(),
        }
    }

    /// Role change within `group`.
    pub fn member_role_change(group: &Group, user_id: impl Into<String>, role: Role) -> Self {
        Difference::MemberRoleChange {
            group: group.into(),
            user_id: user_id.into(),
            role,
        }
    }

    /// The group this edit applies to.
    pub fn group(&self) -> &GroupRef {
        match self {
            Difference::MetadataChange { group }
            | Difference::MemberAdd { group, .. }
            | Difference::MemberDrop { group, .. }
            | Difference::MemberRoleChange { group, .. } => group,
        }
    }

    /// Shorthand for `self.group().name`.
    pub fn group_name(&self) -> &str {
        &self.group().name
    }

    /// The affected user, for membership edits.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Difference::MetadataChange { .. } => None,
            Difference::MemberAdd { user_id, .. }
            | Difference::MemberDrop { user_id, .. }
            | Difference::MemberRoleChange { user_id, .. } => Some(user_id),
        }
    }

    /// The edit's category.
    pub fn kind(&self) -> DifferenceKind {
        match self {
            Difference::MetadataChange { .. } => DifferenceKind::MetadataChange,
            Difference::MemberAdd { .. } => DifferenceKind::MemberAdd,
            Difference::MemberDrop { .. } => DifferenceKind::MemberDrop,
            Difference::MemberRoleChange { .. } => DifferenceKind::MemberRoleChange,
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::MetadataChange { group } => {
                write!(f, "MetadataChange(group: {})", group.name)
            }
            Difference::MemberAdd {
                group,
                user_id,
                role,
            } => write!(f, "MemberAdd({}[{}] group: {})", user_id, role, group.name),
            Difference::MemberDrop { group, user_id } => {
                write!(f, "MemberDrop({} group: {})", user_id, group.name)
            }
            Difference::MemberRoleChange {
                group,
                user_id,
                role,
            } => write!(
                f,
                "MemberRoleChange({}[{}] group: {})",
                user_id, role, group.name
            ),
        }
    }
}
