//! In-memory membership snapshots.
//!
//! A [`GroupSet`] is a point-in-time picture of "who belongs to which group,
//! with what role" taken from either a source or a target. Snapshots are
//! rebuilt every reconciliation cycle and never carry identity across cycles.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::difference::Difference;
use crate::error::CoreError;

/// Kind of membership a user holds in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Ordinary member.
    Member,
    /// Group manager.
    Manager,
    /// Group owner.
    Owner,
}

impl Role {
    /// Upper-case wire/storage form of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "MEMBER",
            Role::Manager => "MANAGER",
            Role::Owner => "OWNER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEMBER" => Ok(Role::Member),
            "MANAGER" => Ok(Role::Manager),
            "OWNER" => Ok(Role::Owner),
            _ => Err(CoreError::UnknownRole {
                role: s.to_string(),
            }),
        }
    }
}

/// One user's membership in a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Membership {
    /// User identifier (typically an email address).
    pub user_id: String,
    /// The user's role in the group.
    pub role: Role,
}

impl Membership {
    /// Create a new membership.
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.user_id, self.role)
    }
}

/// A named group and its members.
///
/// The name is the natural key and never changes after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    name: String,
    description: String,
    last_modified_ms: u64,
    members: Vec<Membership>,
}

impl Group {
    /// Create an empty group stamped with the current time.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            last_modified_ms: current_time_ms(),
            members: Vec::new(),
        }
    }

    /// An empty group carrying the same name and description as `group`.
    pub fn placeholder_for(group: &Group) -> Self {
        Self::new(group.name.clone(), group.description.clone())
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Replace the description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// When the group last changed at its origin (epoch milliseconds).
    pub fn last_modified_ms(&self) -> u64 {
        self.last_modified_ms
    }

    /// Overwrite the last-modified time with the origin's own timestamp.
    pub fn set_last_modified_ms(&mut self, time_ms: u64) {
        self.last_modified_ms = time_ms;
    }

    /// Builder form of [`Group::set_last_modified_ms`].
    pub fn with_last_modified_ms(mut self, time_ms: u64) -> Self {
        self.last_modified_ms = time_ms;
        self
    }

    /// Members in insertion order.
    pub fn members(&self) -> &[Membership] {
        &self.members
    }

    /// Look up one user's membership.
    pub fn member(&self, user_id: &str) -> Option<&Membership> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Append a membership. Returns false (and keeps the first occurrence)
    /// when the user is already a member.
    pub fn add_member(&mut self, user_id: impl Into<String>, role: Role) -> bool {
        let user_id = user_id.into();
        if let Some(existing) = self.member(&user_id) {
            warn!(
                group = %self.name,
                user = %user_id,
                kept_role = %existing.role,
                skipped_role = %role,
                "duplicate membership collapsed to first occurrence"
            );
            return false;
        }
        self.members.push(Membership::new(user_id, role));
        true
    }

    /// Builder form of [`Group::add_member`].
    pub fn with_member(mut self, user_id: impl Into<String>, role: Role) -> Self {
        self.add_member(user_id, role);
        self
    }

    /// Remove a user's membership. Returns true if one was removed.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.user_id != user_id);
        self.members.len() != before
    }

    /// Change an existing member's role. Returns false if the user is not a member.
    pub fn set_member_role(&mut self, user_id: &str, role: Role) -> bool {
        match self.members.iter_mut().find(|m| m.user_id == user_id) {
            Some(m) => {
                m.role = role;
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({} members)", self.name, self.members.len())
    }
}

/// A snapshot: group name to group, names unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSet {
    groups: BTreeMap<String, Group>,
}

impl GroupSet {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `group` unless a group of the same name exists; either way
    /// return the entry stored under that name.
    pub fn get_or_insert(&mut self, group: Group) -> &mut Group {
        self.groups.entry(group.name.clone()).or_insert(group)
    }

    /// True if a group with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Look up a group, failing with [`CoreError::NotFound`] if absent.
    pub fn get(&self, name: &str) -> Result<&Group, CoreError> {
        self.groups.get(name).ok_or_else(|| CoreError::NotFound {
            group: name.to_string(),
        })
    }

    /// Mutable lookup, failing with [`CoreError::NotFound`] if absent.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Group, CoreError> {
        self.groups.get_mut(name).ok_or_else(|| CoreError::NotFound {
            group: name.to_string(),
        })
    }

    /// Remove every named group; names not present are ignored.
    pub fn remove_all<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.groups.remove(name.as_ref());
        }
    }

    /// All group names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Iterate over groups in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True if the snapshot holds no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// One-line summary for debug logging.
    pub fn summary(&self) -> String {
        self.groups
            .values()
            .map(|g| format!("{} ({} members)", g.name, g.members.len()))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Apply one edit to this snapshot.
    pub fn apply(&mut self, diff: &Difference) -> Result<(), CoreError> {
        let group = self.get_mut(diff.group_name())?;
        match diff {
            Difference::MetadataChange { group: target } => {
                group.set_description(target.description.clone());
            }
            Difference::MemberAdd { user_id, role, .. } => {
                group.add_member(user_id.clone(), *role);
            }
            Difference::MemberDrop { user_id, .. } => {
                group.remove_member(user_id);
            }
            Difference::MemberRoleChange { user_id, role, .. } => {
                group.set_member_role(user_id, *role);
            }
        }
        Ok(())
    }
}

impl FromIterator<Group> for GroupSet {
    fn from_iter<T: IntoIterator<Item = Group>>(iter: T) -> Self {
        let mut set = GroupSet::new();
        for group in iter {
            set.get_or_insert(group);
        }
        set
    }
}

impl<'a> IntoIterator for &'a GroupSet {
    type Item = &'a Group;
    type IntoIter = std::collections::btree_map::Values<'a, String, Group>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.values()
    }
}

/// Wall-clock time in epoch milliseconds.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
