//! Snapshot differ.
//!
//! Computes the minimal set of edits that turns a `current` snapshot into an
//! `authoritative` one. Callers must compare results as sets: the emission
//! order (metadata first, then per group adds/role changes before drops) is
//! not part of the contract.

use std::collections::HashMap;

use crate::difference::Difference;
use crate::error::CoreError;
use crate::model::{GroupSet, Membership};

/// Diff `current` against `authoritative`.
///
/// Every group in `authoritative` must already exist in `current`; seed
/// `current` with empty placeholders for groups the target does not have yet.
/// Groups only present in `current` are ignored.
pub fn diff(current: &GroupSet, authoritative: &GroupSet) -> Result<Vec<Difference>, CoreError> {
    let mut result = Vec::new();

    for wanted in authoritative {
        let have = current.get(wanted.name())?;
        if wanted.description() != have.description() {
            result.push(Difference::metadata_change(wanted));
        }
    }

    for wanted in authoritative {
        let have = current.get(wanted.name())?;

        let wanted_by_user = by_user(wanted.members());
        let have_by_user = by_user(have.members());

        for m in wanted.members() {
            match have_by_user.get(m.user_id.as_str()) {
                Some(existing) if existing.role != m.role => {
                    result.push(Difference::member_role_change(wanted, &m.user_id, m.role));
                }
                Some(_) => {}
                None => result.push(Difference::member_add(wanted, &m.user_id, m.role)),
            }
        }

        for m in have.members() {
            if !wanted_by_user.contains_key(m.user_id.as_str()) {
                result.push(Difference::member_drop(wanted, &m.user_id));
            }
        }
    }

    Ok(result)
}

fn by_user(members: &[Membership]) -> HashMap<&str, &Membership> {
    members.iter().map(|m| (m.user_id.as_str(), m)).collect()
}
