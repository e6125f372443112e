//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use groupsync_core::{Difference, Group, GroupSet};
use groupsync_repl::{
    GroupSource, GroupTarget, MonitoringSink, ReplicationState, Replicator, ReplicatorSettings,
    SyncError, TargetStore,
};

/// Name of the WAL set the in-memory target uses.
pub const PENDING_SETTINGS: &str = "GROUPS_NEEDING_SETTINGS";

/// A remote failure to inject: (HTTP status, message).
pub type InjectedError = (Option<u16>, String);

/// Source whose snapshot is set by the test.
pub struct ScriptedSource {
    id: String,
    groups: Mutex<GroupSet>,
    queries: Mutex<Vec<u64>>,
    synced: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            groups: Mutex::new(GroupSet::new()),
            queries: Mutex::new(Vec::new()),
            synced: Mutex::new(Vec::new()),
        }
    }

    pub fn set_groups(&self, groups: Vec<Group>) {
        *self.groups.lock().unwrap() = groups.into_iter().collect();
    }

    /// The `since` argument of every poll so far.
    pub fn queries(&self) -> Vec<u64> {
        self.queries.lock().unwrap().clone()
    }

    /// Groups acknowledged through `mark_group_as_synced`.
    pub fn synced(&self) -> Vec<String> {
        self.synced.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupSource for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn updated_groups_since(&self, since_ms: u64) -> Result<GroupSet, SyncError> {
        self.queries.lock().unwrap().push(since_ms);
        Ok(self
            .groups
            .lock()
            .unwrap()
            .iter()
            .filter(|g| g.last_modified_ms() >= since_ms)
            .cloned()
            .collect())
    }

    async fn mark_group_as_synced(&self, group: &Group) -> Result<(), SyncError> {
        self.synced.lock().unwrap().push(group.name().to_string());
        Ok(())
    }
}

/// Target holding its groups in memory, with failure injection.
pub struct MemoryTarget {
    id: String,
    groups: Mutex<GroupSet>,
    created: Mutex<Vec<String>>,
    configured: Mutex<BTreeSet<String>>,
    applied: Mutex<Vec<Difference>>,
    failing_groups: Mutex<HashSet<String>>,
    fetch_error: Mutex<Option<InjectedError>>,
    fail_settings: Mutex<bool>,
}

impl MemoryTarget {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            groups: Mutex::new(GroupSet::new()),
            created: Mutex::new(Vec::new()),
            configured: Mutex::new(BTreeSet::new()),
            applied: Mutex::new(Vec::new()),
            failing_groups: Mutex::new(HashSet::new()),
            fetch_error: Mutex::new(None),
            fail_settings: Mutex::new(false),
        }
    }

    pub fn set_groups(&self, groups: Vec<Group>) {
        *self.groups.lock().unwrap() = groups.into_iter().collect();
    }

    pub fn group(&self, name: &str) -> Option<Group> {
        self.groups.lock().unwrap().get(name).ok().cloned()
    }

    /// Edits to groups named here are refused.
    pub fn fail_group(&self, name: &str) {
        self.failing_groups.lock().unwrap().insert(name.to_string());
    }

    pub fn heal_group(&self, name: &str) {
        self.failing_groups.lock().unwrap().remove(name);
    }

    /// Make every fetch fail with this error until cleared.
    pub fn fail_fetch(&self, error: Option<InjectedError>) {
        *self.fetch_error.lock().unwrap() = error;
    }

    pub fn fail_settings(&self, fail: bool) {
        *self.fail_settings.lock().unwrap() = fail;
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn configured(&self) -> BTreeSet<String> {
        self.configured.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<Difference> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupTarget for MemoryTarget {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_groups_for_names(&self, names: &[String]) -> Result<GroupSet, SyncError> {
        if let Some((status, msg)) = self.fetch_error.lock().unwrap().clone() {
            return Err(SyncError::remote(status, msg));
        }
        let groups = self.groups.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|n| groups.get(n).ok().cloned())
            .collect())
    }

    async fn create_new_groups(
        &self,
        groups: &[Group],
        store: &dyn TargetStore,
    ) -> Result<(), SyncError> {
        let mut pending = store.read_set(&self.id, PENDING_SETTINGS)?;
        if !groups.is_empty() {
            pending.extend(groups.iter().map(|g| g.name().to_string()));
            store.write_set(&self.id, PENDING_SETTINGS, &pending)?;
            let mut remote = self.groups.lock().unwrap();
            for group in groups {
                remote.get_or_insert(Group::placeholder_for(group));
                self.created.lock().unwrap().push(group.name().to_string());
            }
        }

        if *self.fail_settings.lock().unwrap() {
            return Err(SyncError::remote(None, "settings call failed"));
        }
        self.configured.lock().unwrap().extend(pending);
        store.clear_set(&self.id, PENDING_SETTINGS)?;
        Ok(())
    }

    async fn apply_diffs(
        &self,
        diffs: &[Difference],
        _store: &dyn TargetStore,
    ) -> Result<Vec<Difference>, SyncError> {
        let failing = self.failing_groups.lock().unwrap().clone();
        let mut groups = self.groups.lock().unwrap();
        let mut applied = Vec::new();
        for diff in diffs {
            if failing.contains(diff.group_name()) {
                continue;
            }
            groups.apply(diff)?;
            applied.push(diff.clone());
        }
        self.applied.lock().unwrap().extend(applied.iter().cloned());
        Ok(applied)
    }
}

/// Monitoring sink that remembers what it was told.
#[derive(Default)]
pub struct RecordingMonitor {
    failures: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

impl MonitoringSink for RecordingMonitor {
    fn record_failure(&self, context: &str, error: &SyncError) {
        self.failures
            .lock()
            .unwrap()
            .push(format!("{}: {}", context, error));
    }
}

/// One replication pair wired to in-memory collaborators.
pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub target: Arc<MemoryTarget>,
    pub state: Arc<ReplicationState>,
    pub monitor: Arc<RecordingMonitor>,
    pub replicator: Replicator,
}

impl Harness {
    pub fn new(settings: ReplicatorSettings) -> Self {
        let source = Arc::new(ScriptedSource::new("db"));
        let target = Arc::new(MemoryTarget::new("dir"));
        let state = Arc::new(ReplicationState::memory());
        let monitor = Arc::new(RecordingMonitor::default());
        let replicator = Replicator::new(
            source.clone(),
            target.clone(),
            state.clone(),
            settings,
            monitor.clone(),
        );
        Self {
            source,
            target,
            state,
            monitor,
            replicator,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(ReplicatorSettings::default())
    }
}

/// A source-side group with a fixed, old modification time.
pub fn source_group(name: &str, description: &str) -> Group {
    Group::new(name, description).with_last_modified_ms(1_000)
}
