//! The per-pair reconciliation loop.
//!
//! One [`Replicator`] drives one (source, target) pair: poll the source for
//! changed groups, diff them against the target, apply the edits and advance
//! checkpoints. Repeatedly failing groups are backed off for a number of
//! cycles. The backoff bookkeeping lives only in memory and is reset on
//! restart; the durable failure counter in [`ReplicationState`] is an audit
//! trail, not an input.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use groupsync_core::{current_time_ms, diff, Difference, Group, GroupSet};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, SyncError};
use crate::monitoring::MonitoringSink;
use crate::source::GroupSource;
use crate::state::ReplicationState;
use crate::target::GroupTarget;

/// Look-back applied to the source checkpoint, covering clock skew and
/// transactions that committed just before the checkpoint was taken.
pub const UPDATE_MARGIN_MS: u64 = 5000;

/// Poll interval used when none (or zero) is configured.
pub const MIN_POLL_INTERVAL_MS: u64 = 60_000;

/// Default number of consecutive failures tolerated before a group is penalized.
pub const DEFAULT_ALLOWABLE_FAILURES: u64 = 3;

/// Default number of cycles a penalized group sits out.
pub const DEFAULT_FAILURE_PENALTY: u64 = 30;

/// Tunables for one replication pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatorSettings {
    /// Sleep between cycles in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive failures tolerated before the penalty applies.
    pub allowable_failures: u64,
    /// Cycles a penalized group is skipped for.
    pub failure_penalty: u64,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: MIN_POLL_INTERVAL_MS,
            allowable_failures: DEFAULT_ALLOWABLE_FAILURES,
            failure_penalty: DEFAULT_FAILURE_PENALTY,
        }
    }
}

/// In-memory backoff record for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Failure {
    /// Consecutive failed cycles.
    pub failure_count: u64,
    /// Remaining cycles to skip.
    pub current_penalty: u64,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing changed at the source; the source checkpoint advanced.
    NoUpdates,
    /// Every changed group is serving a penalty; no checkpoint moved.
    AllPenalized {
        /// Groups skipped this cycle.
        skipped: Vec<String>,
    },
    /// Diffs were computed and applied.
    Synced {
        /// Groups fully synced this cycle.
        synced: Vec<String>,
        /// Groups with at least one edit that did not apply.
        failed: Vec<String>,
    },
}

/// Reconciliation loop for one (source, target) pair.
pub struct Replicator {
    name: String,
    source: Arc<dyn GroupSource>,
    target: Arc<dyn GroupTarget>,
    state: Arc<ReplicationState>,
    settings: ReplicatorSettings,
    monitor: Arc<dyn MonitoringSink>,
    failures: HashMap<String, Failure>,
}

impl Replicator {
    /// Create a replicator. A zero poll interval is replaced by
    /// [`MIN_POLL_INTERVAL_MS`].
    pub fn new(
        source: Arc<dyn GroupSource>,
        target: Arc<dyn GroupTarget>,
        state: Arc<ReplicationState>,
        mut settings: ReplicatorSettings,
        monitor: Arc<dyn MonitoringSink>,
    ) -> Self {
        let name = format!("{} -> {}", source.id(), target.id());
        if settings.poll_interval_ms == 0 {
            warn!(
                replicator = %name,
                default_ms = MIN_POLL_INTERVAL_MS,
                "no poll interval configured, using default"
            );
            settings.poll_interval_ms = MIN_POLL_INTERVAL_MS;
        }
        Self {
            name,
            source,
            target,
            state,
            settings,
            monitor,
            failures: HashMap::new(),
        }
    }

    /// `"source -> target"`, used in logs and monitoring reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective settings.
    pub fn settings(&self) -> ReplicatorSettings {
        self.settings
    }

    /// Backoff record for a group, if it has failed since its last success.
    pub fn failure(&self, group: &str) -> Option<Failure> {
        self.failures.get(group).copied()
    }

    /// Run cycles until `shutdown` flips to true or its sender goes away.
    ///
    /// Shutdown is only observed while sleeping between cycles, so a cycle
    /// that has started always runs to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        info!(replicator = %self.name, interval_ms = self.settings.poll_interval_ms, "replicator started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
            self.tick().await;
        }
        info!(replicator = %self.name, "replicator stopped");
    }

    /// Run one cycle, containing any error it raises. Transient remote
    /// failures are logged; anything else is also sent to monitoring.
    pub async fn tick(&mut self) -> Option<CycleOutcome> {
        match self.run_cycle().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                match e.class() {
                    ErrorClass::Transient => {
                        warn!(replicator = %self.name, error = %e, "transient failure, retrying next cycle");
                    }
                    ErrorClass::Fatal => {
                        error!(replicator = %self.name, error = %e, "replication cycle failed");
                        self.monitor.record_failure(&self.name, &e);
                    }
                }
                None
            }
        }
    }

    /// One poll, diff, apply and checkpoint pass.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, SyncError> {
        let now = current_time_ms();
        let source_id = self.source.id().to_string();
        let target_id = self.target.id().to_string();

        let since = self
            .state
            .last_update_for_source(&source_id)?
            .saturating_sub(UPDATE_MARGIN_MS);
        info!(source = %source_id, since, "looking for updates");

        let mut updated = self.source.updated_groups_since(since).await?;
        debug!(source = %source_id, groups = %updated.summary(), "groups from source");

        // The source checkpoint only advances when everything is clean, so
        // groups synced by an earlier partial cycle show up again.
        let mut already_synced = Vec::new();
        for group in &updated {
            let synced_at = self.state.last_sync_time_for_group(&source_id, group.name())?;
            if synced_at > group.last_modified_ms() {
                info!(source = %source_id, group = %group.name(), "skipping previously synced group");
                already_synced.push(group.name().to_string());
            }
        }
        updated.remove_all(&already_synced);

        if updated.is_empty() {
            info!(source = %source_id, "no group updates found");
            self.state.mark_source_as_updated(&source_id, now)?;
            return Ok(CycleOutcome::NoUpdates);
        }

        let mut penalized = Vec::new();
        for group in &updated {
            if let Some(failure) = self.failures.get_mut(group.name()) {
                if failure.current_penalty > 0 {
                    failure.current_penalty -= 1;
                    info!(
                        group = %group.name(),
                        rounds_left = failure.current_penalty,
                        "skipping group due to failure penalty"
                    );
                    penalized.push(group.name().to_string());
                }
            }
        }
        updated.remove_all(&penalized);

        if updated.is_empty() {
            return Ok(CycleOutcome::AllPenalized { skipped: penalized });
        }

        let names = updated.names();
        let mut remote = self.target.fetch_groups_for_names(&names).await?;
        self.state.store_remote_memberships(&target_id, &remote)?;

        let mut new_groups = Vec::new();
        for group in &updated {
            if !remote.contains(group.name()) {
                remote.get_or_insert(Group::placeholder_for(group));
                new_groups.push(group.clone());
            }
        }
        debug!(target_id = %target_id, groups = %remote.summary(), "groups from target");

        self.target
            .create_new_groups(&new_groups, &*self.state)
            .await?;

        let diffs = diff(&remote, &updated)?;
        debug!(count = diffs.len(), "calculated differences");

        let applied = self.target.apply_diffs(&diffs, &*self.state).await?;
        self.state.apply_diffs(&target_id, &applied)?;

        let failed_groups = failed_group_names(&diffs, &applied);
        let (synced, failed) = self.settle(&source_id, &updated, &failed_groups, now).await?;

        if failed_groups.is_empty() && self.failures.is_empty() {
            info!(source = %source_id, "full sync succeeded");
            self.state.mark_source_as_updated(&source_id, now)?;
        } else {
            info!(
                source = %source_id,
                failed = failed_groups.len(),
                outstanding = self.failures.len(),
                "groups failed to fully sync"
            );
        }

        Ok(CycleOutcome::Synced { synced, failed })
    }

    /// Update backoff bookkeeping and checkpoints for every group worked on
    /// this cycle.
    async fn settle(
        &mut self,
        source_id: &str,
        working: &GroupSet,
        failed_groups: &HashSet<String>,
        now: u64,
    ) -> Result<(Vec<String>, Vec<String>), SyncError> {
        let mut synced = Vec::new();
        let mut failed = Vec::new();
        for group in working {
            let name = group.name();
            if failed_groups.contains(name) {
                let failure = self.failures.entry(name.to_string()).or_default();
                failure.failure_count += 1;
                if failure.failure_count > self.settings.allowable_failures {
                    failure.current_penalty = self.settings.failure_penalty;
                    info!(
                        group = %name,
                        allowable = self.settings.allowable_failures,
                        penalty = self.settings.failure_penalty,
                        "group exceeded allowable failures, backing off"
                    );
                }
                self.state.increment_failure_count(source_id, name)?;
                failed.push(name.to_string());
            } else {
                self.failures.remove(name);
                self.state.mark_group_as_synced(source_id, name, now)?;
                self.source.mark_group_as_synced(group).await?;
                synced.push(name.to_string());
            }
        }
        Ok((synced, failed))
    }
}

fn failed_group_names(diffs: &[Difference], applied: &[Difference]) -> HashSet<String> {
    let applied: HashSet<&Difference> = applied.iter().collect();
    diffs
        .iter()
        .filter(|d| !applied.contains(d))
        .map(|d| d.group_name().to_string())
        .collect()
}
