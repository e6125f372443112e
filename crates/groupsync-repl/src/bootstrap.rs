//! Wiring configuration into running replicators.

use std::sync::Arc;

use tracing::info;

use crate::adapters::{DirectoryTarget, FileGroupSource};
use crate::config::{GroupSyncConfig, SourceConfig, StateBackend, StateConfig, TargetConfig};
use crate::error::SyncError;
use crate::kvstore::{KvStore, MemoryKvStore};
use crate::monitoring::MonitoringSink;
use crate::persistent_store::PersistentKvStore;
use crate::ratelimit::RateLimiterRegistry;
use crate::replicator::Replicator;
use crate::source::GroupSource;
use crate::state::ReplicationState;
use crate::target::GroupTarget;

/// Open the configured state backend.
pub fn open_state(config: &StateConfig) -> Result<ReplicationState, SyncError> {
    let store: Arc<dyn KvStore> = match config.backend {
        StateBackend::Memory => Arc::new(MemoryKvStore::new()),
        StateBackend::Persistent => Arc::new(PersistentKvStore::open_with(
            &config.dir,
            config.checkpoint_every,
        )?),
    };
    info!(backend = ?config.backend, dir = %config.dir.display(), "opened replication state");
    Ok(ReplicationState::new(store))
}

fn build_source(config: &SourceConfig) -> Arc<dyn GroupSource> {
    match config {
        SourceConfig::File(c) => Arc::new(FileGroupSource::new(c.id.clone(), c.path.clone())),
    }
}

fn build_target(
    config: &TargetConfig,
    limiters: &RateLimiterRegistry,
) -> Result<Arc<dyn GroupTarget>, SyncError> {
    match config {
        TargetConfig::Directory(c) => {
            let limiter = limiters.get_or_create(&c.credential, c.queries_per_timestep, c.timestep_ms);
            // The limiter may have been created by an earlier set with a smaller quota.
            if c.batch_size as u64 > limiter.quota() {
                return Err(SyncError::Config {
                    msg: format!(
                        "target '{}': batch_size {} exceeds quota {} shared by credential {}",
                        c.id,
                        c.batch_size,
                        limiter.quota(),
                        c.credential
                    ),
                });
            }
            Ok(Arc::new(DirectoryTarget::from_config(c, limiter)?))
        }
    }
}

/// One replicator per configured replication set. Targets authenticating
/// with the same credential share a rate limiter.
pub fn build_replicators(
    config: &GroupSyncConfig,
    state: Arc<ReplicationState>,
    monitor: Arc<dyn MonitoringSink>,
) -> Result<Vec<Replicator>, SyncError> {
    let limiters = RateLimiterRegistry::new();
    let mut replicators = Vec::with_capacity(config.replication_sets.len());
    for set in &config.replication_sets {
        let source = build_source(&set.source);
        let target = build_target(&set.target, &limiters)?;
        let replicator = Replicator::new(
            source,
            target,
            Arc::clone(&state),
            config.replicator_settings(set),
            Arc::clone(&monitor),
        );
        info!(set = %set.name, replicator = %replicator.name(), "configured replication set");
        replicators.push(replicator);
    }
    info!(
        replicators = replicators.len(),
        rate_limiters = limiters.len(),
        "replication sets ready"
    );
    Ok(replicators)
}
