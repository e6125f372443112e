#![warn(missing_docs)]

//! GroupSync replication: source-to-target reconciliation loops, rate
//! limiting, durable checkpoints and the concrete adapters.

pub mod adapters;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod kvstore;
pub mod monitoring;
pub mod persistent_store;
pub mod ratelimit;
pub mod replicator;
pub mod source;
pub mod state;
pub mod target;

pub use config::GroupSyncConfig;
pub use error::{ErrorClass, SyncError};
pub use kvstore::{KvStore, MemoryKvStore, StoreError};
pub use monitoring::{FileMonitoringSink, MonitoringSink, NullMonitoringSink};
pub use persistent_store::PersistentKvStore;
pub use ratelimit::{RateLimitError, RateLimiter, RateLimiterRegistry};
pub use replicator::{CycleOutcome, Failure, Replicator, ReplicatorSettings};
pub use source::GroupSource;
pub use state::{GroupCheckpoint, ReplicationState, TargetStore};
pub use target::GroupTarget;
