//! External alerting for unexpected replication failures.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SyncError;

/// Receives failures that operators should be alerted about.
pub trait MonitoringSink: Send + Sync {
    /// Report a fatal error. `context` names the replication pair.
    fn record_failure(&self, context: &str, error: &SyncError);
}

/// Overwrites a single file with the most recent failure, for health checks
/// that alert when the file changes.
pub struct FileMonitoringSink {
    path: PathBuf,
}

impl FileMonitoringSink {
    /// Sink writing to `path`; parent directories are created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this sink writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(context: &str, error: &SyncError) -> String {
        let mut out = format!(
            "{} {}\n{}\n",
            groupsync_core::current_time_ms(),
            context,
            error
        );
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            let _ = writeln!(out, "caused by: {}", cause);
            source = cause.source();
        }
        out
    }

    fn write(&self, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, contents)
    }
}

impl MonitoringSink for FileMonitoringSink {
    fn record_failure(&self, context: &str, error: &SyncError) {
        if let Err(e) = self.write(&Self::render(context, error)) {
            debug!(path = %self.path.display(), error = %e, "could not write monitoring log");
        }
    }
}

/// Sink that drops every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitoringSink;

impl MonitoringSink for NullMonitoringSink {
    fn record_failure(&self, _context: &str, _error: &SyncError) {}
}
