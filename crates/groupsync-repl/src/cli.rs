//! Command-line interface of the `groupsync` binary.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info};

use crate::bootstrap::{build_replicators, open_state};
use crate::config::GroupSyncConfig;
use crate::error::SyncError;
use crate::monitoring::FileMonitoringSink;
use crate::state::ReplicationState;

/// `groupsync` arguments.
#[derive(Parser)]
#[command(name = "groupsync")]
#[command(about = "Keeps directory groups in line with their source of record", long_about = None)]
pub struct Cli {
    /// Configuration file (`.toml` or `.json`).
    #[arg(short, long, env = "GROUPSYNC_CONFIG", default_value = "/etc/groupsync/groupsync.toml")]
    pub config: PathBuf,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// `groupsync` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run every replication set until interrupted.
    Run,
    /// Print the checkpoints recorded for a source.
    Status {
        /// Source id.
        #[arg(short, long)]
        source: String,
    },
}

impl Cli {
    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run => run_replicators(&self.config).await,
            Command::Status { source } => {
                let config = GroupSyncConfig::from_file(&self.config)?;
                let state = open_state(&config.state)?;
                print!("{}", render_status(&state, &source)?);
                Ok(())
            }
        }
    }
}

async fn run_replicators(config_path: &Path) -> Result<()> {
    let config = GroupSyncConfig::load(config_path)?;
    let state = Arc::new(open_state(&config.state)?);
    let monitor = Arc::new(FileMonitoringSink::new(config.monitoring_log.clone()));
    let replicators = build_replicators(&config, state, monitor)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = replicators
        .into_iter()
        .map(|r| tokio::spawn(r.run(shutdown_rx.clone())))
        .collect();
    info!(replicators = handles.len(), "groupsync running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for in-flight cycles");
    let _ = shutdown_tx.send(true);

    for result in join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "replicator task failed");
        }
    }
    info!("groupsync stopped");
    Ok(())
}

/// Human-readable checkpoint report for one source.
pub fn render_status(state: &ReplicationState, source_id: &str) -> Result<String, SyncError> {
    let mut out = String::new();
    let _ = writeln!(out, "Source: {}", source_id);
    let _ = writeln!(
        out,
        "Last full sync: {}",
        state.last_update_for_source(source_id)?
    );
    let _ = writeln!(out, "{:<40} {:>15} {:>10}", "GROUP", "LAST SYNC (ms)", "FAILURES");
    let _ = writeln!(out, "{}", "-".repeat(67));
    for (group, checkpoint) in state.group_checkpoints(source_id)? {
        let _ = writeln!(
            out,
            "{:<40} {:>15} {:>10}",
            group, checkpoint.last_sync_time_ms, checkpoint.failure_count
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_command() {
        let cli = Cli::parse_from(["groupsync", "--config", "/tmp/g.toml", "status", "--source", "db"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/g.toml"));
        assert!(matches!(cli.command, Command::Status { ref source } if source == "db"));
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::parse_from(["groupsync", "-c", "x.json", "run"]);
        assert!(matches!(cli.command, Command::Run));
    }

    #[test]
    fn test_render_status() {
        let state = ReplicationState::memory();
        state.mark_source_as_updated("db", 5000).unwrap();
        state.mark_group_as_synced("db", "math-101", 4000).unwrap();
        state.increment_failure_count("db", "bio-200").unwrap();

        let report = render_status(&state, "db").unwrap();
        assert!(report.contains("Last full sync: 5000"));
        assert!(report.contains("math-101"));
        let bio = report.lines().find(|l| l.starts_with("bio-200")).unwrap();
        assert!(bio.trim_end().ends_with('1'));
        assert!(!report.contains("_GROUPSYNC_ALL_GROUPS_"));
    }
}
