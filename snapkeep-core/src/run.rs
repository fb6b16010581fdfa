/*!
One snapkeep invocation: validate, resolve, snapshot and/or clean up.
*/

use crate::cleanup::{CleanupOptions, CleanupOrchestrator, CleanupVerdict};
use crate::config::SnapkeepConfig;
use crate::freeze::{FreezeRegistry, LocalHost};
use crate::inventory::{CloudInventory, Volume};
use crate::resolver::resolve_volumes;
use crate::retention::{RetentionClock, RetentionCutoff};
use crate::snapshot::{SnapshotOptions, SnapshotOrchestrator, VolumeOutcome};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Which orchestrators a run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Snapshot,
    Cleanup,
    /// Snapshot, then clean up
    Maintain,
}

impl RunMode {
    pub fn takes_snapshots(&self) -> bool {
        matches!(self, Self::Snapshot | Self::Maintain)
    }

    pub fn cleans_up(&self) -> bool {
        matches!(self, Self::Cleanup | Self::Maintain)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshot => "snapshot",
            Self::Cleanup => "cleanup",
            Self::Maintain => "maintain",
        };
        f.write_str(name)
    }
}

/// Everything a run decided, in processing order.
#[derive(Debug)]
pub struct RunReport {
    pub mode: RunMode,
    pub dry_run: bool,
    /// Resolved before any mutation; `None` for snapshot-only runs
    pub cutoff: Option<RetentionCutoff>,
    pub volumes: Vec<Volume>,
    pub snapshots: Vec<VolumeOutcome>,
    pub cleanup: Vec<CleanupVerdict>,
}

impl RunReport {
    fn new(mode: RunMode, dry_run: bool, cutoff: Option<RetentionCutoff>) -> Self {
        Self {
            mode,
            dry_run,
            cutoff,
            volumes: Vec::new(),
            snapshots: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    /// Per-volume and per-snapshot failures.
    pub fn failures(&self) -> usize {
        self.snapshots.iter().filter(|o| o.is_failure()).count()
            + self.cleanup.iter().filter(|v| v.is_failure()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failures() > 0
    }

    pub fn created(&self) -> usize {
        self.snapshots
            .iter()
            .filter(|o| matches!(o, VolumeOutcome::Created { .. }))
            .count()
    }

    pub fn deleted(&self) -> usize {
        self.cleanup.iter().filter(|v| v.is_deletion()).count()
    }
}

/// Execute one run.
///
/// The retention cutoff is resolved before volumes are discovered, so an
/// unparsable expression aborts without touching anything. Errors returned
/// here are fatal; per-entity failures are reported in the [`RunReport`].
pub fn run<I: CloudInventory + ?Sized>(
    mode: RunMode,
    config: &SnapkeepConfig,
    inventory: &I,
    host: &dyn LocalHost,
    registry: FreezeRegistry,
    clock: RetentionClock,
) -> Result<RunReport> {
    config.validate()?;

    let cutoff = if mode.cleans_up() {
        let cutoff = clock.resolve_policy(&config.retention)?;
        info!(cutoff = %cutoff.instant(), "Resolved retention cutoff");
        Some(cutoff)
    } else {
        None
    };

    info!(mode = %mode, dry_run = config.dry_run, "Starting run");
    let mut report = RunReport::new(mode, config.dry_run, cutoff);
    report.volumes = resolve_volumes(
        inventory,
        &config.instances,
        &config.volumes,
        &config.tag_list,
    )?;

    if mode.takes_snapshots() {
        let orchestrator = SnapshotOrchestrator::new(inventory, SnapshotOptions::from(config))
            .with_host(host)
            .with_registry(registry)
            .with_timestamp(clock.now());
        report.snapshots = orchestrator.run(&report.volumes)?;
    }

    if let Some(cutoff) = cutoff {
        let orchestrator = CleanupOrchestrator::new(inventory, CleanupOptions::from(config), cutoff);
        report.cleanup = orchestrator.run(&report.volumes)?;
    }

    info!(
        volumes = report.volumes.len(),
        created = report.created(),
        deleted = report.deleted(),
        failures = report.failures(),
        "Run finished"
    );
    Ok(report)
}
