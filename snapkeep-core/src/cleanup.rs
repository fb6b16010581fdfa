/*!
Cleanup orchestrator: enumerates each volume's snapshots and deletes the
expired ones that snapkeep owns.

Every snapshot passes three gates in order, stopping at the first that
excludes it:

1. ownership: every default tag key must be present
2. user filter: `matches_any` against the snapshot tag filter
3. age: created at or before the retention cutoff

The creation time is only read for snapshots that got past the first two.
*/

use crate::config::SnapkeepConfig;
use crate::inventory::{CloudInventory, Volume};
use crate::observability::{record, RunEvent};
use crate::retention::RetentionCutoff;
use crate::tags::{has_all, matches_any, required_keys, TagFilter};
use crate::{Result, SnapkeepError};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

/// Settings the cleanup orchestrator needs from the run configuration.
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Keys every deletable snapshot must carry
    pub required: Vec<TagFilter>,
    pub snapshot_tag_filter: Vec<TagFilter>,
    pub dry_run: bool,
}

impl From<&SnapkeepConfig> for CleanupOptions {
    fn from(config: &SnapkeepConfig) -> Self {
        Self {
            required: required_keys(&config.default_tags),
            snapshot_tag_filter: config.snapshot_tag_filter.clone(),
            dry_run: config.dry_run,
        }
    }
}

/// What cleanup decided for one snapshot.
#[derive(Debug)]
pub enum CleanupVerdict {
    /// Missing an ownership tag; never deleted.
    NotOwned { volume_id: String, snapshot_id: String },
    FilteredOut { volume_id: String, snapshot_id: String },
    Retained {
        volume_id: String,
        snapshot_id: String,
        created: DateTime<Utc>,
    },
    Deleted {
        volume_id: String,
        snapshot_id: String,
        created: DateTime<Utc>,
    },
    DryRunDeleted {
        volume_id: String,
        snapshot_id: String,
        created: DateTime<Utc>,
    },
    DeleteFailed {
        volume_id: String,
        snapshot_id: String,
        error: SnapkeepError,
    },
}

impl CleanupVerdict {
    pub fn volume_id(&self) -> &str {
        match self {
            Self::NotOwned { volume_id, .. }
            | Self::FilteredOut { volume_id, .. }
            | Self::Retained { volume_id, .. }
            | Self::Deleted { volume_id, .. }
            | Self::DryRunDeleted { volume_id, .. }
            | Self::DeleteFailed { volume_id, .. } => volume_id,
        }
    }

    pub fn snapshot_id(&self) -> &str {
        match self {
            Self::NotOwned { snapshot_id, .. }
            | Self::FilteredOut { snapshot_id, .. }
            | Self::Retained { snapshot_id, .. }
            | Self::Deleted { snapshot_id, .. }
            | Self::DryRunDeleted { snapshot_id, .. }
            | Self::DeleteFailed { snapshot_id, .. } => snapshot_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::DeleteFailed { .. })
    }

    /// True for snapshots that were, or in a dry run would have been, deleted.
    pub fn is_deletion(&self) -> bool {
        matches!(self, Self::Deleted { .. } | Self::DryRunDeleted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotOwned { .. } => "not owned",
            Self::FilteredOut { .. } => "filtered out",
            Self::Retained { .. } => "retained",
            Self::Deleted { .. } => "deleted",
            Self::DryRunDeleted { .. } => "dry run",
            Self::DeleteFailed { .. } => "failed",
        }
    }
}

/// Drives snapshot deletion volume by volume.
pub struct CleanupOrchestrator<'a, I: CloudInventory + ?Sized> {
    inventory: &'a I,
    options: CleanupOptions,
    cutoff: RetentionCutoff,
}

impl<'a, I: CloudInventory + ?Sized> CleanupOrchestrator<'a, I> {
    pub fn new(inventory: &'a I, options: CleanupOptions, cutoff: RetentionCutoff) -> Self {
        Self {
            inventory,
            options,
            cutoff,
        }
    }

    pub fn run(&self, volumes: &[Volume]) -> Result<Vec<CleanupVerdict>> {
        let mut verdicts = Vec::new();
        for volume in volumes {
            verdicts.extend(self.process_volume(&volume.id)?);
        }
        Ok(verdicts)
    }

    /// Evaluate and purge the snapshots of one volume.
    ///
    /// Read failures abort; a failed delete is recorded and the remaining
    /// snapshots are still processed.
    pub fn process_volume(&self, volume_id: &str) -> Result<Vec<CleanupVerdict>> {
        let snapshot_ids = self.inventory.list_snapshots_for_volume(volume_id)?;
        debug!(volume_id = %volume_id, count = snapshot_ids.len(), "Listed snapshots");

        snapshot_ids
            .iter()
            .map(|snapshot_id| self.process_snapshot(volume_id, snapshot_id))
            .collect()
    }

    fn process_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<CleanupVerdict> {
        let volume_id = volume_id.to_string();
        let tags = self.inventory.get_snapshot_tags(snapshot_id)?;

        if !has_all(&tags, &self.options.required) {
            debug!(snapshot_id = %snapshot_id, "Snapshot lacks ownership tags, keeping");
            return Ok(CleanupVerdict::NotOwned {
                volume_id,
                snapshot_id: snapshot_id.to_string(),
            });
        }

        if !matches_any(&tags, &self.options.snapshot_tag_filter) {
            debug!(snapshot_id = %snapshot_id, "Snapshot excluded by tag filter, keeping");
            return Ok(CleanupVerdict::FilteredOut {
                volume_id,
                snapshot_id: snapshot_id.to_string(),
            });
        }

        let created = self.inventory.get_snapshot_creation_time(snapshot_id)?;
        let snapshot_id = snapshot_id.to_string();
        if !self.cutoff.is_expired(created) {
            debug!(
                snapshot_id = %snapshot_id,
                created = %created,
                cutoff = %self.cutoff.instant(),
                "Snapshot within retention, keeping"
            );
            return Ok(CleanupVerdict::Retained {
                volume_id,
                snapshot_id,
                created,
            });
        }

        if self.options.dry_run {
            info!(volume_id = %volume_id, snapshot_id = %snapshot_id, created = %created, "[dry run] Would delete snapshot");
            return Ok(CleanupVerdict::DryRunDeleted {
                volume_id,
                snapshot_id,
                created,
            });
        }

        match self.inventory.delete_snapshot(&snapshot_id) {
            Ok(()) => {
                info!(volume_id = %volume_id, snapshot_id = %snapshot_id, created = %created, "Deleted expired snapshot");
                record(RunEvent::SnapshotDeleted);
                Ok(CleanupVerdict::Deleted {
                    volume_id,
                    snapshot_id,
                    created,
                })
            }
            Err(e) => {
                let error = SnapkeepError::SnapshotDeletionFailed {
                    snapshot_id: snapshot_id.clone(),
                    reason: e.to_string(),
                };
                error!(volume_id = %volume_id, stage = "delete_snapshot", error = %error, "Snapshot deletion failed");
                record(RunEvent::Failure);
                Ok(CleanupVerdict::DeleteFailed {
                    volume_id,
                    snapshot_id,
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryOp, MemoryInventory, MockCloudInventory, Snapshot};
    use crate::tags::Tags;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
    }

    fn owned() -> Tags {
        Tags::from([("CreatedBy".to_string(), "AutomatedBackup".to_string())])
    }

    fn options() -> CleanupOptions {
        CleanupOptions {
            required: required_keys(&owned()),
            ..CleanupOptions::default()
        }
    }

    fn week_cutoff() -> RetentionCutoff {
        RetentionCutoff::Before(now() - Duration::days(7))
    }

    fn add(inventory: &MemoryInventory, id: &str, age_days: i64, tags: Tags) {
        inventory.add_snapshot(Snapshot {
            id: id.to_string(),
            volume_id: "vol-a".to_string(),
            created: now() - Duration::days(age_days),
            tags,
        });
    }

    #[test]
    fn test_gates_apply_in_order() {
        let inventory = MemoryInventory::new();
        let mut gold = owned();
        gold.insert("tier".to_string(), "gold".to_string());
        add(&inventory, "snap-old-owned", 10, owned());
        add(&inventory, "snap-old-foreign", 30, Tags::new());
        add(&inventory, "snap-new-gold", 2, gold.clone());
        add(&inventory, "snap-old-gold", 10, gold);

        let orchestrator = CleanupOrchestrator::new(
            &inventory,
            CleanupOptions {
                snapshot_tag_filter: vec![TagFilter::equals("tier", "gold")],
                ..options()
            },
            week_cutoff(),
        );

        let verdicts = orchestrator.process_volume("vol-a").unwrap();
        let labels: Vec<_> = verdicts.iter().map(|v| (v.snapshot_id(), v.label())).collect();
        assert_eq!(
            labels,
            vec![
                ("snap-old-owned", "filtered out"),
                ("snap-old-foreign", "not owned"),
                ("snap-new-gold", "retained"),
                ("snap-old-gold", "deleted"),
            ]
        );
        assert_eq!(inventory.snapshot_ids().len(), 3);
        // Creation time is only read past the ownership and filter gates.
        assert_eq!(inventory.calls_to(InventoryOp::GetSnapshotCreationTime), 2);
    }

    #[test]
    fn test_cutoff_is_inclusive() {
        let inventory = MemoryInventory::new();
        add(&inventory, "snap-edge", 7, owned());

        let orchestrator = CleanupOrchestrator::new(&inventory, options(), week_cutoff());
        let verdicts = orchestrator.process_volume("vol-a").unwrap();
        assert!(verdicts[0].is_deletion());
    }

    #[test]
    fn test_no_max_date_leaves_only_tag_gates() {
        let inventory = MemoryInventory::new();
        add(&inventory, "snap-fresh", 0, owned());
        add(&inventory, "snap-foreign", 400, Tags::new());

        let orchestrator =
            CleanupOrchestrator::new(&inventory, options(), RetentionCutoff::NoMaxDate);
        let verdicts = orchestrator.process_volume("vol-a").unwrap();

        assert!(matches!(verdicts[0], CleanupVerdict::Deleted { .. }));
        assert!(matches!(verdicts[1], CleanupVerdict::NotOwned { .. }));
    }

    #[test]
    fn test_dry_run_only_reads() {
        let inventory = MemoryInventory::new();
        add(&inventory, "snap-old", 10, owned());

        let orchestrator = CleanupOrchestrator::new(
            &inventory,
            CleanupOptions {
                dry_run: true,
                ..options()
            },
            week_cutoff(),
        );

        let verdicts = orchestrator.process_volume("vol-a").unwrap();
        assert!(matches!(verdicts[0], CleanupVerdict::DryRunDeleted { .. }));
        assert!(inventory.mutations().is_empty());
        assert!(inventory.snapshot("snap-old").is_some());
    }

    #[test]
    fn test_delete_failure_does_not_stop_volume() {
        let inventory = MemoryInventory::new();
        add(&inventory, "snap-1", 10, owned());
        add(&inventory, "snap-2", 12, owned());
        inventory.fail_on(InventoryOp::DeleteSnapshot, "snap-1");

        let orchestrator = CleanupOrchestrator::new(&inventory, options(), week_cutoff());
        let verdicts = orchestrator.process_volume("vol-a").unwrap();

        assert!(verdicts[0].is_failure());
        assert!(matches!(
            &verdicts[0],
            CleanupVerdict::DeleteFailed {
                error: SnapkeepError::SnapshotDeletionFailed { snapshot_id, .. },
                ..
            } if snapshot_id == "snap-1"
        ));
        assert!(matches!(verdicts[1], CleanupVerdict::Deleted { .. }));
        assert_eq!(inventory.snapshot_ids(), vec!["snap-1"]);
    }

    #[test]
    fn test_listing_failure_is_fatal() {
        let mut inventory = MockCloudInventory::new();
        inventory
            .expect_list_snapshots_for_volume()
            .returning(|_| Err(SnapkeepError::inventory("unauthorized")));
        inventory.expect_delete_snapshot().never();

        let orchestrator = CleanupOrchestrator::new(&inventory, options(), week_cutoff());
        assert!(orchestrator.process_volume("vol-a").is_err());
    }
}
