/*!
Snapshot orchestrator.

Each volume goes through

```text
Discovered -> TagsLoaded -> FilteredOut
                         -> Eligible -> DryRunSkipped
                                     -> [Frozen] -> SnapshotCreated -> [Thawed] -> TagsApplied
```

The freeze bracket is optional and only applies when the volume is attached
to the machine snapkeep runs on. The thaw happens right after the create
call returns, whether it succeeded or not. A failed thaw does not stop the
new snapshot from being tagged; it is reported on the volume's outcome.
*/

use crate::config::SnapkeepConfig;
use crate::freeze::{DetachedHost, FreezeGuard, FreezeRegistry, FsFreeze, LocalHost};
use crate::inventory::{Attachment, CloudInventory, Volume};
use crate::observability::{record, RunEvent};
use crate::propagate::compute_snapshot_tags;
use crate::tags::{matches_any, TagFilter, TagMapEntry, Tags};
use crate::{Result, SnapkeepError};
use chrono::{DateTime, Utc};
use once_cell::unsync::OnceCell;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static DETACHED: DetachedHost = DetachedHost;

/// Settings the snapshot orchestrator needs from the run configuration.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub tag_list: Vec<TagFilter>,
    pub tag_map: Vec<TagMapEntry>,
    pub default_tags: Tags,
    pub extra_tags: Tags,
    pub dry_run: bool,
    pub freeze_filesystems: bool,
}

impl From<&SnapkeepConfig> for SnapshotOptions {
    fn from(config: &SnapkeepConfig) -> Self {
        Self {
            tag_list: config.tag_list.clone(),
            tag_map: config.tag_map.clone(),
            default_tags: config.default_tags.clone(),
            extra_tags: config.extra_tags.clone(),
            dry_run: config.dry_run,
            freeze_filesystems: config.freeze_filesystems,
        }
    }
}

/// Terminal state of one volume's snapshot cycle.
#[derive(Debug)]
pub enum VolumeOutcome {
    FilteredOut {
        volume_id: String,
    },
    /// Not attached anywhere, so there is nothing to name the snapshot after.
    Unattached {
        volume_id: String,
    },
    DryRunSkipped {
        volume_id: String,
        snapshot_id: String,
        tags: Tags,
    },
    Created {
        volume_id: String,
        snapshot_id: String,
        tags: Tags,
        /// Tags that could not be written; the snapshot itself is kept.
        tag_failures: Vec<SnapkeepError>,
        /// The filesystem could not be thawed after the create call.
        thaw_error: Option<SnapkeepError>,
    },
    Failed {
        volume_id: String,
        error: SnapkeepError,
    },
}

impl VolumeOutcome {
    pub fn volume_id(&self) -> &str {
        match self {
            Self::FilteredOut { volume_id }
            | Self::Unattached { volume_id }
            | Self::DryRunSkipped { volume_id, .. }
            | Self::Created { volume_id, .. }
            | Self::Failed { volume_id, .. } => volume_id,
        }
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            Self::DryRunSkipped { snapshot_id, .. } | Self::Created { snapshot_id, .. } => {
                Some(snapshot_id)
            }
            _ => None,
        }
    }

    /// True when the volume's cycle failed, a tag could not be written or
    /// the thaw failed.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Failed { .. } => true,
            Self::Created {
                tag_failures,
                thaw_error,
                ..
            } => !tag_failures.is_empty() || thaw_error.is_some(),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FilteredOut { .. } => "filtered out",
            Self::Unattached { .. } => "unattached",
            Self::DryRunSkipped { .. } => "dry run",
            Self::Created { thaw_error: Some(_), .. } => "created, thaw failed",
            Self::Created { tag_failures, .. } if tag_failures.is_empty() => "created",
            Self::Created { .. } => "created, tags incomplete",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Human-readable snapshot description: `<instance>_<device>_<timestamp>`.
pub fn snapshot_description(attachment: &Attachment, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        attachment.instance_id,
        attachment.device,
        at.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

/// Placeholder id reported for snapshots a dry run would have created.
pub fn dry_run_snapshot_id() -> String {
    format!("snap-dryrun-{}", Uuid::new_v4().simple())
}

/// Drives snapshot creation volume by volume.
///
/// Owns the run's [`FreezeRegistry`]; anything still frozen when the
/// orchestrator is dropped gets thawed.
pub struct SnapshotOrchestrator<'a, I: CloudInventory + ?Sized> {
    inventory: &'a I,
    options: SnapshotOptions,
    host: &'a dyn LocalHost,
    registry: FreezeRegistry,
    timestamp: Option<DateTime<Utc>>,
    local_instance: OnceCell<Option<String>>,
}

impl<'a, I: CloudInventory + ?Sized> SnapshotOrchestrator<'a, I> {
    /// Orchestrator that never considers itself local, backed by `fsfreeze`.
    pub fn new(inventory: &'a I, options: SnapshotOptions) -> Self {
        Self {
            inventory,
            options,
            host: &DETACHED,
            registry: FreezeRegistry::new(FsFreeze),
            timestamp: None,
            local_instance: OnceCell::new(),
        }
    }

    pub fn with_host(mut self, host: &'a dyn LocalHost) -> Self {
        self.host = host;
        self.local_instance = OnceCell::new();
        self
    }

    /// Use a registry created elsewhere, e.g. one a signal hook also holds.
    pub fn with_registry(mut self, registry: FreezeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Pin the timestamp used in snapshot descriptions.
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Snapshot every volume in order. Stops only on fatal errors.
    pub fn run(&self, volumes: &[Volume]) -> Result<Vec<VolumeOutcome>> {
        let mut outcomes = Vec::with_capacity(volumes.len());
        for volume in volumes {
            outcomes.push(self.process_volume(&volume.id)?);
        }
        Ok(outcomes)
    }

    /// Run one volume through the snapshot cycle.
    ///
    /// Read failures are returned as errors. A failed create or thaw is
    /// reported on the outcome so the run can go on.
    pub fn process_volume(&self, volume_id: &str) -> Result<VolumeOutcome> {
        let volume_tags = self.inventory.get_volume_tags(volume_id)?;
        if !matches_any(&volume_tags, &self.options.tag_list) {
            info!(volume_id = %volume_id, "Volume excluded by tag filter, not snapshotting");
            record(RunEvent::VolumeFiltered);
            return Ok(VolumeOutcome::FilteredOut {
                volume_id: volume_id.to_string(),
            });
        }

        let attachment = match self.inventory.get_volume_attachment(volume_id)? {
            Some(attachment) => attachment,
            None => {
                warn!(volume_id = %volume_id, "Volume is not attached, skipping");
                return Ok(VolumeOutcome::Unattached {
                    volume_id: volume_id.to_string(),
                });
            }
        };

        let tags = compute_snapshot_tags(
            &volume_tags,
            &self.options.default_tags,
            &self.options.extra_tags,
            &self.options.tag_map,
        );
        let description =
            snapshot_description(&attachment, self.timestamp.unwrap_or_else(Utc::now));
        let freeze_target = self.freeze_target(volume_id, &attachment);

        if self.options.dry_run {
            let snapshot_id = dry_run_snapshot_id();
            if let Some(mount) = &freeze_target {
                info!(volume_id = %volume_id, mount = %mount.display(), "[dry run] Would freeze filesystem");
            }
            info!(
                volume_id = %volume_id,
                snapshot_id = %snapshot_id,
                description = %description,
                "[dry run] Would create snapshot"
            );
            for (key, value) in &tags {
                info!(snapshot_id = %snapshot_id, key = %key, value = %value, "[dry run] Would tag snapshot");
            }
            return Ok(VolumeOutcome::DryRunSkipped {
                volume_id: volume_id.to_string(),
                snapshot_id,
                tags,
            });
        }

        let guard = freeze_target.and_then(|mount| self.freeze(volume_id, mount));
        let created = self.inventory.create_snapshot(volume_id, &description);
        let thaw_error = guard.and_then(|guard| guard.release().err());
        if let Some(e) = &thaw_error {
            error!(volume_id = %volume_id, stage = "thaw", error = %e, "Filesystem thaw failed");
            record(RunEvent::Failure);
        }

        let snapshot_id = match created {
            Ok(snapshot_id) => snapshot_id,
            Err(e) => {
                let error = SnapkeepError::SnapshotCreationFailed {
                    volume_id: volume_id.to_string(),
                    reason: e.to_string(),
                };
                error!(volume_id = %volume_id, stage = "create_snapshot", error = %error, "Snapshot failed");
                record(RunEvent::Failure);
                return Ok(VolumeOutcome::Failed {
                    volume_id: volume_id.to_string(),
                    error,
                });
            }
        };
        info!(volume_id = %volume_id, snapshot_id = %snapshot_id, description = %description, "Snapshot created");
        record(RunEvent::SnapshotCreated);

        let tag_failures = self.apply_tags(&snapshot_id, &tags);

        Ok(VolumeOutcome::Created {
            volume_id: volume_id.to_string(),
            snapshot_id,
            tags,
            tag_failures,
            thaw_error,
        })
    }

    /// Mount to freeze, if freezing is on and the volume is mounted here.
    fn freeze_target(&self, volume_id: &str, attachment: &Attachment) -> Option<PathBuf> {
        if !self.options.freeze_filesystems {
            return None;
        }

        let local = self
            .local_instance
            .get_or_init(|| self.host.local_instance_id());
        if local.as_deref() != Some(attachment.instance_id.as_str()) {
            debug!(
                volume_id = %volume_id,
                instance_id = %attachment.instance_id,
                "Volume attached to another host, not freezing"
            );
            return None;
        }

        let mount = self.host.mount_point(&attachment.device);
        if mount.is_none() {
            debug!(volume_id = %volume_id, device = %attachment.device, "Device not mounted locally");
        }
        mount
    }

    /// Best-effort freeze: a failure is logged and the snapshot proceeds.
    fn freeze(&self, volume_id: &str, mount: PathBuf) -> Option<FreezeGuard> {
        match self.registry.acquire(&mount) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "Could not freeze filesystem, snapshotting without freeze");
                None
            }
        }
    }

    fn apply_tags(&self, snapshot_id: &str, tags: &Tags) -> Vec<SnapkeepError> {
        let mut failures = Vec::new();
        for (key, value) in tags {
            match self.inventory.create_tag(snapshot_id, key, value) {
                Ok(()) => debug!(snapshot_id = %snapshot_id, key = %key, value = %value, "Tagged snapshot"),
                Err(e) => {
                    let error = SnapkeepError::TagWriteFailed {
                        resource_id: snapshot_id.to_string(),
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    error!(snapshot_id = %snapshot_id, stage = "create_tag", error = %error, "Tag write failed");
                    record(RunEvent::Failure);
                    failures.push(error);
                }
            }
        }
        failures
    }
}

impl<'a, I: CloudInventory + ?Sized> Drop for SnapshotOrchestrator<'a, I> {
    fn drop(&mut self) {
        if let Err(e) = self.registry.release_all() {
            error!(error = %e, "Failed to thaw filesystems on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::testing::RecordingFreezer;
    use crate::freeze::MockMountFreezer;
    use crate::inventory::{InventoryOp, MemoryInventory, MockCloudInventory};
    use chrono::TimeZone;
    use mockall::Sequence;
    use std::path::Path;

    struct FixedHost {
        instance_id: &'static str,
        mount: &'static str,
    }

    impl LocalHost for FixedHost {
        fn local_instance_id(&self) -> Option<String> {
            Some(self.instance_id.to_string())
        }

        fn mount_point(&self, _device: &str) -> Option<PathBuf> {
            Some(PathBuf::from(self.mount))
        }
    }

    const HOST: FixedHost = FixedHost {
        instance_id: "i-local",
        mount: "/data",
    };

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn attached(instance: &str) -> Option<Attachment> {
        Some(Attachment {
            instance_id: instance.to_string(),
            device: "/dev/sdf".to_string(),
        })
    }

    fn options() -> SnapshotOptions {
        SnapshotOptions {
            default_tags: tags(&[("CreatedBy", "AutomatedBackup")]),
            ..SnapshotOptions::default()
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_description_format() {
        let attachment = attached("i-0abc").unwrap();
        assert_eq!(
            snapshot_description(&attachment, at()),
            "i-0abc_/dev/sdf_2024-05-15T03:00:00Z"
        );
    }

    #[test]
    fn test_dry_run_ids_are_unique() {
        let a = dry_run_snapshot_id();
        assert!(a.starts_with("snap-dryrun-"));
        assert_ne!(a, dry_run_snapshot_id());
    }

    #[test]
    fn test_created_snapshot_is_tagged() {
        let inventory = MemoryInventory::new();
        inventory.add_volume("vol-a", tags(&[("Name", "web-01")]), attached("i-1"));

        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                tag_map: vec![TagMapEntry::new("Name", "BackupLabel")],
                ..options()
            },
        )
        .with_timestamp(at());

        let outcome = orchestrator.process_volume("vol-a").unwrap();
        let snapshot_id = outcome.snapshot_id().unwrap().to_string();
        assert!(!outcome.is_failure());

        let snapshot = inventory.snapshot(&snapshot_id).unwrap();
        assert_eq!(snapshot.tags.get("CreatedBy").unwrap(), "AutomatedBackup");
        assert_eq!(snapshot.tags.get("BackupLabel").unwrap(), "web-01");
        assert_eq!(inventory.calls_to(InventoryOp::CreateTag), 2);
    }

    #[test]
    fn test_filtered_and_unattached_volumes_are_not_snapshotted() {
        let inventory = MemoryInventory::new();
        inventory.add_volume("vol-a", tags(&[("env", "staging")]), attached("i-1"));
        inventory.add_volume("vol-b", tags(&[("env", "prod")]), None);

        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                tag_list: vec![TagFilter::equals("env", "prod")],
                ..options()
            },
        );

        assert!(matches!(
            orchestrator.process_volume("vol-a").unwrap(),
            VolumeOutcome::FilteredOut { .. }
        ));
        assert!(matches!(
            orchestrator.process_volume("vol-b").unwrap(),
            VolumeOutcome::Unattached { .. }
        ));
        assert!(inventory.mutations().is_empty());
    }

    #[test]
    fn test_dry_run_reads_but_never_mutates() {
        let inventory = MemoryInventory::new();
        inventory.add_volume("vol-a", Tags::new(), attached("i-local"));
        let freezer = RecordingFreezer::default();

        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                dry_run: true,
                freeze_filesystems: true,
                ..options()
            },
        )
        .with_host(&HOST)
        .with_registry(FreezeRegistry::new(freezer.clone()));

        let outcome = orchestrator.process_volume("vol-a").unwrap();
        assert!(matches!(outcome, VolumeOutcome::DryRunSkipped { .. }));
        assert!(inventory.mutations().is_empty());
        assert_eq!(inventory.calls_to(InventoryOp::GetVolumeAttachment), 1);
        assert!(freezer.calls().is_empty());
    }

    #[test]
    fn test_create_failure_is_per_volume() {
        let inventory = MemoryInventory::new();
        inventory.add_volume("vol-a", Tags::new(), attached("i-1"));
        inventory.add_volume("vol-b", Tags::new(), attached("i-1"));
        inventory.fail_on(InventoryOp::CreateSnapshot, "vol-a");

        let orchestrator = SnapshotOrchestrator::new(&inventory, options());
        let volumes: Vec<Volume> = ["vol-a", "vol-b"]
            .iter()
            .map(|id| Volume {
                id: id.to_string(),
                tags: Tags::new(),
            })
            .collect();

        let outcomes = orchestrator.run(&volumes).unwrap();
        assert!(matches!(
            &outcomes[0],
            VolumeOutcome::Failed {
                error: SnapkeepError::SnapshotCreationFailed { .. },
                ..
            }
        ));
        assert!(matches!(&outcomes[1], VolumeOutcome::Created { .. }));
    }

    #[test]
    fn test_tag_failure_keeps_snapshot() {
        let mut inventory = MockCloudInventory::new();
        inventory
            .expect_get_volume_tags()
            .returning(|_| Ok(Tags::new()));
        inventory
            .expect_get_volume_attachment()
            .returning(|_| Ok(attached("i-1")));
        inventory
            .expect_create_snapshot()
            .times(1)
            .returning(|_, _| Ok("snap-1".to_string()));
        inventory
            .expect_create_tag()
            .withf(|_, key, _| key == "CreatedBy")
            .returning(|_, _, _| Err(SnapkeepError::inventory("throttled")));
        inventory
            .expect_create_tag()
            .withf(|_, key, _| key != "CreatedBy")
            .returning(|_, _, _| Ok(()));
        inventory.expect_delete_snapshot().never();

        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                extra_tags: tags(&[("Team", "storage")]),
                ..options()
            },
        );

        match orchestrator.process_volume("vol-a").unwrap() {
            VolumeOutcome::Created {
                snapshot_id,
                tag_failures,
                ..
            } => {
                assert_eq!(snapshot_id, "snap-1");
                assert_eq!(tag_failures.len(), 1);
                assert!(matches!(
                    &tag_failures[0],
                    SnapkeepError::TagWriteFailed { key, .. } if key == "CreatedBy"
                ));
            }
            other => panic!("expected created snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_freeze_brackets_create_even_on_failure() {
        let mut seq = Sequence::new();
        let mut freezer = MockMountFreezer::new();
        let mut inventory = MockCloudInventory::new();

        inventory
            .expect_get_volume_tags()
            .returning(|_| Ok(Tags::new()));
        inventory
            .expect_get_volume_attachment()
            .returning(|_| Ok(attached("i-local")));
        freezer
            .expect_freeze()
            .withf(|mount| mount == Path::new("/data"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        inventory
            .expect_create_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SnapkeepError::inventory("snapshot limit exceeded")));
        freezer
            .expect_unfreeze()
            .withf(|mount| mount == Path::new("/data"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let registry = FreezeRegistry::new(freezer);
        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                freeze_filesystems: true,
                ..options()
            },
        )
        .with_host(&HOST)
        .with_registry(registry.clone());

        let outcome = orchestrator.process_volume("vol-a").unwrap();
        assert!(outcome.is_failure());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remote_volume_is_not_frozen() {
        let inventory = MemoryInventory::new();
        inventory.add_volume("vol-a", Tags::new(), attached("i-elsewhere"));
        let freezer = RecordingFreezer::default();

        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                freeze_filesystems: true,
                ..options()
            },
        )
        .with_host(&HOST)
        .with_registry(FreezeRegistry::new(freezer.clone()));

        orchestrator.process_volume("vol-a").unwrap();
        assert!(freezer.calls().is_empty());
    }

    #[test]
    fn test_thaw_failure_still_tags_and_continues() {
        let inventory = MemoryInventory::new();
        inventory.add_volume("vol-a", Tags::new(), attached("i-local"));
        inventory.add_volume("vol-b", Tags::new(), attached("i-local"));
        let freezer = RecordingFreezer::default();
        freezer.fail_unfreeze.lock().unwrap().push(PathBuf::from("/data"));
        let registry = FreezeRegistry::new(freezer.clone());

        let orchestrator = SnapshotOrchestrator::new(
            &inventory,
            SnapshotOptions {
                freeze_filesystems: true,
                ..options()
            },
        )
        .with_host(&HOST)
        .with_registry(registry.clone());

        let volumes: Vec<Volume> = ["vol-a", "vol-b"]
            .iter()
            .map(|id| Volume {
                id: id.to_string(),
                tags: Tags::new(),
            })
            .collect();
        let outcomes = orchestrator.run(&volumes).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(registry.is_empty());

        for outcome in &outcomes {
            match outcome {
                VolumeOutcome::Created {
                    snapshot_id,
                    thaw_error,
                    ..
                } => {
                    assert!(matches!(thaw_error, Some(SnapkeepError::Freeze { .. })));
                    let snapshot = inventory.snapshot(snapshot_id).unwrap();
                    assert_eq!(snapshot.tags.get("CreatedBy").unwrap(), "AutomatedBackup");
                }
                other => panic!("expected created snapshot, got {other:?}"),
            }
            assert!(outcome.is_failure());
            assert_eq!(outcome.label(), "created, thaw failed");
        }
        assert_eq!(inventory.calls_to(InventoryOp::CreateSnapshot), 2);
    }
}
