/*!
In-memory inventory adapter.

Holds instances, volumes and snapshots in a mutex-guarded state and records
every call it receives, which makes it the adapter of choice for tests and
for rehearsing a configuration without cloud credentials.
*/

use super::{Attachment, CloudInventory, InventoryOp, Snapshot};
use crate::tags::Tags;
use crate::{Result, SnapkeepError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct VolumeRecord {
    id: String,
    tags: Tags,
    attachment: Option<Attachment>,
}

#[derive(Debug, Default)]
struct State {
    instances: Vec<String>,
    volumes: Vec<VolumeRecord>,
    snapshots: Vec<Snapshot>,
    journal: Vec<(InventoryOp, String)>,
    failures: HashSet<(InventoryOp, String)>,
    unavailable: bool,
    next_snapshot: u64,
    clock: Option<DateTime<Utc>>,
}

/// Memory-based inventory adapter
#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: Mutex<State>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_instance<S: Into<String>>(&self, instance_id: S) {
        self.state().instances.push(instance_id.into());
    }

    /// Add a volume, attached to `instance_id` at `device` when given.
    pub fn add_volume<S: Into<String>>(&self, volume_id: S, tags: Tags, attachment: Option<Attachment>) {
        self.state().volumes.push(VolumeRecord {
            id: volume_id.into(),
            tags,
            attachment,
        });
    }

    /// Add a pre-existing snapshot.
    pub fn add_snapshot(&self, snapshot: Snapshot) {
        self.state().snapshots.push(snapshot);
    }

    /// Creation time stamped on snapshots made through `create_snapshot`.
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state().clock = Some(now);
    }

    /// Make every call fail with `InventoryUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Make `op` fail when called for `target`.
    pub fn fail_on<S: Into<String>>(&self, op: InventoryOp, target: S) {
        self.state().failures.insert((op, target.into()));
    }

    /// Every call received so far, in order.
    pub fn journal(&self) -> Vec<(InventoryOp, String)> {
        self.state().journal.clone()
    }

    /// Calls that would have changed cloud state.
    pub fn mutations(&self) -> Vec<(InventoryOp, String)> {
        self.journal()
            .into_iter()
            .filter(|(op, _)| op.is_mutation())
            .collect()
    }

    pub fn calls_to(&self, op: InventoryOp) -> usize {
        self.state().journal.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Option<Snapshot> {
        self.state()
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned()
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.state().snapshots.iter().map(|s| s.id.clone()).collect()
    }

    /// Journal the call and apply injected failures.
    fn enter(&self, op: InventoryOp, target: &str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.journal.push((op, target.to_string()));
        if state.unavailable {
            return Err(SnapkeepError::inventory(format!(
                "{op:?}: endpoint unreachable"
            )));
        }
        if state.failures.contains(&(op, target.to_string())) {
            return Err(SnapkeepError::inventory(format!(
                "{op:?} rejected for {target}"
            )));
        }
        Ok(state)
    }
}

fn volume<'a>(state: &'a State, volume_id: &str) -> Result<&'a VolumeRecord> {
    state
        .volumes
        .iter()
        .find(|v| v.id == volume_id)
        .ok_or_else(|| SnapkeepError::inventory(format!("volume {volume_id} not found")))
}

fn snapshot<'a>(state: &'a State, snapshot_id: &str) -> Result<&'a Snapshot> {
    state
        .snapshots
        .iter()
        .find(|s| s.id == snapshot_id)
        .ok_or_else(|| SnapkeepError::inventory(format!("snapshot {snapshot_id} not found")))
}

impl CloudInventory for MemoryInventory {
    fn list_instances(&self) -> Result<Vec<String>> {
        let state = self.enter(InventoryOp::ListInstances, "")?;
        Ok(state.instances.clone())
    }

    fn list_volumes_for_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        let state = self.enter(InventoryOp::ListVolumesForInstance, instance_id)?;
        Ok(state
            .volumes
            .iter()
            .filter(|v| {
                v.attachment
                    .as_ref()
                    .is_some_and(|a| a.instance_id == instance_id)
            })
            .map(|v| v.id.clone())
            .collect())
    }

    fn get_volume_tags(&self, volume_id: &str) -> Result<Tags> {
        let state = self.enter(InventoryOp::GetVolumeTags, volume_id)?;
        Ok(volume(&state, volume_id)?.tags.clone())
    }

    fn get_volume_attachment(&self, volume_id: &str) -> Result<Option<Attachment>> {
        let state = self.enter(InventoryOp::GetVolumeAttachment, volume_id)?;
        Ok(volume(&state, volume_id)?.attachment.clone())
    }

    fn create_snapshot(&self, volume_id: &str, _description: &str) -> Result<String> {
        let mut state = self.enter(InventoryOp::CreateSnapshot, volume_id)?;
        volume(&state, volume_id)?;

        state.next_snapshot += 1;
        let id = format!("snap-{:017x}", state.next_snapshot);
        let created = state.clock.unwrap_or_else(Utc::now);
        state.snapshots.push(Snapshot {
            id: id.clone(),
            volume_id: volume_id.to_string(),
            created,
            tags: Tags::new(),
        });
        Ok(id)
    }

    fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut state = self.enter(InventoryOp::DeleteSnapshot, snapshot_id)?;
        snapshot(&state, snapshot_id)?;
        state.snapshots.retain(|s| s.id != snapshot_id);
        Ok(())
    }

    fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.enter(InventoryOp::CreateTag, resource_id)?;
        if let Some(snapshot) = state.snapshots.iter_mut().find(|s| s.id == resource_id) {
            snapshot.tags.insert(key.to_string(), value.to_string());
            return Ok(());
        }
        if let Some(volume) = state.volumes.iter_mut().find(|v| v.id == resource_id) {
            volume.tags.insert(key.to_string(), value.to_string());
            return Ok(());
        }
        Err(SnapkeepError::inventory(format!(
            "resource {resource_id} not found"
        )))
    }

    fn list_snapshots_for_volume(&self, volume_id: &str) -> Result<Vec<String>> {
        let state = self.enter(InventoryOp::ListSnapshotsForVolume, volume_id)?;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.volume_id == volume_id)
            .map(|s| s.id.clone())
            .collect())
    }

    fn get_snapshot_tags(&self, snapshot_id: &str) -> Result<Tags> {
        let state = self.enter(InventoryOp::GetSnapshotTags, snapshot_id)?;
        Ok(snapshot(&state, snapshot_id)?.tags.clone())
    }

    fn get_snapshot_creation_time(&self, snapshot_id: &str) -> Result<DateTime<Utc>> {
        let state = self.enter(InventoryOp::GetSnapshotCreationTime, snapshot_id)?;
        Ok(snapshot(&state, snapshot_id)?.created)
    }
}
