/*!
Cloud inventory ports and adapters.

The engine only talks to the cloud through [`CloudInventory`], a blocking
interface over the ten read/mutate operations it needs. Network adapters
implement the async [`AsyncInventory`] instead and are driven through
[`BlockingInventory`], which parks the caller on a process-wide runtime so
that every run stays strictly sequential.
*/

#[cfg(feature = "ec2")]
pub mod ec2;
pub mod memory;

use crate::tags::Tags;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "async-rt")]
use once_cell::sync::Lazy;
#[cfg(feature = "async-rt")]
use std::sync::Arc;
#[cfg(feature = "async-rt")]
use tokio::runtime::Runtime;

#[cfg(feature = "async-rt")]
static GLOBAL_RT: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("snapkeep-rt")
        .enable_all()
        .build()
        .expect("Failed to create global async runtime")
});

/// Runtime shared by the blocking adapters and the CLI's signal hook.
#[cfg(feature = "async-rt")]
pub fn runtime() -> &'static Runtime {
    &GLOBAL_RT
}

/// Where a volume is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub instance_id: String,
    pub device: String,
}

/// A volume as seen by discovery: identity plus the tags read for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub tags: Tags,
}

/// A snapshot together with the attributes the cleanup gates look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub created: DateTime<Utc>,
    pub tags: Tags,
}

/// Operations offered by the inventory, used for call journals and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryOp {
    ListInstances,
    ListVolumesForInstance,
    GetVolumeTags,
    GetVolumeAttachment,
    CreateSnapshot,
    DeleteSnapshot,
    CreateTag,
    ListSnapshotsForVolume,
    GetSnapshotTags,
    GetSnapshotCreationTime,
}

impl InventoryOp {
    /// True for the operations that change cloud state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateSnapshot | Self::DeleteSnapshot | Self::CreateTag
        )
    }
}

/// Blocking inventory interface consumed by the engine.
///
/// Read failures surface as `InventoryUnavailable`; the orchestrators decide
/// which mutation failures are fatal.
#[cfg_attr(test, mockall::automock)]
pub trait CloudInventory {
    /// Every instance visible to the caller
    fn list_instances(&self) -> Result<Vec<String>>;

    /// Volumes currently attached to `instance_id`
    fn list_volumes_for_instance(&self, instance_id: &str) -> Result<Vec<String>>;

    fn get_volume_tags(&self, volume_id: &str) -> Result<Tags>;

    /// `None` when the volume is not attached anywhere
    fn get_volume_attachment(&self, volume_id: &str) -> Result<Option<Attachment>>;

    /// Start a snapshot of `volume_id` and return its identifier
    fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String>;

    fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Add or overwrite one tag on a volume or snapshot
    fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()>;

    /// Snapshots owned by the caller whose source is `volume_id`
    fn list_snapshots_for_volume(&self, volume_id: &str) -> Result<Vec<String>>;

    fn get_snapshot_tags(&self, snapshot_id: &str) -> Result<Tags>;

    fn get_snapshot_creation_time(&self, snapshot_id: &str) -> Result<DateTime<Utc>>;
}

/// Async counterpart of [`CloudInventory`] implemented by network adapters.
#[async_trait]
pub trait AsyncInventory: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<String>>;
    async fn list_volumes_for_instance(&self, instance_id: &str) -> Result<Vec<String>>;
    async fn get_volume_tags(&self, volume_id: &str) -> Result<Tags>;
    async fn get_volume_attachment(&self, volume_id: &str) -> Result<Option<Attachment>>;
    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    async fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()>;
    async fn list_snapshots_for_volume(&self, volume_id: &str) -> Result<Vec<String>>;
    async fn get_snapshot_tags(&self, snapshot_id: &str) -> Result<Tags>;
    async fn get_snapshot_creation_time(&self, snapshot_id: &str) -> Result<DateTime<Utc>>;
}

/// Blocking wrapper for async inventory adapters
///
/// Uses the global runtime to block on each call, so it must not be used
/// from inside an async context.
#[cfg(feature = "async-rt")]
pub struct BlockingInventory<A: AsyncInventory> {
    inner: Arc<A>,
}

#[cfg(feature = "async-rt")]
impl<A: AsyncInventory> BlockingInventory<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            inner: Arc::new(adapter),
        }
    }
}

#[cfg(feature = "async-rt")]
impl<A: AsyncInventory> CloudInventory for BlockingInventory<A> {
    fn list_instances(&self) -> Result<Vec<String>> {
        GLOBAL_RT.block_on(self.inner.list_instances())
    }

    fn list_volumes_for_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        GLOBAL_RT.block_on(self.inner.list_volumes_for_instance(instance_id))
    }

    fn get_volume_tags(&self, volume_id: &str) -> Result<Tags> {
        GLOBAL_RT.block_on(self.inner.get_volume_tags(volume_id))
    }

    fn get_volume_attachment(&self, volume_id: &str) -> Result<Option<Attachment>> {
        GLOBAL_RT.block_on(self.inner.get_volume_attachment(volume_id))
    }

    fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String> {
        GLOBAL_RT.block_on(self.inner.create_snapshot(volume_id, description))
    }

    fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        GLOBAL_RT.block_on(self.inner.delete_snapshot(snapshot_id))
    }

    fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()> {
        GLOBAL_RT.block_on(self.inner.create_tag(resource_id, key, value))
    }

    fn list_snapshots_for_volume(&self, volume_id: &str) -> Result<Vec<String>> {
        GLOBAL_RT.block_on(self.inner.list_snapshots_for_volume(volume_id))
    }

    fn get_snapshot_tags(&self, snapshot_id: &str) -> Result<Tags> {
        GLOBAL_RT.block_on(self.inner.get_snapshot_tags(snapshot_id))
    }

    fn get_snapshot_creation_time(&self, snapshot_id: &str) -> Result<DateTime<Utc>> {
        GLOBAL_RT.block_on(self.inner.get_snapshot_creation_time(snapshot_id))
    }
}

// Re-export types for convenience
#[cfg(feature = "ec2")]
pub use ec2::{create_ec2_inventory, Ec2Inventory};
pub use memory::MemoryInventory;


#[cfg(all(test, feature = "async-rt"))]
mod blocking_tests {
    use super::*;
    use crate::SnapkeepError;
    use chrono::TimeZone;

    /// Async adapter that answers from fixed data, to exercise the blocking bridge.
    struct FixedAsync;

    #[async_trait]
    impl AsyncInventory for FixedAsync {
        async fn list_instances(&self) -> Result<Vec<String>> {
            Ok(vec!["i-1".to_string()])
        }
        async fn list_volumes_for_instance(&self, instance_id: &str) -> Result<Vec<String>> {
            Ok(vec![format!("vol-of-{instance_id}")])
        }
        async fn get_volume_tags(&self, _volume_id: &str) -> Result<Tags> {
            Ok(Tags::from([("env".to_string(), "prod".to_string())]))
        }
        async fn get_volume_attachment(&self, _volume_id: &str) -> Result<Option<Attachment>> {
            Ok(None)
        }
        async fn create_snapshot(&self, volume_id: &str, _description: &str) -> Result<String> {
            Err(SnapkeepError::inventory(format!("read-only adapter: {volume_id}")))
        }
        async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<()> {
            Ok(())
        }
        async fn create_tag(&self, _resource_id: &str, _key: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn list_snapshots_for_volume(&self, _volume_id: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_snapshot_tags(&self, _snapshot_id: &str) -> Result<Tags> {
            Ok(Tags::new())
        }
        async fn get_snapshot_creation_time(&self, _snapshot_id: &str) -> Result<DateTime<Utc>> {
            Ok(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        }
    }

    #[test]
    fn test_blocking_bridge_forwards_calls() {
        let inventory = BlockingInventory::new(FixedAsync);
        assert_eq!(inventory.list_instances().unwrap(), vec!["i-1"]);
        assert_eq!(
            inventory.list_volumes_for_instance("i-1").unwrap(),
            vec!["vol-of-i-1"]
        );
        assert_eq!(inventory.get_volume_tags("v").unwrap().get("env").unwrap(), "prod");
        assert!(inventory.create_snapshot("v", "d").is_err());
    }
}
