/*!
# Snapkeep Core Engine

Discovery, filtering and retention engine for unattended block-storage
snapshot rotation.

A run discovers volumes from the cloud inventory, snapshots the ones that
pass the volume tag filter, tags the new snapshots for provenance, and
deletes owned snapshots older than the retention cutoff. Nothing is kept
between runs; every invocation re-reads the inventory.

## Architecture

- The engine talks to the cloud only through the [`CloudInventory`] port.
  [`MemoryInventory`] backs tests and rehearsals; the EC2 adapter lives
  behind the `ec2` feature.
- Filesystem freezing goes through the [`LocalHost`] and [`MountFreezer`]
  ports, tracked by a [`FreezeRegistry`] that guarantees every freeze is
  released.
- Execution is strictly sequential: one volume, then one snapshot, at a time.

## Usage

```rust
use snapkeep_core::{run, DetachedHost, FreezeRegistry, FsFreeze, MemoryInventory};
use snapkeep_core::{RetentionClock, RunMode, SnapkeepConfig};

let inventory = MemoryInventory::new();
let config = SnapkeepConfig {
    dry_run: true,
    ..SnapkeepConfig::default()
};

let report = run(
    RunMode::Maintain,
    &config,
    &inventory,
    &DetachedHost,
    FreezeRegistry::new(FsFreeze),
    RetentionClock::system(),
)?;
assert!(!report.has_failures());
# Ok::<(), snapkeep_core::SnapkeepError>(())
```
*/

pub mod cleanup;
pub mod config;
pub mod error;
pub mod freeze;
pub mod inventory;
pub mod observability;
pub mod propagate;
pub mod resolver;
pub mod retention;
pub mod run;
pub mod snapshot;
pub mod tags;


pub use cleanup::{CleanupOptions, CleanupOrchestrator, CleanupVerdict};
pub use config::{ConfigOverrides, SnapkeepConfig, CONFIG_ENV_VAR};
pub use error::{Result, SnapkeepError};
pub use freeze::{
    DetachedHost, FreezeGuard, FreezeRegistry, FsFreeze, LocalHost, MountFreezer, ProcMounts,
};
pub use inventory::{Attachment, CloudInventory, InventoryOp, MemoryInventory, Snapshot, Volume};
pub use observability::init_logging;
pub use propagate::compute_snapshot_tags;
pub use resolver::resolve_volumes;
pub use retention::{RetentionClock, RetentionCutoff, RetentionPolicy};
pub use run::{run, RunMode, RunReport};
pub use snapshot::{SnapshotOptions, SnapshotOrchestrator, VolumeOutcome};
pub use tags::{has_all, matches_any, TagFilter, TagMapEntry, Tags};

#[cfg(feature = "ec2")]
pub use freeze::Ec2Host;
#[cfg(feature = "ec2")]
pub use inventory::{create_ec2_inventory, Ec2Inventory};
