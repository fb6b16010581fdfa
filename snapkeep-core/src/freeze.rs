/*!
Filesystem freeze bracket and the local-host collaborators it needs.

Freezing only makes sense when snapkeep runs on the instance the volume is
attached to, so the snapshot orchestrator first asks a [`LocalHost`] for the
local instance identity and the mount point of the attached device. Frozen
mounts are tracked in a [`FreezeRegistry`]; every acquisition hands back a
[`FreezeGuard`] that thaws the mount when released or dropped.
`release_all` thaws whatever is still outstanding and closes the registry
to new freezes; the CLI's signal hook calls it before exiting.
*/

use crate::{Result, SnapkeepError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Probe of the machine snapkeep is running on.
pub trait LocalHost {
    /// Cloud instance id of this machine, `None` when not running on an instance.
    fn local_instance_id(&self) -> Option<String>;

    /// Where `device` (as reported by the cloud API) is mounted locally.
    fn mount_point(&self, device: &str) -> Option<PathBuf>;
}

/// Host that is never the attachment host, so freezing never triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedHost;

impl LocalHost for DetachedHost {
    fn local_instance_id(&self) -> Option<String> {
        None
    }

    fn mount_point(&self, _device: &str) -> Option<PathBuf> {
        None
    }
}

/// Parsed mount table in `/proc/mounts` format.
#[derive(Debug, Clone, Default)]
pub struct ProcMounts {
    entries: Vec<(String, PathBuf)>,
}

impl ProcMounts {
    pub const DEFAULT_PATH: &'static str = "/proc/mounts";

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount = fields.next()?;
                Some((unescape(device), PathBuf::from(unescape(mount))))
            })
            .collect();
        Self { entries }
    }

    /// Look up `device`, also trying its Xen alias (`/dev/sdf` -> `/dev/xvdf`).
    pub fn mount_point(&self, device: &str) -> Option<PathBuf> {
        device_aliases(device).iter().find_map(|candidate| {
            self.entries
                .iter()
                .find(|(dev, _)| dev == candidate)
                .map(|(_, mount)| mount.clone())
        })
    }
}

fn device_aliases(device: &str) -> Vec<String> {
    let mut aliases = vec![device.to_string()];
    if let Some(suffix) = device.strip_prefix("/dev/sd") {
        aliases.push(format!("/dev/xvd{suffix}"));
    } else if let Some(suffix) = device.strip_prefix("/dev/xvd") {
        aliases.push(format!("/dev/sd{suffix}"));
    } else if !device.starts_with('/') {
        aliases.push(format!("/dev/{device}"));
    }
    aliases
}

/// Undo the octal escapes (`\040` for space) used in `/proc/mounts`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// True when DMI/hypervisor identifiers say this is an EC2 instance.
pub fn looks_like_ec2(hypervisor_uuid: Option<&str>, sys_vendor: Option<&str>) -> bool {
    let uuid_match = hypervisor_uuid
        .map(|uuid| uuid.trim().to_ascii_lowercase().starts_with("ec2"))
        .unwrap_or(false);
    let vendor_match = sys_vendor
        .map(|vendor| vendor.trim() == "Amazon EC2")
        .unwrap_or(false);
    uuid_match || vendor_match
}

/// EC2 host probe: hypervisor check, then an instance-metadata lookup.
#[cfg(feature = "ec2")]
#[derive(Debug, Clone)]
pub struct Ec2Host {
    mounts_path: PathBuf,
}

#[cfg(feature = "ec2")]
impl Default for Ec2Host {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from(ProcMounts::DEFAULT_PATH),
        }
    }
}

#[cfg(feature = "ec2")]
impl Ec2Host {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_trimmed(path: &str) -> Option<String> {
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }
}

#[cfg(feature = "ec2")]
impl LocalHost for Ec2Host {
    fn local_instance_id(&self) -> Option<String> {
        let uuid = Self::read_trimmed("/sys/hypervisor/uuid")
            .or_else(|| Self::read_trimmed("/sys/devices/virtual/dmi/id/product_uuid"));
        let vendor = Self::read_trimmed("/sys/devices/virtual/dmi/id/sys_vendor");
        if !looks_like_ec2(uuid.as_deref(), vendor.as_deref()) {
            debug!("Not running on EC2, filesystem freeze disabled");
            return None;
        }

        let client = aws_config::imds::Client::builder().build();
        match crate::inventory::runtime().block_on(client.get("/latest/meta-data/instance-id")) {
            Ok(instance_id) => Some(instance_id.as_ref().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "Instance metadata lookup failed, filesystem freeze disabled");
                None
            }
        }
    }

    fn mount_point(&self, device: &str) -> Option<PathBuf> {
        match ProcMounts::load(&self.mounts_path) {
            Ok(mounts) => mounts.mount_point(device),
            Err(e) => {
                tracing::warn!(path = %self.mounts_path.display(), error = %e, "Cannot read mount table");
                None
            }
        }
    }
}

/// Primitive that suspends and resumes writes on a mounted filesystem.
#[cfg_attr(test, mockall::automock)]
pub trait MountFreezer: Send + Sync {
    fn freeze(&self, mount: &Path) -> Result<()>;
    fn unfreeze(&self, mount: &Path) -> Result<()>;
}

/// Freezer backed by util-linux `fsfreeze`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFreeze;

impl FsFreeze {
    fn run(flag: &str, mount: &Path) -> Result<()> {
        let status = Command::new("fsfreeze")
            .arg(flag)
            .arg(mount)
            .status()
            .map_err(|e| SnapkeepError::freeze(mount, format!("cannot run fsfreeze: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(SnapkeepError::freeze(
                mount,
                format!("fsfreeze {flag} exited with {status}"),
            ))
        }
    }
}

impl MountFreezer for FsFreeze {
    fn freeze(&self, mount: &Path) -> Result<()> {
        Self::run("-f", mount)
    }

    fn unfreeze(&self, mount: &Path) -> Result<()> {
        Self::run("-u", mount)
    }
}

#[derive(Default)]
struct FreezeState {
    mounts: Vec<PathBuf>,
    /// Set by `release_all`; no freeze is started afterwards.
    closed: bool,
}

struct RegistryInner {
    freezer: Box<dyn MountFreezer>,
    // Held across every freeze and thaw call so a concurrent drain never
    // misses a mount that is halfway frozen.
    state: Mutex<FreezeState>,
}

impl RegistryInner {
    fn state(&self) -> MutexGuard<'_, FreezeState> {
        // Poisoning must not stop a thaw.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drain(&self, close: bool) -> Result<()> {
        let mut state = self.state();
        if close {
            state.closed = true;
        }

        let mut first_error = None;
        for mount in std::mem::take(&mut state.mounts) {
            match self.freezer.unfreeze(&mount) {
                Ok(()) => info!(mount = %mount.display(), "Filesystem thawed"),
                Err(e) => {
                    error!(mount = %mount.display(), error = %e, "Failed to thaw filesystem");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Outstanding-freeze registry.
///
/// Append on acquire, remove on release, drained by `release_all`. Clones
/// share the same registry, so a signal hook can hold one.
#[derive(Clone)]
pub struct FreezeRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for FreezeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreezeRegistry")
            .field("frozen", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FreezeRegistry {
    pub fn new<F: MountFreezer + 'static>(freezer: F) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                freezer: Box::new(freezer),
                state: Mutex::new(FreezeState::default()),
            }),
        }
    }

    /// Freeze `mount` and track it until the returned guard is released.
    ///
    /// Refused once `release_all` has run.
    pub fn acquire(&self, mount: &Path) -> Result<FreezeGuard> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(SnapkeepError::freeze(mount, "shutting down, not freezing"));
        }
        if state.mounts.iter().any(|m| m == mount) {
            return Err(SnapkeepError::freeze(mount, "already frozen by this run"));
        }

        self.inner.freezer.freeze(mount)?;
        state.mounts.push(mount.to_path_buf());
        info!(mount = %mount.display(), "Filesystem frozen");

        Ok(FreezeGuard {
            registry: self.clone(),
            mount: mount.to_path_buf(),
            armed: true,
        })
    }

    /// Thaw one mount. A mount that is no longer tracked is left alone.
    pub fn release(&self, mount: &Path) -> Result<()> {
        let mut state = self.inner.state();
        let Some(index) = state.mounts.iter().position(|m| m == mount) else {
            debug!(mount = %mount.display(), "Mount already released");
            return Ok(());
        };

        state.mounts.remove(index);
        self.inner.freezer.unfreeze(mount)?;
        info!(mount = %mount.display(), "Filesystem thawed");
        Ok(())
    }

    /// Thaw every outstanding mount and refuse further freezes.
    ///
    /// Every mount is attempted even if some fail; returns the first failure.
    pub fn release_all(&self) -> Result<()> {
        self.inner.drain(true)
    }

    /// Thaw every outstanding mount after a failed thaw. Later freezes are
    /// still allowed.
    fn release_remaining(&self) {
        let _ = self.inner.drain(false);
    }

    pub fn outstanding(&self) -> Vec<PathBuf> {
        self.inner.state().mounts.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state().mounts.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }
}

/// Scoped freeze of one mount.
#[must_use = "dropping the guard thaws the filesystem immediately"]
pub struct FreezeGuard {
    registry: FreezeRegistry,
    mount: PathBuf,
    armed: bool,
}

impl FreezeGuard {
    /// Thaw the mount. On failure the remaining tracked mounts are thawed too
    /// before the error is returned.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        match self.registry.release(&self.mount) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(mount = %self.mount.display(), error = %e, "Thaw failed, releasing all frozen mounts");
                self.registry.release_remaining();
                Err(e)
            }
        }
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.registry.release(&self.mount) {
                error!(mount = %self.mount.display(), error = %e, "Thaw on drop failed");
                self.registry.release_remaining();
            }
        }
    }
}
