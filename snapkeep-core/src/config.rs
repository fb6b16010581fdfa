//! Run configuration and its defaults -> file -> flags merge.
//!
//! The configuration file is JSON with the same field names as
//! [`SnapkeepConfig`]; every field is optional. Tag filters and tag map
//! entries are written the way they are on the command line:
//!
//! ```json
//! {
//!   "instances": ["i-0abc"],
//!   "tag_list": ["env=prod", "Backup"],
//!   "tag_map": ["Name=BackupLabel"],
//!   "extra_tags": { "Team": "storage" },
//!   "retention": { "max_age": "2w" },
//!   "freeze_filesystems": true
//! }
//! ```

use crate::retention::RetentionPolicy;
use crate::tags::{TagFilter, TagMapEntry, Tags};
use crate::{Result, SnapkeepError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "SNAPKEEP_CONFIG";

/// Ownership marker written on every snapshot and required for deletion.
pub const DEFAULT_OWNER_TAG: (&str, &str) = ("CreatedBy", "AutomatedBackup");

/// Complete settings for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapkeepConfig {
    /// Explicit volume ids
    pub volumes: Vec<String>,
    /// Explicit instance ids
    pub instances: Vec<String>,
    /// Volume tag filter (OR)
    pub tag_list: Vec<TagFilter>,
    /// Volume tags copied onto new snapshots
    pub tag_map: Vec<TagMapEntry>,
    /// Snapshot tag filter applied by cleanup (OR)
    pub snapshot_tag_filter: Vec<TagFilter>,
    /// Additional tags written on new snapshots
    pub extra_tags: Tags,
    /// Ownership tags; written on create, all keys required on delete
    pub default_tags: Tags,
    pub retention: RetentionPolicy,
    pub dry_run: bool,
    pub debug: bool,
    /// Freeze locally mounted filesystems around snapshot creation
    pub freeze_filesystems: bool,
    /// Cloud region, falling back to the provider's default chain
    pub region: Option<String>,
}

impl Default for SnapkeepConfig {
    fn default() -> Self {
        let (key, value) = DEFAULT_OWNER_TAG;
        Self {
            volumes: Vec::new(),
            instances: Vec::new(),
            tag_list: Vec::new(),
            tag_map: Vec::new(),
            snapshot_tag_filter: Vec::new(),
            extra_tags: Tags::new(),
            default_tags: Tags::from([(key.to_string(), value.to_string())]),
            retention: RetentionPolicy::default(),
            dry_run: false,
            debug: false,
            freeze_filesystems: false,
            region: None,
        }
    }
}

/// Values given on the command line. `None` leaves the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub volumes: Option<Vec<String>>,
    pub instances: Option<Vec<String>>,
    pub tag_list: Option<Vec<TagFilter>>,
    pub tag_map: Option<Vec<TagMapEntry>>,
    pub snapshot_tag_filter: Option<Vec<TagFilter>>,
    pub extra_tags: Option<Tags>,
    pub max_age: Option<String>,
    pub max_date: Option<String>,
    pub no_max_date: bool,
    pub dry_run: bool,
    pub debug: bool,
    pub freeze_filesystems: bool,
    pub region: Option<String>,
}

impl SnapkeepConfig {
    /// Load a JSON configuration file on top of the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            SnapkeepError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            SnapkeepError::config(format!("invalid configuration in {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line values. Lists replace, flags only switch on.
    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(volumes) = overrides.volumes {
            self.volumes = volumes;
        }
        if let Some(instances) = overrides.instances {
            self.instances = instances;
        }
        if let Some(tag_list) = overrides.tag_list {
            self.tag_list = tag_list;
        }
        if let Some(tag_map) = overrides.tag_map {
            self.tag_map = tag_map;
        }
        if let Some(filter) = overrides.snapshot_tag_filter {
            self.snapshot_tag_filter = filter;
        }
        if let Some(extra_tags) = overrides.extra_tags {
            self.extra_tags = extra_tags;
        }
        if overrides.max_age.is_some() {
            self.retention.max_age = overrides.max_age;
        }
        if overrides.max_date.is_some() {
            self.retention.max_date = overrides.max_date;
        }
        if overrides.region.is_some() {
            self.region = overrides.region;
        }
        self.retention.no_max_date |= overrides.no_max_date;
        self.dry_run |= overrides.dry_run;
        self.debug |= overrides.debug;
        self.freeze_filesystems |= overrides.freeze_filesystems;
        self
    }

    /// Reject settings that would make a run unsafe or meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.default_tags.is_empty() {
            return Err(SnapkeepError::config(
                "default_tags must not be empty; it marks the snapshots snapkeep may delete",
            ));
        }
        if let Some(key) = self
            .default_tags
            .keys()
            .chain(self.extra_tags.keys())
            .find(|key| key.trim().is_empty())
        {
            return Err(SnapkeepError::config(format!(
                "tag key '{key}' must not be empty"
            )));
        }
        if self.retention.no_max_date {
            if self.retention.max_age.is_some() || self.retention.max_date.is_some() {
                warn!("no_max_date given, ignoring max_age and max_date");
            }
        } else if self.retention.max_age.is_some() && self.retention.max_date.is_some() {
            warn!("Both max_age and max_date given, max_date takes precedence");
        }
        Ok(())
    }
}
