/*!
Error types for the snapkeep engine.
*/

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout snapkeep.
pub type Result<T> = std::result::Result<T, SnapkeepError>;

/// Errors that can occur while discovering, snapshotting or purging.
#[derive(Error, Debug)]
pub enum SnapkeepError {
    /// The cloud inventory could not be reached or refused the request
    #[error("Inventory unavailable: {0}")]
    InventoryUnavailable(String),

    /// An age or date expression that cannot be turned into a cutoff
    #[error("Invalid retention expression: {0}")]
    InvalidRetentionExpression(String),

    /// The create-snapshot call failed for a volume
    #[error("Snapshot creation failed for {volume_id}: {reason}")]
    SnapshotCreationFailed { volume_id: String, reason: String },

    /// The delete-snapshot call failed
    #[error("Snapshot deletion failed for {snapshot_id}: {reason}")]
    SnapshotDeletionFailed { snapshot_id: String, reason: String },

    /// A single tag could not be written
    #[error("Tag write failed for {resource_id} ({key}): {reason}")]
    TagWriteFailed {
        resource_id: String,
        key: String,
        reason: String,
    },

    /// Filesystem freeze or unfreeze failed
    #[error("Freeze error on {}: {reason}", mount.display())]
    Freeze { mount: PathBuf, reason: String },

    /// Configuration file could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed user input (tag syntax, filters)
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SnapkeepError {
    /// Create a new inventory error
    pub fn inventory<S: Into<String>>(msg: S) -> Self {
        Self::InventoryUnavailable(msg.into())
    }

    /// Create a new retention expression error
    pub fn retention<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRetentionExpression(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new freeze error
    pub fn freeze<P: Into<PathBuf>, S: Into<String>>(mount: P, reason: S) -> Self {
        Self::Freeze {
            mount: mount.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error aborts the whole run rather than a single volume or snapshot.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InventoryUnavailable(_)
                | Self::InvalidRetentionExpression(_)
                | Self::Config(_)
                | Self::Validation(_)
                | Self::Io(_)
                | Self::Json(_)
        )
    }
}
