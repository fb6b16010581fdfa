/*!
Amazon EC2 inventory adapter.

Instances, volumes and snapshots are read and mutated through the official
AWS SDK. Snapshot listings are restricted to snapshots owned by the calling
account so that public or shared snapshots are never considered.
*/

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{Filter, Tag};
use aws_sdk_ec2::Client as Ec2Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{AsyncInventory, Attachment, BlockingInventory, GLOBAL_RT};
use crate::tags::Tags;
use crate::{Result, SnapkeepError};

/// Amazon EC2 inventory adapter
///
/// Uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
#[derive(Debug, Clone)]
pub struct Ec2Inventory {
    client: Ec2Client,
}

impl Ec2Inventory {
    /// Load AWS configuration from the environment and build a client.
    ///
    /// # Errors
    /// Returns `InventoryUnavailable` when no credentials can be found.
    pub async fn connect(region: Option<String>) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(SnapkeepError::inventory(
                "AWS credentials not found. Please set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_REGION environment variables",
            ));
        }

        Ok(Self::with_config(&sdk_config))
    }

    /// Build the adapter from an explicit SDK configuration.
    pub fn with_config(config: &SdkConfig) -> Self {
        info!(
            region = ?config.region().map(|r| r.as_ref().to_string()),
            "Initialized EC2 inventory adapter"
        );
        Self {
            client: Ec2Client::new(config),
        }
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<aws_sdk_ec2::types::Volume> {
        let output = self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| map_ec2_error("describe_volumes", e, volume_id))?;

        output
            .volumes()
            .first()
            .cloned()
            .ok_or_else(|| SnapkeepError::inventory(format!("volume {volume_id} not found")))
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<aws_sdk_ec2::types::Snapshot> {
        let output = self
            .client
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(|e| map_ec2_error("describe_snapshots", e, snapshot_id))?;

        output
            .snapshots()
            .first()
            .cloned()
            .ok_or_else(|| SnapkeepError::inventory(format!("snapshot {snapshot_id} not found")))
    }
}

/// Connect to EC2 and wrap the adapter for blocking use.
pub fn create_ec2_inventory(region: Option<String>) -> Result<BlockingInventory<Ec2Inventory>> {
    let adapter = GLOBAL_RT.block_on(Ec2Inventory::connect(region))?;
    Ok(BlockingInventory::new(adapter))
}

fn tags_from(tags: &[Tag]) -> Tags {
    tags.iter()
        .filter_map(|tag| Some((tag.key()?.to_string(), tag.value().unwrap_or_default().to_string())))
        .collect()
}

#[async_trait]
impl AsyncInventory for Ec2Inventory {
    async fn list_instances(&self) -> Result<Vec<String>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_instances()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_ec2_error("describe_instances", e, "*"))?;

            for reservation in output.reservations() {
                for instance in reservation.instances() {
                    if let Some(id) = instance.instance_id() {
                        instances.push(id.to_string());
                    }
                }
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(count = instances.len(), "Listed EC2 instances");
        Ok(instances)
    }

    async fn list_volumes_for_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        let filter = Filter::builder()
            .name("attachment.instance-id")
            .values(instance_id)
            .build();

        let mut volumes = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_volumes()
                .filters(filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_ec2_error("describe_volumes", e, instance_id))?;

            volumes.extend(
                output
                    .volumes()
                    .iter()
                    .filter_map(|v| v.volume_id().map(str::to_string)),
            );

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(instance_id = %instance_id, count = volumes.len(), "Listed attached volumes");
        Ok(volumes)
    }

    async fn get_volume_tags(&self, volume_id: &str) -> Result<Tags> {
        let volume = self.describe_volume(volume_id).await?;
        Ok(tags_from(volume.tags()))
    }

    async fn get_volume_attachment(&self, volume_id: &str) -> Result<Option<Attachment>> {
        let volume = self.describe_volume(volume_id).await?;
        Ok(volume.attachments().iter().find_map(|a| {
            Some(Attachment {
                instance_id: a.instance_id()?.to_string(),
                device: a.device().unwrap_or_default().to_string(),
            })
        }))
    }

    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<String> {
        info!(volume_id = %volume_id, description = %description, "Creating EC2 snapshot");

        let output = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .description(description)
            .send()
            .await
            .map_err(|e| map_ec2_error("create_snapshot", e, volume_id))?;

        output
            .snapshot_id()
            .map(str::to_string)
            .ok_or_else(|| SnapkeepError::inventory("create_snapshot returned no snapshot id"))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!(snapshot_id = %snapshot_id, "Deleting EC2 snapshot");

        self.client
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(|e| map_ec2_error("delete_snapshot", e, snapshot_id))?;
        Ok(())
    }

    async fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()> {
        self.client
            .create_tags()
            .resources(resource_id)
            .tags(Tag::builder().key(key).value(value).build())
            .send()
            .await
            .map_err(|e| map_ec2_error("create_tags", e, resource_id))?;
        Ok(())
    }

    async fn list_snapshots_for_volume(&self, volume_id: &str) -> Result<Vec<String>> {
        let filter = Filter::builder().name("volume-id").values(volume_id).build();

        let mut snapshots = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_snapshots()
                .owner_ids("self")
                .filters(filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_ec2_error("describe_snapshots", e, volume_id))?;

            snapshots.extend(
                output
                    .snapshots()
                    .iter()
                    .filter_map(|s| s.snapshot_id().map(str::to_string)),
            );

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(snapshots)
    }

    async fn get_snapshot_tags(&self, snapshot_id: &str) -> Result<Tags> {
        let snapshot = self.describe_snapshot(snapshot_id).await?;
        Ok(tags_from(snapshot.tags()))
    }

    async fn get_snapshot_creation_time(&self, snapshot_id: &str) -> Result<DateTime<Utc>> {
        let snapshot = self.describe_snapshot(snapshot_id).await?;
        let started = snapshot.start_time().ok_or_else(|| {
            SnapkeepError::inventory(format!("snapshot {snapshot_id} has no start time"))
        })?;

        DateTime::from_timestamp(started.secs(), started.subsec_nanos()).ok_or_else(|| {
            SnapkeepError::inventory(format!(
                "snapshot {snapshot_id} start time out of range"
            ))
        })
    }
}

/// Map AWS SDK errors to `InventoryUnavailable` with the operation and resource named
fn map_ec2_error<E: ProvideErrorMetadata + std::fmt::Debug, R: std::fmt::Debug>(
    op: &str,
    error: SdkError<E, R>,
    resource: &str,
) -> SnapkeepError {
    match &error {
        SdkError::DispatchFailure(dispatch_err) => SnapkeepError::inventory(format!(
            "EC2 {op} request failed to dispatch: {dispatch_err:?}"
        )),
        SdkError::TimeoutError(_) => {
            SnapkeepError::inventory(format!("EC2 {op} request timed out ({resource})"))
        }
        SdkError::ResponseError(response_err) => {
            SnapkeepError::inventory(format!("EC2 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("UnauthorizedOperation") | Some("AuthFailure") => SnapkeepError::inventory(
                format!("Access denied to EC2 {op} (check credentials and IAM permissions)"),
            ),
            Some("InvalidVolume.NotFound") => {
                SnapkeepError::inventory(format!("EC2 volume '{resource}' not found"))
            }
            Some("InvalidSnapshot.NotFound") => {
                SnapkeepError::inventory(format!("EC2 snapshot '{resource}' not found"))
            }
            Some(code) => SnapkeepError::inventory(format!(
                "EC2 {op} service error ({code}) for {resource}: {}",
                service_err.err().message().unwrap_or("Unknown error")
            )),
            None => SnapkeepError::inventory(format!("EC2 {op} service error: {service_err:?}")),
        },
        _ => SnapkeepError::inventory(format!("EC2 {op} error: {error:?}")),
    }
}
