/*!
Inventory resolver: turns the instance/volume selection into the concrete
list of volumes a run operates on.
*/

use crate::inventory::{CloudInventory, Volume};
use crate::observability::{record, RunEvent};
use crate::tags::{matches_any, TagFilter};
use crate::Result;
use std::collections::HashSet;
use tracing::{debug, info};

/// Expand explicit or implicit selections into deduplicated, tag-filtered volumes.
///
/// With no explicit instances and no explicit volumes every instance in the
/// inventory is considered. Volumes keep discovery order: attached volumes of
/// each instance first, then explicit volume ids. Any inventory error aborts.
pub fn resolve_volumes<I: CloudInventory + ?Sized>(
    inventory: &I,
    explicit_instances: &[String],
    explicit_volumes: &[String],
    tag_filters: &[TagFilter],
) -> Result<Vec<Volume>> {
    let instances = if explicit_instances.is_empty() && explicit_volumes.is_empty() {
        let discovered = inventory.list_instances()?;
        info!(count = discovered.len(), "No selection given, using all instances");
        discovered
    } else {
        explicit_instances.to_vec()
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for instance_id in &instances {
        for volume_id in inventory.list_volumes_for_instance(instance_id)? {
            debug!(instance_id = %instance_id, volume_id = %volume_id, "Discovered attached volume");
            if seen.insert(volume_id.clone()) {
                candidates.push(volume_id);
            }
        }
    }

    for volume_id in explicit_volumes {
        if seen.insert(volume_id.clone()) {
            candidates.push(volume_id.clone());
        }
    }

    let mut volumes = Vec::with_capacity(candidates.len());
    for id in candidates {
        let tags = inventory.get_volume_tags(&id)?;
        if matches_any(&tags, tag_filters) {
            volumes.push(Volume { id, tags });
        } else {
            info!(volume_id = %id, "Volume discovered but excluded by tag filter");
            record(RunEvent::VolumeFiltered);
        }
    }

    info!(count = volumes.len(), "Resolved volumes");
    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Attachment, InventoryOp, MemoryInventory, MockCloudInventory};
    use crate::tags::Tags;
    use crate::SnapkeepError;

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

    fn fixture() -> MemoryInventory {
        let inventory = MemoryInventory::new();
        inventory.add_instance("i-1");
        inventory.add_instance("i-2");
        inventory.add_volume("vol-a", tags(&[("env", "prod")]), attached("i-1"));
        inventory.add_volume("vol-b", tags(&[("env", "staging")]), attached("i-1"));
        inventory.add_volume("vol-c", Tags::new(), attached("i-2"));
        inventory.add_volume("vol-d", tags(&[("env", "prod")]), None);
        inventory
    }

    fn ids(volumes: &[Volume]) -> Vec<&str> {
        volumes.iter().map(|v| v.id.as_str()).collect()
    }

    #[test]
    fn test_empty_selection_discovers_all_instances() {
        let inventory = fixture();
        let volumes = resolve_volumes(&inventory, &[], &[], &[]).unwrap();

        assert_eq!(ids(&volumes), vec!["vol-a", "vol-b", "vol-c"]);
        assert_eq!(inventory.calls_to(InventoryOp::ListInstances), 1);
    }

    #[test]
    fn test_explicit_volumes_skip_instance_discovery() {
        let inventory = fixture();
        let volumes = resolve_volumes(&inventory, &[], &["vol-d".to_string()], &[]).unwrap();

        assert_eq!(ids(&volumes), vec!["vol-d"]);
        assert_eq!(inventory.calls_to(InventoryOp::ListInstances), 0);
    }

    #[test]
    fn test_instance_and_volume_selection_is_deduplicated() {
        let inventory = fixture();
        let volumes = resolve_volumes(
            &inventory,
            &["i-1".to_string()],
            &["vol-a".to_string(), "vol-d".to_string(), "vol-d".to_string()],
            &[],
        )
        .unwrap();

        assert_eq!(ids(&volumes), vec!["vol-a", "vol-b", "vol-d"]);
    }

    #[test]
    fn test_tag_filter_drops_non_matching_volumes() {
        let inventory = fixture();
        let filters = vec![TagFilter::equals("env", "prod")];
        let volumes = resolve_volumes(&inventory, &[], &[], &filters).unwrap();

        assert_eq!(ids(&volumes), vec!["vol-a"]);
        assert_eq!(volumes[0].tags.get("env").unwrap(), "prod");
        // Tags were read for every candidate, including the excluded ones.
        assert_eq!(inventory.calls_to(InventoryOp::GetVolumeTags), 3);
    }

    #[test]
    fn test_inventory_failure_is_fatal() {
        let mut mock = MockCloudInventory::new();
        mock.expect_list_instances()
            .times(1)
            .returning(|| Err(SnapkeepError::inventory("access denied")));
        mock.expect_list_volumes_for_instance().never();

        let result = resolve_volumes(&mock, &[], &[], &[]);
        assert!(matches!(result, Err(SnapkeepError::InventoryUnavailable(_))));
    }
}
