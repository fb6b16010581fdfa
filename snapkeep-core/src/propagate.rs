/*!
Computes the tag set written onto a freshly created snapshot.
*/

use crate::tags::{TagMapEntry, Tags};
use tracing::debug;

/// Build the tags for a new snapshot.
///
/// Order of precedence is first-write-wins: default tags, then extra tags,
/// then the volume tags copied through `tag_map`. A later source never
/// replaces a key already set, so a tag map cannot clobber the ownership
/// marker. Map entries whose source tag is missing or empty are skipped.
pub fn compute_snapshot_tags(
    volume_tags: &Tags,
    default_tags: &Tags,
    extra_tags: &Tags,
    tag_map: &[TagMapEntry],
) -> Tags {
    let mut result = default_tags.clone();

    for (key, value) in extra_tags {
        result
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }

    for entry in tag_map {
        let value = match volume_tags.get(&entry.source) {
            Some(value) if !value.is_empty() => value,
            _ => {
                debug!(
                    source = %entry.source,
                    target = %entry.target,
                    "Volume has no value for mapped tag, skipping"
                );
                continue;
            }
        };

        if result.contains_key(&entry.target) {
            debug!(
                target = %entry.target,
                "Snapshot tag already set, keeping first value"
            );
            continue;
        }
        result.insert(entry.target.clone(), value.clone());
    }

    result
}
