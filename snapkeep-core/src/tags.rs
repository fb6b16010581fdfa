/*!
Tag sets, tag filters and the predicates evaluated against them.

A tag set is an ordered `key -> value` map. Filters come in two flavours:
an OR-list evaluated with [`matches_any`] (at least one filter must match)
and a required list evaluated with [`has_all`] (every key must be present,
values ignored). Both are vacuously true for an empty list.
*/

use crate::{Result, SnapkeepError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ordered tag set of a volume or snapshot.
pub type Tags = BTreeMap<String, String>;

/// A single tag filter: `key` (existence) or `key=value` (exact match).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagFilter {
    pub key: String,
    pub value: Option<String>,
}

impl TagFilter {
    /// Filter that matches when `key` is present, whatever its value.
    pub fn exists<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Filter that matches when `key` is present with exactly `value`.
    pub fn equals<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Evaluate this filter against a tag set. Comparison is case-sensitive.
    pub fn matches(&self, tags: &Tags) -> bool {
        match (tags.get(&self.key), &self.value) {
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
            (None, _) => false,
        }
    }
}

impl FromStr for TagFilter {
    type Err = SnapkeepError;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (key, value) = match raw.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (raw, None),
        };
        if key.is_empty() {
            return Err(SnapkeepError::validation(format!(
                "tag filter '{raw}' has an empty key"
            )));
        }
        Ok(Self {
            key: key.to_string(),
            value,
        })
    }
}

impl TryFrom<String> for TagFilter {
    type Error = SnapkeepError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<TagFilter> for String {
    fn from(filter: TagFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

/// Copy rule from a volume tag to a (possibly renamed) snapshot tag.
///
/// Written as `Source=Target`, or just `Source` to keep the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagMapEntry {
    pub source: String,
    pub target: String,
}

impl TagMapEntry {
    pub fn new<S: Into<String>, T: Into<String>>(source: S, target: T) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl FromStr for TagMapEntry {
    type Err = SnapkeepError;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (source, target) = match raw.split_once('=') {
            Some((source, "")) => (source, source),
            Some((source, target)) => (source, target),
            None => (raw, raw),
        };
        if source.is_empty() {
            return Err(SnapkeepError::validation(format!(
                "tag map entry '{raw}' has an empty source key"
            )));
        }
        Ok(Self::new(source, target))
    }
}

impl TryFrom<String> for TagMapEntry {
    type Error = SnapkeepError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<TagMapEntry> for String {
    fn from(entry: TagMapEntry) -> Self {
        if entry.source == entry.target {
            entry.source
        } else {
            format!("{}={}", entry.source, entry.target)
        }
    }
}

/// Parse a `key=value` pair as given to `--extra-tags`.
pub fn parse_tag_pair(raw: &str) -> Result<(String, String)> {
    match raw.trim().split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(SnapkeepError::validation(format!(
            "tag '{raw}' must be written as key=value"
        ))),
    }
}

/// True if `filters` is empty or at least one filter matches `tags`.
pub fn matches_any(tags: &Tags, filters: &[TagFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|filter| filter.matches(tags))
}

/// True if every required key is present in `tags`. Values are not compared.
pub fn has_all(tags: &Tags, required: &[TagFilter]) -> bool {
    required.iter().all(|filter| tags.contains_key(&filter.key))
}

/// Turn a tag set into the key-only filter list used by the ownership gate.
pub fn required_keys(tags: &Tags) -> Vec<TagFilter> {
    tags.keys().map(TagFilter::exists).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_filter_list_always_passes() {
        assert!(matches_any(&Tags::new(), &[]));
        assert!(matches_any(&tags(&[("env", "prod")]), &[]));
        assert!(has_all(&Tags::new(), &[]));
    }

    #[test]
    fn test_matches_any_existence_and_value() {
        let volume = tags(&[("env", "prod"), ("team", "core")]);

        assert!(matches_any(&volume, &[TagFilter::exists("env")]));
        assert!(matches_any(&volume, &[TagFilter::equals("env", "prod")]));
        assert!(!matches_any(&volume, &[TagFilter::equals("env", "staging")]));
        assert!(!matches_any(&volume, &[TagFilter::exists("owner")]));
        assert!(matches_any(
            &volume,
            &[TagFilter::equals("env", "staging"), TagFilter::exists("team")]
        ));
    }

    #[test]
    fn test_matches_any_is_case_sensitive() {
        let volume = tags(&[("Env", "Prod")]);
        assert!(!matches_any(&volume, &[TagFilter::equals("env", "Prod")]));
        assert!(!matches_any(&volume, &[TagFilter::equals("Env", "prod")]));
    }

    #[test]
    fn test_has_all_ignores_values() {
        let snapshot = tags(&[("CreatedBy", "SomethingElse"), ("env", "prod")]);
        assert!(has_all(
            &snapshot,
            &[TagFilter::equals("CreatedBy", "AutomatedBackup")]
        ));
        assert!(!has_all(
            &snapshot,
            &[TagFilter::exists("CreatedBy"), TagFilter::exists("Retention")]
        ));
    }

    #[test]
    fn test_filter_parsing() {
        assert_eq!(
            "env=prod".parse::<TagFilter>().unwrap(),
            TagFilter::equals("env", "prod")
        );
        assert_eq!(
            "backup".parse::<TagFilter>().unwrap(),
            TagFilter::exists("backup")
        );
        assert_eq!(
            "url=a=b".parse::<TagFilter>().unwrap(),
            TagFilter::equals("url", "a=b")
        );
        assert!("=prod".parse::<TagFilter>().is_err());
    }

    #[test]
    fn test_tag_map_parsing() {
        let entry: TagMapEntry = "Name=BackupName".parse().unwrap();
        assert_eq!(entry, TagMapEntry::new("Name", "BackupName"));

        let entry: TagMapEntry = "Owner".parse().unwrap();
        assert_eq!(entry, TagMapEntry::new("Owner", "Owner"));
        assert_eq!(String::from(entry), "Owner");

        assert!("=Target".parse::<TagMapEntry>().is_err());
    }

    #[test]
    fn test_tag_pair_parsing() {
        assert_eq!(
            parse_tag_pair("Retention=30d").unwrap(),
            ("Retention".to_string(), "30d".to_string())
        );
        assert!(parse_tag_pair("Retention").is_err());
        assert!(parse_tag_pair("=x").is_err());
    }

    #[test]
    fn test_filters_serialize_as_cli_strings() {
        let filters = vec![TagFilter::equals("env", "prod"), TagFilter::exists("backup")];
        let json = serde_json::to_string(&filters).unwrap();
        assert_eq!(json, r#"["env=prod","backup"]"#);

        let parsed: Vec<TagFilter> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filters);
    }
}
