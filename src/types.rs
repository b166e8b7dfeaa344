use std::collections::HashMap;

/// Timestamp type (opaque seconds since epoch; the engine ascribes no
/// calendar semantics).
pub type Timestamp = u64;

/// Value type.
pub type Value = f64;

/// TagSet type (using a HashMap for flexibility).
pub type TagSet = HashMap<String, String>;

/// A single timestamped sample belonging to a metric.
///
/// Two samples belong to the same series iff their metric strings are
/// byte-equal and their tag maps are equal as sets of key-value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub timestamp: Timestamp,
    pub value: Value,
    pub tags: TagSet,
}

impl Sample {
    /// Convenience constructor for an untagged sample.
    pub fn new(metric: impl Into<String>, timestamp: Timestamp, value: Value) -> Self {
        Sample {
            metric: metric.into(),
            timestamp,
            value,
            tags: TagSet::new(),
        }
    }

    /// Constructor carrying a tag set.
    pub fn with_tags(
        metric: impl Into<String>,
        timestamp: Timestamp,
        value: Value,
        tags: TagSet,
    ) -> Self {
        Sample {
            metric: metric.into(),
            timestamp,
            value,
            tags,
        }
    }
}

/// Tags sorted by key then value, for deterministic on-disk ordering and
/// stable hashing of series identity.
pub(crate) fn sorted_tag_pairs(tags: &TagSet) -> Vec<(&str, &str)> {
    let mut kv: Vec<(&str, &str)> = tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    kv.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));
    kv
}
