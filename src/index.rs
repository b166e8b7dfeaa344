//! Adaptive chunk index: prunes sealed chunks by metric, time bounds, and
//! tag presence, and keeps query-pattern telemetry that periodically
//! triggers a layout optimization.

use crate::types::{sorted_tag_pairs, TagSet, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Queries between optimization passes.
const OPTIMIZE_EVERY: u64 = 1000;

/// Per key, the set of tag values observed inside a chunk.
pub type TagPresence = HashMap<String, HashSet<String>>;

#[derive(Debug, Clone)]
struct IndexEntry {
    chunk_id: u64,
    metric: String,
    min_ts: Timestamp,
    max_ts: Timestamp,
    tag_presence: TagPresence,
}

#[derive(Debug, Default)]
struct IndexInner {
    entries: Vec<IndexEntry>,
    query_patterns: HashMap<String, u64>,
    query_count: u64,
}

/// Registry of sealed chunks with query-driven reorganization.
///
/// All methods take the internal lock; readers share it, registration and
/// removal take it exclusively.
#[derive(Debug, Default)]
pub struct AdaptiveIndex {
    inner: RwLock<IndexInner>,
}

impl AdaptiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sealed chunk. `tag_presence` must be computed from the
    /// chunk's tag column (see [`ColumnarChunk::tag_presence`]).
    ///
    /// [`ColumnarChunk::tag_presence`]: crate::chunk::ColumnarChunk::tag_presence
    pub fn add_chunk(
        &self,
        chunk_id: u64,
        metric: &str,
        min_ts: Timestamp,
        max_ts: Timestamp,
        tag_presence: TagPresence,
    ) {
        let mut inner = self.inner.write().expect("adaptive index lock");
        inner.entries.push(IndexEntry {
            chunk_id,
            metric: metric.to_string(),
            min_ts,
            max_ts,
            tag_presence,
        });
    }

    /// Every registered chunk of `metric` whose `[min_ts, max_ts]` overlaps
    /// `[lo, hi]` and whose tag presence covers every filter pair. Also
    /// records the query's fingerprint and may re-sort the entries for
    /// locality every [`OPTIMIZE_EVERY`] queries.
    pub fn find_chunks(
        &self,
        metric: &str,
        lo: Timestamp,
        hi: Timestamp,
        tags: &TagSet,
    ) -> Vec<u64> {
        let mut inner = self.inner.write().expect("adaptive index lock");

        let fingerprint = query_fingerprint(metric, tags);
        *inner.query_patterns.entry(fingerprint).or_insert(0) += 1;
        inner.query_count += 1;

        let result = inner
            .entries
            .iter()
            .filter(|e| e.metric == metric)
            .filter(|e| e.max_ts >= lo && e.min_ts <= hi)
            .filter(|e| {
                tags.iter().all(|(k, v)| {
                    e.tag_presence
                        .get(k)
                        .map(|values| values.contains(v))
                        .unwrap_or(false)
                })
            })
            .map(|e| e.chunk_id)
            .collect();

        if inner.query_count % OPTIMIZE_EVERY == 0 {
            optimize(&mut inner);
        }

        result
    }

    /// Drops every entry belonging to `metric`.
    pub fn remove_metric(&self, metric: &str) {
        let mut inner = self.inner.write().expect("adaptive index lock");
        inner.entries.retain(|e| e.metric != metric);
    }

    /// Total `find_chunks` invocations since construction.
    pub fn query_count(&self) -> u64 {
        self.inner.read().expect("adaptive index lock").query_count
    }

    /// Hit count for one query fingerprint (`metric:k=v...`).
    pub fn pattern_count(&self, metric: &str, tags: &TagSet) -> u64 {
        let inner = self.inner.read().expect("adaptive index lock");
        inner
            .query_patterns
            .get(&query_fingerprint(metric, tags))
            .copied()
            .unwrap_or(0)
    }

    /// Number of registered chunks (for diagnostics and tests).
    pub fn len(&self) -> usize {
        self.inner.read().expect("adaptive index lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Behavior-preserving rearrangement: sorted by `(metric, min_ts)` so later
/// lookups scan matching metrics contiguously.
fn optimize(inner: &mut IndexInner) {
    inner
        .entries
        .sort_by(|a, b| a.metric.cmp(&b.metric).then(a.min_ts.cmp(&b.min_ts)));
}

fn query_fingerprint(metric: &str, tags: &TagSet) -> String {
    let mut fingerprint = metric.to_string();
    for (k, v) in sorted_tag_pairs(tags) {
        fingerprint.push(':');
        fingerprint.push_str(k);
        fingerprint.push('=');
        fingerprint.push_str(v);
    }
    fingerprint
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn presence(pairs: &[(&str, &[&str])]) -> TagPresence {
        pairs
            .iter()
            .map(|(k, vs)| {
                (
                    k.to_string(),
                    vs.iter().map(|v| v.to_string()).collect::<HashSet<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn finds_chunks_by_metric_and_time_overlap() {
        let index = AdaptiveIndex::new();
        index.add_chunk(0, "cpu", 0, 99, TagPresence::new());
        index.add_chunk(1, "cpu", 100, 199, TagPresence::new());
        index.add_chunk(0, "mem", 0, 99, TagPresence::new());

        assert_eq!(index.find_chunks("cpu", 50, 150, &TagSet::new()), vec![0, 1]);
        assert_eq!(index.find_chunks("cpu", 120, 130, &TagSet::new()), vec![1]);
        assert_eq!(index.find_chunks("mem", 0, 10, &TagSet::new()), vec![0]);
        assert!(index.find_chunks("cpu", 500, 600, &TagSet::new()).is_empty());
        assert!(index.find_chunks("disk", 0, 100, &TagSet::new()).is_empty());
    }

    #[test]
    fn boundary_overlap_is_inclusive() {
        let index = AdaptiveIndex::new();
        index.add_chunk(0, "cpu", 100, 200, TagPresence::new());
        assert_eq!(index.find_chunks("cpu", 200, 300, &TagSet::new()), vec![0]);
        assert_eq!(index.find_chunks("cpu", 0, 100, &TagSet::new()), vec![0]);
    }

    #[test]
    fn tag_presence_prunes_chunks() {
        let index = AdaptiveIndex::new();
        index.add_chunk(0, "cpu", 0, 99, presence(&[("host", &["a", "b"])]));
        index.add_chunk(1, "cpu", 100, 199, presence(&[("host", &["c"])]));

        assert_eq!(
            index.find_chunks("cpu", 0, 200, &tags(&[("host", "a")])),
            vec![0]
        );
        assert_eq!(
            index.find_chunks("cpu", 0, 200, &tags(&[("host", "c")])),
            vec![1]
        );
        assert!(index
            .find_chunks("cpu", 0, 200, &tags(&[("host", "z")]))
            .is_empty());
        assert!(index
            .find_chunks("cpu", 0, 200, &tags(&[("region", "eu")]))
            .is_empty());
    }

    #[test]
    fn query_telemetry_counts_patterns() {
        let index = AdaptiveIndex::new();
        index.add_chunk(0, "cpu", 0, 99, TagPresence::new());

        let filter = tags(&[("host", "a"), ("region", "eu")]);
        index.find_chunks("cpu", 0, 10, &filter);
        index.find_chunks("cpu", 0, 10, &filter);
        index.find_chunks("cpu", 0, 10, &TagSet::new());

        assert_eq!(index.query_count(), 3);
        assert_eq!(index.pattern_count("cpu", &filter), 2);
        assert_eq!(index.pattern_count("cpu", &TagSet::new()), 1);
        assert_eq!(index.pattern_count("mem", &TagSet::new()), 0);
    }

    #[test]
    fn optimization_preserves_results() {
        let index = AdaptiveIndex::new();
        index.add_chunk(1, "cpu", 100, 199, TagPresence::new());
        index.add_chunk(0, "cpu", 0, 99, TagPresence::new());

        let before = {
            let mut ids = index.find_chunks("cpu", 0, 200, &TagSet::new());
            ids.sort_unstable();
            ids
        };
        // Push past the optimization threshold.
        for _ in 0..(OPTIMIZE_EVERY + 10) {
            index.find_chunks("cpu", 0, 200, &TagSet::new());
        }
        let mut after = index.find_chunks("cpu", 0, 200, &TagSet::new());
        after.sort_unstable();
        assert_eq!(before, after);
    }

    #[test]
    fn remove_metric_drops_entries() {
        let index = AdaptiveIndex::new();
        index.add_chunk(0, "cpu", 0, 99, TagPresence::new());
        index.add_chunk(0, "mem", 0, 99, TagPresence::new());

        index.remove_metric("cpu");
        assert!(index.find_chunks("cpu", 0, 100, &TagSet::new()).is_empty());
        assert_eq!(index.find_chunks("mem", 0, 100, &TagSet::new()), vec![0]);
        assert_eq!(index.len(), 1);
    }
}
