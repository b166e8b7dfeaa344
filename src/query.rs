//! Per-chunk query execution: time-range narrowing by binary search, then
//! parallel tag filtering over the surviving index range.

use crate::chunk::{tags_match, ColumnarChunk};
use crate::types::{Sample, TagSet, Timestamp};
use rayon::prelude::*;

/// Scans one chunk for rows with `timestamp in [lo, hi]` whose tags are a
/// superset of `tag_filter`, materializing them as samples of `metric`.
///
/// The time range is narrowed by binary search first; the tag filter is then
/// applied across that index range in parallel. Ordered collection keeps the
/// output in chunk (timestamp) order.
pub(crate) fn scan_chunk(
    chunk: &ColumnarChunk,
    metric: &str,
    lo: Timestamp,
    hi: Timestamp,
    tag_filter: &TagSet,
) -> Vec<Sample> {
    let range = chunk.query_time_range(lo, hi);
    if range.is_empty() {
        return Vec::new();
    }

    let timestamps = chunk.timestamps();
    let values = chunk.values();
    let tags = chunk.tags();

    range
        .into_par_iter()
        .filter_map(|i| {
            if tag_filter.is_empty() || tags_match(&tags[i], tag_filter) {
                Some(Sample {
                    metric: metric.to_string(),
                    timestamp: timestamps[i],
                    value: values[i],
                    tags: tags[i].clone(),
                })
            } else {
                None
            }
        })
        .collect()
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

    fn test_chunk() -> ColumnarChunk {
        let mut chunk = ColumnarChunk::new();
        chunk.append(100, 1.0, tags(&[("host", "a")])).unwrap();
        chunk.append(200, 2.0, tags(&[("host", "b")])).unwrap();
        chunk.append(300, 3.0, tags(&[("host", "a"), ("dc", "x")])).unwrap();
        chunk.append(400, 4.0, TagSet::new()).unwrap();
        chunk
    }

    #[test]
    fn scan_honors_time_range() {
        let chunk = test_chunk();
        let out = scan_chunk(&chunk, "cpu", 150, 350, &TagSet::new());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 200);
        assert_eq!(out[1].timestamp, 300);
        assert_eq!(out[0].metric, "cpu");
    }

    #[test]
    fn scan_applies_tag_superset_filter() {
        let chunk = test_chunk();
        let out = scan_chunk(&chunk, "cpu", 0, 500, &tags(&[("host", "a")]));
        let ts: Vec<u64> = out.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![100, 300]);

        let narrow = scan_chunk(&chunk, "cpu", 0, 500, &tags(&[("host", "a"), ("dc", "x")]));
        assert_eq!(narrow.len(), 1);
        assert_eq!(narrow[0].timestamp, 300);
    }

    #[test]
    fn scan_preserves_chunk_order() {
        let mut chunk = ColumnarChunk::new();
        for i in 0..200u64 {
            chunk.append(i, i as f64, TagSet::new()).unwrap();
        }
        let out = scan_chunk(&chunk, "m", 0, 1000, &TagSet::new());
        let ts: Vec<u64> = out.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, (0..200).collect::<Vec<u64>>());
    }

    #[test]
    fn scan_outside_range_is_empty() {
        let chunk = test_chunk();
        assert!(scan_chunk(&chunk, "cpu", 500, 900, &TagSet::new()).is_empty());
        assert!(scan_chunk(&chunk, "cpu", 300, 200, &TagSet::new()).is_empty());
    }
}
