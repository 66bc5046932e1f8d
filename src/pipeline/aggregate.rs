//! Per-video rollups of the unified segment table.
//!
//! Rows are grouped by `(date, location, cdn, content, name, quality)`.
//! Grouping is stable: sequences keep the segment table's row order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::segments::SegmentRow;
use crate::cdn::{CacheTrace, Cdn};

/// Segments per video that feed the latency and cache-trace sequences.
pub const MAX_CHUNKS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAggregate {
    /// `dd-mm-yyyy`.
    pub date: String,
    pub location: String,
    pub cdn: Cdn,
    pub content: String,
    pub name: String,
    pub quality: String,
    /// Mean over the numeric entries of `latency_list`.
    pub latency_mean_ms: Option<f64>,
    pub latency_list: Vec<Option<f64>>,
    pub dns_ms_max: f64,
    pub tcp_ms_mean: f64,
    pub ssl_ms_mean: f64,
    pub origin: String,
    pub cache_trace_seq: Vec<CacheTrace>,
    pub miss_indices: Vec<u32>,
    pub num_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    date: String,
    location: String,
    cdn: Cdn,
    content: String,
    name: String,
    quality: String,
}

/// `1080p_avc` → `1080p`.
pub fn quality_prefix(quality: &str) -> &str {
    quality.split('_').next().unwrap_or(quality)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn rollup(key: GroupKey, rows: &[&SegmentRow]) -> VideoAggregate {
    let head = &rows[..rows.len().min(MAX_CHUNKS)];

    let latency_list: Vec<Option<f64>> = head.iter().map(|r| r.latency_ms).collect();
    let cache_trace_seq: Vec<CacheTrace> = head.iter().map(|r| r.cache_trace).collect();
    let miss_indices = cache_trace_seq
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == CacheTrace::Miss)
        .map(|(i, _)| i as u32)
        .collect();

    VideoAggregate {
        date: key.date,
        location: key.location,
        cdn: key.cdn,
        content: key.content,
        name: key.name,
        quality: key.quality,
        latency_mean_ms: mean(latency_list.iter().flatten().copied()),
        latency_list,
        dns_ms_max: rows.iter().map(|r| r.dns_ms).fold(f64::NEG_INFINITY, f64::max),
        tcp_ms_mean: mean(rows.iter().map(|r| r.tcp_ms)).unwrap_or(f64::NAN),
        ssl_ms_mean: mean(rows.iter().map(|r| r.ssl_ms)).unwrap_or(f64::NAN),
        origin: rows[0].origin.clone(),
        num_chunks: cache_trace_seq.len() as u32,
        cache_trace_seq,
        miss_indices,
    }
}

/// Group and roll up. Output is sorted by group key, so equal input gives
/// identical output.
pub fn aggregate(rows: &[SegmentRow]) -> Vec<VideoAggregate> {
    let mut groups: BTreeMap<GroupKey, Vec<&SegmentRow>> = BTreeMap::new();
    for row in rows {
        let key = GroupKey {
            date: row.timestamp.format("%d-%m-%Y").to_string(),
            location: row.location.clone(),
            cdn: row.cdn,
            content: row.content.clone(),
            name: row.name.clone(),
            quality: quality_prefix(&row.quality).to_string(),
        };
        groups.entry(key).or_default().push(row);
    }

    groups
        .into_iter()
        .map(|(key, members)| rollup(key, &members))
        .collect()
}
