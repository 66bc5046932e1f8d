//! Hit-rate breakdown per CDN and content provider.

use std::fmt::Write;

use super::segments::SegmentRow;
use crate::cdn::{CacheTrace, Cdn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRateRow {
    pub content: String,
    pub requests: usize,
    pub hits: usize,
    pub l1_hits: usize,
    pub l2_hits: usize,
}

impl HitRateRow {
    fn pct(&self, n: usize) -> f64 {
        n as f64 / self.requests.max(1) as f64 * 100.0
    }

    pub fn hit_rate(&self) -> f64 {
        self.pct(self.hits)
    }

    pub fn l1_rate(&self) -> f64 {
        self.pct(self.l1_hits)
    }

    pub fn l2_rate(&self) -> f64 {
        self.pct(self.l2_hits)
    }
}

/// One entry per CDN, contents in order of first appearance.
pub fn summarize(rows: &[SegmentRow]) -> Vec<(Cdn, Vec<HitRateRow>)> {
    let mut out: Vec<(Cdn, Vec<HitRateRow>)> = Vec::new();

    for row in rows {
        let idx = match out.iter().position(|(cdn, _)| *cdn == row.cdn) {
            Some(i) => i,
            None => {
                out.push((row.cdn, Vec::new()));
                out.len() - 1
            }
        };
        let contents = &mut out[idx].1;
        let idx = match contents.iter().position(|c| c.content == row.content) {
            Some(i) => i,
            None => {
                contents.push(HitRateRow {
                    content: row.content.clone(),
                    requests: 0,
                    hits: 0,
                    l1_hits: 0,
                    l2_hits: 0,
                });
                contents.len() - 1
            }
        };

        let entry = &mut contents[idx];
        entry.requests += 1;
        match row.cache_trace {
            CacheTrace::L1 => entry.l1_hits += 1,
            CacheTrace::L2 => entry.l2_hits += 1,
            _ => {}
        }
        if row.cache_trace.is_hit() {
            entry.hits += 1;
        }
    }
    out
}

const COLUMNS: [&str; 8] = [
    "Content",
    "Requests",
    "Hits",
    "L1 Hits",
    "L2 Hits",
    "Hitrate (%)",
    "L1 Hitrate (%)",
    "L2 Hitrate (%)",
];

/// Right-aligned text tables, one per CDN.
pub fn render(summary: &[(Cdn, Vec<HitRateRow>)]) -> String {
    let mut out = String::new();
    for (cdn, rows) in summary {
        let _ = writeln!(out, "****** {} ******", cdn.as_str().to_uppercase());

        let cells: Vec<[String; 8]> = rows
            .iter()
            .map(|r| {
                [
                    r.content.clone(),
                    r.requests.to_string(),
                    r.hits.to_string(),
                    r.l1_hits.to_string(),
                    r.l2_hits.to_string(),
                    format!("{:.1}", r.hit_rate()),
                    format!("{:.1}", r.l1_rate()),
                    format!("{:.1}", r.l2_rate()),
                ]
            })
            .collect();

        let widths: Vec<usize> = (0..COLUMNS.len())
            .map(|i| {
                cells
                    .iter()
                    .map(|c| c[i].len())
                    .chain(std::iter::once(COLUMNS[i].len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |values: &[&str]| {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{:>w$}", v, w = *w))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let _ = writeln!(out, "{}", line(&COLUMNS));
        for c in &cells {
            let refs: Vec<&str> = c.iter().map(String::as_str).collect();
            let _ = writeln!(out, "{}", line(&refs));
        }
    }
    out
}
