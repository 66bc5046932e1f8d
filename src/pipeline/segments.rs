//! Segment processing: tagged result rows → unified per-segment table.
//!
//! Keeps HTTP 200/206 rows, picks one vendor per row, runs that vendor's
//! classifier and keeps only traces the vendor can legitimately report.
//! Every dropped row carries a typed [`Exclusion`] reason.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Timelike};
use rayon::prelude::*;
use serde::Deserialize;

use super::classifier::classify;
use super::headers::HeaderMap;
use super::ingest::{OrderKey, TaggedRecord};
use crate::cdn::{CacheTrace, Cdn};
use crate::config::VendorTaxonomy;
use crate::error::{Exclusion, ProcessError};
use crate::probe::timing::round1;

/// One classified segment observation.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    /// Probe start, truncated to the minute.
    pub timestamp: NaiveDateTime,
    pub location: String,
    /// Service prefix of the manifest's content label.
    pub content: String,
    pub name: String,
    pub quality: String,
    pub latency_ms: Option<f64>,
    pub cache_trace: CacheTrace,
    pub edge_l1: String,
    pub edge_l2: String,
    pub origin: String,
    pub dns_ms: f64,
    pub tcp_ms: f64,
    pub ssl_ms: f64,
    pub cdn: Cdn,
    pub order: OrderKey,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentOptions<'a> {
    pub taxonomy: Option<&'a VendorTaxonomy>,
    /// Fill `ssl_ms` from the DNS phase like historical outputs did.
    pub legacy_ssl_from_dns: bool,
}

#[derive(Debug, Default)]
pub struct SegmentTable {
    /// Partitions concatenated in [`Cdn::ALL`] order, manifest order within each.
    pub rows: Vec<SegmentRow>,
    pub non_success: usize,
    pub excluded: BTreeMap<&'static str, usize>,
}

#[derive(Deserialize)]
struct TimingCells {
    dns: f64,
    tcp: f64,
    #[serde(default)]
    ssl: f64,
}

/// `dd-mm-yyyy_hh:mm:ss:frac` → minute resolution.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let seconds = match raw.rsplit_once(':') {
        Some((head, frac)) if !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => raw,
    };
    NaiveDateTime::parse_from_str(seconds, "%d-%m-%Y_%H:%M:%S")
        .ok()?
        .with_second(0)
}

/// Older writers emitted Python-style single quotes.
fn parse_timing(raw: &str) -> Option<TimingCells> {
    serde_json::from_str(raw)
        .or_else(|_| serde_json::from_str(&raw.replace('\'', "\"")))
        .ok()
}

/// Content names are matched on their service prefix (`vimeo_staff` → `vimeo`).
pub fn content_prefix(content: &str) -> &str {
    content.split('_').next().unwrap_or(content)
}

fn vendor_for(row: &TaggedRecord, content: &str, opts: &SegmentOptions) -> Option<Cdn> {
    row.cdn
        .or_else(|| opts.taxonomy.and_then(|t| t.vendor_for_content(content)))
}

/// Classify a single row.
pub fn process_row(row: &TaggedRecord, opts: &SegmentOptions) -> Result<SegmentRow, Exclusion> {
    let rec = &row.record;
    let content = content_prefix(&rec.content).to_string();
    let cdn = vendor_for(row, &content, opts).ok_or(Exclusion::NoVendor)?;

    let headers =
        HeaderMap::decode(&rec.response_headers).map_err(|_| Exclusion::UndecodableHeaders)?;
    let fields = classify(cdn, &headers);
    if !cdn.accepts(fields.cache_trace) {
        return Err(Exclusion::Unclassifiable(fields.cache_trace));
    }

    let timestamp = parse_timestamp(&rec.timestamp).ok_or(Exclusion::MalformedTimestamp)?;
    let timing = parse_timing(&rec.timing_info).ok_or(Exclusion::MalformedTiming)?;
    let dns_ms = round1(timing.dns);

    Ok(SegmentRow {
        timestamp,
        location: row.location.clone(),
        content,
        name: rec.name.clone(),
        quality: rec.quality.clone(),
        latency_ms: rec.latency_ms.filter(|v| v.is_finite()).map(round1),
        cache_trace: fields.cache_trace,
        edge_l1: fields.edge_l1,
        edge_l2: fields.edge_l2,
        origin: fields.origin,
        dns_ms,
        tcp_ms: round1(timing.tcp),
        ssl_ms: if opts.legacy_ssl_from_dns {
            dns_ms
        } else {
            round1(timing.ssl)
        },
        cdn,
        order: row.order,
    })
}

fn is_success(code: Option<u16>) -> bool {
    matches!(code, Some(200) | Some(206))
}

/// Build the unified segment table.
///
/// Fails with [`ProcessError::NoValidData`] when no row survives.
pub fn process(rows: &[TaggedRecord], opts: &SegmentOptions) -> Result<SegmentTable, ProcessError> {
    let mut table = SegmentTable::default();

    let outcomes: Vec<Result<SegmentRow, Exclusion>> = rows
        .par_iter()
        .filter(|r| is_success(r.record.resp_code))
        .map(|r| process_row(r, opts))
        .collect();
    table.non_success = rows.len() - outcomes.len();

    for outcome in outcomes {
        match outcome {
            Ok(row) => table.rows.push(row),
            Err(reason) => *table.excluded.entry(reason.kind()).or_insert(0) += 1,
        }
    }

    if table.rows.is_empty() {
        return Err(ProcessError::NoValidData);
    }

    // Stable: vendor partition first, then manifest order
    table.rows.sort_by_key(|r| (r.cdn, r.order));

    tracing::info!(
        "Kept {} segment rows ({} non-200/206, excluded: {:?})",
        table.rows.len(),
        table.non_success,
        table.excluded
    );
    Ok(table)
}
