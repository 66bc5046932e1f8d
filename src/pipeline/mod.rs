pub mod aggregate;
pub mod classifier;
pub mod headers;
pub mod hitrate;
pub mod ingest;
pub mod segments;

use anyhow::Result;

use crate::config::ProcessConfig;
use crate::error::ProcessError;
use crate::store;
use segments::{SegmentOptions, SegmentTable};

/// What a `process` run read, kept and wrote.
#[derive(Debug)]
pub struct ProcessReport {
    pub files: usize,
    pub rows_read: usize,
    pub segments: SegmentTable,
    pub videos: usize,
}

/// Results tree → per-video Parquet table at `config.output_path`.
///
/// Nothing is written unless at least one row survives classification.
pub async fn run(config: &ProcessConfig) -> Result<ProcessReport> {
    let table = ingest::ingest(config).await?;
    if table.rows.is_empty() {
        return Err(ProcessError::NoValidData.into());
    }

    let options = SegmentOptions {
        taxonomy: Some(&config.taxonomy),
        legacy_ssl_from_dns: config.legacy_ssl_from_dns,
    };
    let segments = segments::process(&table.rows, &options)?;
    let videos = aggregate::aggregate(&segments.rows);
    store::write_video_table(&config.output_path, &videos)?;

    Ok(ProcessReport {
        files: table.files,
        rows_read: table.rows.len(),
        segments,
        videos: videos.len(),
    })
}
