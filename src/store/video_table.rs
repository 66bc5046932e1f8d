//! Parquet persistence of the per-video table.
//!
//! One row group per write, snappy-compressed. The file is written under a
//! dotted temp name and renamed into place, so readers never see a partial
//! table and an empty batch leaves no file behind.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, ListArray, ListBuilder, StringArray,
    StringBuilder, UInt32Array, UInt32Builder,
};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::cdn::{CacheTrace, Cdn};
use crate::error::ProcessError;
use crate::pipeline::aggregate::VideoAggregate;

fn strings<'a, F>(rows: &'a [VideoAggregate], f: F) -> ArrayRef
where
    F: Fn(&'a VideoAggregate) -> &'a str,
{
    Arc::new(StringArray::from_iter_values(rows.iter().map(f)))
}

fn floats<F: Fn(&VideoAggregate) -> f64>(rows: &[VideoAggregate], f: F) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

pub fn to_record_batch(rows: &[VideoAggregate]) -> Result<RecordBatch> {
    let mut latency_list = ListBuilder::new(Float64Builder::new());
    let mut cache_trace_seq = ListBuilder::new(StringBuilder::new());
    let mut miss_indices = ListBuilder::new(UInt32Builder::new());
    for row in rows {
        for v in &row.latency_list {
            latency_list.values().append_option(*v);
        }
        latency_list.append(true);

        for t in &row.cache_trace_seq {
            cache_trace_seq.values().append_value(t.as_str());
        }
        cache_trace_seq.append(true);

        miss_indices.values().append_slice(&row.miss_indices);
        miss_indices.append(true);
    }

    let columns: Vec<(&str, ArrayRef)> = vec![
        ("date", strings(rows, |r| r.date.as_str())),
        ("location", strings(rows, |r| r.location.as_str())),
        ("cdn", strings(rows, |r| r.cdn.as_str())),
        ("content", strings(rows, |r| r.content.as_str())),
        ("name", strings(rows, |r| r.name.as_str())),
        ("quality", strings(rows, |r| r.quality.as_str())),
        (
            "latency_mean_ms",
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.latency_mean_ms).collect::<Vec<_>>(),
            )),
        ),
        ("latency_list", Arc::new(latency_list.finish())),
        ("dns_ms_max", floats(rows, |r| r.dns_ms_max)),
        ("tcp_ms_mean", floats(rows, |r| r.tcp_ms_mean)),
        ("ssl_ms_mean", floats(rows, |r| r.ssl_ms_mean)),
        ("origin", strings(rows, |r| r.origin.as_str())),
        ("cache_trace_seq", Arc::new(cache_trace_seq.finish())),
        ("miss_indices", Arc::new(miss_indices.finish())),
        (
            "num_chunks",
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| r.num_chunks).collect::<Vec<_>>(),
            )),
        ),
    ];

    RecordBatch::try_from_iter(columns).context("building video table batch")
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "videos.parquet".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write `batch` to `path` through a dotted temp file.
pub(super) fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp = temp_path(path);
    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let written = (|| -> Result<()> {
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.context(format!("writing {}", path.display())));
    }

    std::fs::rename(&tmp, path)
        .with_context(|| format!("moving {} into place", path.display()))
}

/// Write the table to `path`. Refuses to write an empty table.
pub fn write_video_table(path: &Path, rows: &[VideoAggregate]) -> Result<()> {
    if rows.is_empty() {
        return Err(ProcessError::NoValidData.into());
    }
    let batch = to_record_batch(rows)?;
    write_batch(path, &batch)?;
    tracing::info!("Wrote {} video rows to {}", rows.len(), path.display());
    Ok(())
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .with_context(|| format!("column {:?} missing or of unexpected type", name))
}

/// Read a table written by [`write_video_table`].
pub fn read_video_table(path: &Path) -> Result<Vec<VideoAggregate>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata of {}", path.display()))?
        .build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let date = column::<StringArray>(&batch, "date")?;
        let location = column::<StringArray>(&batch, "location")?;
        let cdn = column::<StringArray>(&batch, "cdn")?;
        let content = column::<StringArray>(&batch, "content")?;
        let name = column::<StringArray>(&batch, "name")?;
        let quality = column::<StringArray>(&batch, "quality")?;
        let latency_mean = column::<Float64Array>(&batch, "latency_mean_ms")?;
        let latency_list = column::<ListArray>(&batch, "latency_list")?;
        let dns_max = column::<Float64Array>(&batch, "dns_ms_max")?;
        let tcp_mean = column::<Float64Array>(&batch, "tcp_ms_mean")?;
        let ssl_mean = column::<Float64Array>(&batch, "ssl_ms_mean")?;
        let origin = column::<StringArray>(&batch, "origin")?;
        let traces = column::<ListArray>(&batch, "cache_trace_seq")?;
        let misses = column::<ListArray>(&batch, "miss_indices")?;
        let num_chunks = column::<UInt32Array>(&batch, "num_chunks")?;

        for i in 0..batch.num_rows() {
            let lat = latency_list.value(i);
            let lat = lat
                .as_any()
                .downcast_ref::<Float64Array>()
                .context("latency_list items")?;
            let seq = traces.value(i);
            let seq = seq
                .as_any()
                .downcast_ref::<StringArray>()
                .context("cache_trace_seq items")?;
            let miss = misses.value(i);
            let miss = miss
                .as_any()
                .downcast_ref::<UInt32Array>()
                .context("miss_indices items")?;

            rows.push(VideoAggregate {
                date: date.value(i).to_string(),
                location: location.value(i).to_string(),
                cdn: cdn.value(i).parse::<Cdn>()?,
                content: content.value(i).to_string(),
                name: name.value(i).to_string(),
                quality: quality.value(i).to_string(),
                latency_mean_ms: (!latency_mean.is_null(i)).then(|| latency_mean.value(i)),
                latency_list: lat.iter().collect(),
                dns_ms_max: dns_max.value(i),
                tcp_ms_mean: tcp_mean.value(i),
                ssl_ms_mean: ssl_mean.value(i),
                origin: origin.value(i).to_string(),
                cache_trace_seq: seq
                    .iter()
                    .map(|t| t.unwrap_or("NaN").parse::<CacheTrace>())
                    .collect::<Result<_>>()?,
                miss_indices: miss.iter().flatten().collect(),
                num_chunks: num_chunks.value(i),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn video(name: &str, latencies: Vec<Option<f64>>, traces: Vec<CacheTrace>) -> VideoAggregate {
        let miss_indices = traces
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == CacheTrace::Miss)
            .map(|(i, _)| i as u32)
            .collect();
        VideoAggregate {
            date: "04-05-2026".into(),
            location: "paris".into(),
            cdn: Cdn::Edgio,
            content: "rakuten".into(),
            name: name.into(),
            quality: "720p".into(),
            latency_mean_ms: Some(21.5),
            latency_list: latencies,
            dns_ms_max: 3.2,
            tcp_ms_mean: 11.0,
            ssl_ms_mean: 24.75,
            origin: "ECAcc".into(),
            num_chunks: traces.len() as u32,
            cache_trace_seq: traces,
            miss_indices,
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("videos.parquet");

        let mut second = video("b", vec![None, Some(3.0)], vec![CacheTrace::L2, CacheTrace::Miss]);
        second.latency_mean_ms = None;
        let rows = vec![
            video(
                "a",
                vec![Some(10.0), Some(33.0)],
                vec![CacheTrace::Miss, CacheTrace::L1],
            ),
            second,
        ];

        write_video_table(&path, &rows).unwrap();
        assert!(path.exists());
        assert!(!temp_path(&path).exists());

        let back = read_video_table(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_empty_table_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videos.parquet");

        let err = write_video_table(&path, &[]).unwrap_err();
        assert!(err.downcast_ref::<ProcessError>().is_some());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_batch_schema() {
        let batch = to_record_batch(&[video("a", vec![Some(1.0)], vec![CacheTrace::L1])]).unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.num_columns(), 15);
        assert!(batch.column_by_name("miss_indices").is_some());
    }
}
