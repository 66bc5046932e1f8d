//! Parquet output of a QoE batch.
//!
//! The video table's columns come first, followed by one column per QoE
//! metric in order of first appearance. A metric whose values are all
//! numeric is stored as float64; anything else is stored as text. When a
//! metric shares a name with a video column, the metric wins.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use serde_json::{Map, Value};

use super::video_table::{self, write_batch};
use crate::pipeline::aggregate::VideoAggregate;

fn metric_names(rows: &[(VideoAggregate, Map<String, Value>)]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for (_, qoe) in rows {
        for key in qoe.keys() {
            if !names.iter().any(|n| n == key) {
                names.push(key.clone());
            }
        }
    }
    names
}

fn metric_column(rows: &[(VideoAggregate, Map<String, Value>)], name: &str) -> ArrayRef {
    let values: Vec<Option<&Value>> = rows
        .iter()
        .map(|(_, qoe)| qoe.get(name).filter(|v| !v.is_null()))
        .collect();

    if values.iter().flatten().all(|v| v.is_number()) {
        Arc::new(Float64Array::from(
            values
                .iter()
                .map(|v| v.and_then(Value::as_f64))
                .collect::<Vec<_>>(),
        ))
    } else {
        Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| {
                    v.map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                })
                .collect::<Vec<_>>(),
        ))
    }
}

pub fn to_record_batch(rows: &[(VideoAggregate, Map<String, Value>)]) -> Result<RecordBatch> {
    let videos: Vec<VideoAggregate> = rows.iter().map(|(v, _)| v.clone()).collect();
    let base = video_table::to_record_batch(&videos)?;
    let metrics = metric_names(rows);

    let schema = base.schema();
    let mut columns: Vec<(String, ArrayRef)> = schema
        .fields()
        .iter()
        .zip(base.columns())
        .filter(|(field, _)| !metrics.iter().any(|m| m == field.name()))
        .map(|(field, column)| (field.name().clone(), column.clone()))
        .collect();
    for name in &metrics {
        columns.push((name.clone(), metric_column(rows, name)));
    }

    RecordBatch::try_from_iter(columns).context("building QoE table batch")
}

/// Write the merged rows to `path`. An empty batch still writes the video
/// schema with no rows.
pub fn write_qoe_table(path: &Path, rows: &[(VideoAggregate, Map<String, Value>)]) -> Result<()> {
    let batch = to_record_batch(rows)?;
    write_batch(path, &batch)?;
    tracing::info!("Wrote {} QoE rows to {}", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdn::{CacheTrace, Cdn};
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;

    fn video(name: &str) -> VideoAggregate {
        VideoAggregate {
            date: "04-05-2026".into(),
            location: "paris".into(),
            cdn: Cdn::Akamai,
            content: "zdf".into(),
            name: name.into(),
            quality: "720p".into(),
            latency_mean_ms: Some(12.0),
            latency_list: vec![Some(12.0)],
            dns_ms_max: 1.0,
            tcp_ms_mean: 2.0,
            ssl_ms_mean: 3.0,
            origin: "NaN".into(),
            cache_trace_seq: vec![CacheTrace::L1],
            miss_indices: vec![],
            num_chunks: 1,
        }
    }

    fn qoe(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_metric_columns_follow_video_columns() {
        let rows = vec![
            (video("a"), qoe(json!({"rebuffer_time": 1.5, "sabre_abr": "dynamic"}))),
            (video("b"), qoe(json!({"rebuffer_time": 2, "stalls": 4, "sabre_abr": "bola"}))),
        ];
        let batch = to_record_batch(&rows).unwrap();
        let schema = batch.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();

        assert_eq!(names[0], "date");
        assert_eq!(&names[15..], &["rebuffer_time", "sabre_abr", "stalls"]);

        let rebuffer = batch
            .column_by_name("rebuffer_time")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(rebuffer.value(1), 2.0);

        let stalls = batch
            .column_by_name("stalls")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!(stalls.is_null(0));
        assert_eq!(stalls.value(1), 4.0);

        let abr = batch
            .column_by_name("sabre_abr")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(abr.value(0), "dynamic");
    }

    #[test]
    fn test_metric_overrides_video_column() {
        let rows = vec![(video("a"), qoe(json!({"origin": "from-sim"})))];
        let batch = to_record_batch(&rows).unwrap();
        assert_eq!(batch.num_columns(), 15);
        let origin = batch
            .column_by_name("origin")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(origin.value(0), "from-sim");
    }

    #[test]
    fn test_empty_batch_writes_schema_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qoe.parquet");
        write_qoe_table(&path, &[]).unwrap();

        let builder =
            ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(builder.schema().fields().len(), 15);
        let rows: usize = builder.build().unwrap().map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 0);
    }
}
