//! Runner for the external ABR/QoE simulator.
//!
//! Each video row becomes one simulator invocation. The miss positions and
//! latency trace are passed as a JSON payload; the simulator prints exactly
//! one JSON line with a `buffer_size` key, which is trimmed and merged back
//! onto the row. A failed row is logged and dropped; the batch continues.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::QoeConfig;
use crate::error::QoeError;
use crate::pipeline::aggregate::VideoAggregate;
use crate::pool::WorkerPool;
use crate::store;

/// Simulator internals that are not kept in the output.
const DROPPED_KEYS: [&str; 12] = [
    "time_average_played_utility",
    "total_played_utility",
    "buffer_size",
    "num_chunks",
    "over_estimate_count",
    "over_estimate",
    "leq_estimate_count",
    "leq_estimate",
    "estimate",
    "total_reaction_time",
    "total_log_bitrate_change",
    "time_average_log_bitrate_change",
];

#[derive(Debug, Serialize)]
struct MissPayload<'a> {
    miss_indices: &'a [u32],
    miss_latency: f64,
    latency_list: &'a [Option<f64>],
}

pub fn build_payload(
    miss_indices: &[u32],
    latency_list: &[Option<f64>],
    miss_latency: f64,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&MissPayload {
        miss_indices,
        miss_latency,
        latency_list,
    })
}

fn simulator_args(config: &QoeConfig, payload: String) -> Vec<String> {
    vec![
        config.simulator.display().to_string(),
        "-v".into(),
        "-n".into(),
        config.network_json.display().to_string(),
        "-m".into(),
        config.manifest_json.display().to_string(),
        "-b".into(),
        config.buffer_size.to_string(),
        "-nm".into(),
        config.bandwidth.to_string(),
        "-a".into(),
        config.abr.clone(),
        "-nmd".into(),
        payload,
    ]
}

/// Find the QoE line among diagnostic output.
pub fn parse_qoe_line(stdout: &str) -> Option<Map<String, Value>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{') && l.contains("\"buffer_size\""))
        .find_map(|l| serde_json::from_str::<Map<String, Value>>(l).ok())
}

/// Drop simulator internals and record the run parameters.
pub fn finalize(mut qoe: Map<String, Value>, config: &QoeConfig) -> Map<String, Value> {
    for key in DROPPED_KEYS {
        qoe.remove(key);
    }
    qoe.insert("sabre_miss_latency".into(), Value::from(config.miss_latency));
    qoe.insert("sabre_bandwidth".into(), Value::from(config.bandwidth));
    qoe.insert("sabre_buffer".into(), Value::from(config.buffer_size));
    qoe.insert("sabre_abr".into(), Value::from(config.abr.clone()));
    qoe
}

/// One simulator invocation.
pub async fn run_simulator(
    config: &QoeConfig,
    miss_indices: &[u32],
    latency_list: &[Option<f64>],
) -> Result<Map<String, Value>, QoeError> {
    let payload = build_payload(miss_indices, latency_list, config.miss_latency)?;
    let args = simulator_args(config, payload);
    tracing::debug!("CMD: {} {:?}", config.interpreter, args);

    let output = tokio::process::Command::new(&config.interpreter)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(QoeError::NonZeroExit {
            code: output.status.code(),
            stderr: if stderr.is_empty() {
                stdout.trim().to_string()
            } else {
                stderr
            },
        });
    }

    let qoe = parse_qoe_line(&stdout).ok_or(QoeError::MissingQoeLine)?;
    Ok(finalize(qoe, config))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Run the simulator over every row of a video table and write the merged
/// rows (input order) as a Parquet table to `output`.
pub async fn run_batch(config: &QoeConfig, input: &Path, output: &Path) -> Result<BatchSummary> {
    let path = input.to_path_buf();
    let rows = tokio::task::spawn_blocking(move || store::read_video_table(&path)).await??;
    let total = rows.len();
    tracing::info!("total videos: {}", total);

    let config = Arc::new(config.clone());
    let done = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new("qoe", config.workers);

    let drained = pool
        .drain(rows.into_iter().enumerate(), |(i, row)| {
            let config = config.clone();
            let done = done.clone();
            async move {
                let result = run_simulator(&config, &row.miss_indices, &row.latency_list).await;
                let name = row.name.clone();
                let merged = match result {
                    Ok(qoe) => Some((row, qoe)),
                    Err(e) => {
                        tracing::error!("Simulator failed for {}: {}", name, e);
                        None
                    }
                };

                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(
                    "Progress: {:.2}% ({}/{}) [bw:{} mbps, miss:{} ms]",
                    n as f64 / total.max(1) as f64 * 100.0,
                    n,
                    total,
                    config.bandwidth,
                    config.miss_latency
                );
                (i, merged)
            }
        })
        .await;

    let mut finished = drained.results;
    finished.sort_by_key(|(i, _)| *i);
    let merged: Vec<(VideoAggregate, Map<String, Value>)> =
        finished.into_iter().filter_map(|(_, m)| m).collect();

    let summary = BatchSummary {
        total,
        succeeded: merged.len(),
        failed: total - merged.len(),
    };
    if merged.is_empty() {
        tracing::warn!("No results produced; output will be empty");
    }

    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || store::write_qoe_table(&output, &merged)).await??;
    Ok(summary)
}

/// Parse a `[2, 1]`-style CLI list.
pub fn parse_json_list<T: serde::de::DeserializeOwned>(s: &str) -> Result<Vec<T>> {
    serde_json::from_str(s)
        .with_context(|| format!("Invalid list {:?}. Use JSON like [2,1]", s))
}
