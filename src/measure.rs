//! Measurement runs: manifest → bounded probe pool → per-video CSV files.
//!
//! Every (video, quality) gets `<results>/<run stamp>/<service>/<stem>.csv`
//! plus an `<stem>.errors.txt` sidecar. All appends go through one writer
//! thread, so files shared by concurrent probes never interleave. Re-runs
//! append; nothing is overwritten.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::sync::{mpsc, watch};

use crate::config::MeasureConfig;
use crate::manifest::{self, ManifestEntry};
use crate::pool::WorkerPool;
use crate::probe::{self, client::is_valid_url, ProbeOptions, ProbeRequest};
use crate::record::ProbeRecord;

const RUN_STAMP_FORMAT: &str = "%d-%m-%Y_%Hhh_%Mmm";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MeasureSummary {
    pub videos: usize,
    pub planned: usize,
    pub written: usize,
    pub failed: usize,
    pub skipped_invalid: usize,
    pub interrupted: bool,
    pub run_dir: PathBuf,
}

struct ProbeTask {
    entry: Arc<ManifestEntry>,
    segment_index: u32,
    request: ProbeRequest,
    csv_path: Arc<PathBuf>,
    errors_path: Arc<PathBuf>,
}

enum WriteOp {
    Row {
        path: Arc<PathBuf>,
        record: ProbeRecord,
    },
    Failure {
        path: Arc<PathBuf>,
        url: String,
        error: String,
    },
}

/// `<stamp>_<location>`. The location is read back from the text after the
/// last `_`, so it may only hold ASCII alphanumerics and `-`.
pub fn run_dir_name(stamp: &str, location: &str) -> String {
    let location: String = location
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if location.is_empty() {
        format!("{}_local", stamp)
    } else {
        format!("{}_{}", stamp, location)
    }
}

/// Build the flat task queue: the first `num_chunks` segments of every entry.
fn plan(
    entries: Vec<ManifestEntry>,
    run_dir: &Path,
    num_chunks: usize,
    skipped_invalid: &mut usize,
) -> Vec<ProbeTask> {
    let mut tasks = Vec::new();
    for entry in entries {
        if entry.segments.is_empty() {
            tracing::error!("No URLs to measure for {}", entry.file_stem());
            continue;
        }

        let dir = run_dir.join(entry.service());
        let stem = entry.file_stem();
        let csv_path = Arc::new(dir.join(format!("{}.csv", stem)));
        let errors_path = Arc::new(dir.join(format!("{}.errors.txt", stem)));
        let entry = Arc::new(entry);

        for (i, segment) in entry.segments.iter().take(num_chunks).enumerate() {
            if !is_valid_url(segment.url()) {
                tracing::warn!("Skipping invalid URL: {}", segment.url());
                *skipped_invalid += 1;
                continue;
            }
            tasks.push(ProbeTask {
                entry: entry.clone(),
                segment_index: i as u32,
                request: segment.to_request(),
                csv_path: csv_path.clone(),
                errors_path: errors_path.clone(),
            });
        }
    }
    tasks
}

/// Probe every manifest segment under `config` and write the results.
///
/// Stops submitting new probes when `shutdown` flips; in-flight probes are
/// still written.
pub async fn run(
    config: &MeasureConfig,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<MeasureSummary> {
    let start = Instant::now();
    let entries = manifest::load_manifests(&config.urls_dir)?;
    let stamp = Local::now().format(RUN_STAMP_FORMAT).to_string();
    let run_dir = config.results_dir.join(run_dir_name(&stamp, &config.location));

    let mut summary = MeasureSummary {
        videos: entries.len(),
        run_dir: run_dir.clone(),
        ..Default::default()
    };
    let tasks = plan(entries, &run_dir, config.num_chunks, &mut summary.skipped_invalid);
    summary.planned = tasks.len();
    tracing::info!(
        "Probing {} segments across {} video qualities with {} workers",
        summary.planned,
        summary.videos,
        config.workers
    );

    let (tx, rx) = mpsc::channel::<WriteOp>(1024);
    let writer = tokio::task::spawn_blocking(move || write_loop(rx));

    let options = Arc::new(ProbeOptions::from(config));
    let pool = WorkerPool::new("probe", config.workers);
    let total = tasks.len();

    let drained = pool
        .drain_until(
            tasks.into_iter().enumerate(),
            |(n, task)| {
                let tx = tx.clone();
                let options = options.clone();
                let total = total;
                async move {
                    tracing::debug!("[{}/{}] {}", n + 1, total, task.request.url);
                    measure_one(task, options, tx).await
                }
            },
            shutdown,
        )
        .await;
    drop(tx);

    let (written, failed) = writer.await.context("result writer thread panicked")??;
    summary.written = written;
    summary.failed = failed;
    summary.interrupted = drained.interrupted;

    tracing::info!(
        "Results saved in {} ({} rows, {} failures, elapsed {:.1} min)",
        run_dir.display(),
        summary.written,
        summary.failed,
        start.elapsed().as_secs_f64() / 60.0
    );
    Ok(summary)
}

async fn measure_one(task: ProbeTask, options: Arc<ProbeOptions>, tx: mpsc::Sender<WriteOp>) {
    let started_at = Local::now();
    let request = task.request.clone();
    let outcome = tokio::task::spawn_blocking(move || probe::probe(&request, &options)).await;

    let op = match outcome {
        Ok(Ok(response)) => {
            match ProbeRecord::from_response(
                &task.entry,
                task.segment_index,
                &task.request,
                &response,
                started_at,
            ) {
                Ok(record) => WriteOp::Row {
                    path: task.csv_path,
                    record,
                },
                Err(e) => WriteOp::Failure {
                    path: task.errors_path,
                    url: task.request.url,
                    error: e.to_string(),
                },
            }
        }
        Ok(Err(e)) => {
            tracing::error!("Measurement failed for {}: {}", task.request.url, e);
            WriteOp::Failure {
                path: task.errors_path,
                url: task.request.url,
                error: e.to_string(),
            }
        }
        Err(e) => WriteOp::Failure {
            path: task.errors_path,
            url: task.request.url,
            error: format!("probe thread failed: {}", e),
        },
    };

    if tx.send(op).await.is_err() {
        tracing::warn!("Result writer closed, dropping result");
    }
}

/// Drain write operations until every sender is gone. Returns (rows, failures).
fn write_loop(mut rx: mpsc::Receiver<WriteOp>) -> Result<(usize, usize)> {
    let mut rows = 0;
    let mut failures = 0;
    while let Some(op) = rx.blocking_recv() {
        match op {
            WriteOp::Row { path, record } => {
                if let Err(e) = append_record(&path, &record) {
                    tracing::error!("Failed to append {}: {:#}", path.display(), e);
                    continue;
                }
                rows += 1;
            }
            WriteOp::Failure { path, url, error } => {
                failures += 1;
                if let Err(e) = append_error(&path, &url, &error) {
                    tracing::error!("Failed to append {}: {:#}", path.display(), e);
                }
            }
        }
    }
    Ok((rows, failures))
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Append one row, writing the header only into an empty file.
pub fn append_record(path: &Path, record: &ProbeRecord) -> Result<()> {
    let file = open_append(path)?;
    let empty = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(empty)
        .from_writer(file);
    writer.serialize(record)?;
    writer.flush()?;
    Ok(())
}

/// `<ISO timestamp> - <url> - <error>`
pub fn append_error(path: &Path, url: &str, error: &str) -> Result<()> {
    let mut file = open_append(path)?;
    writeln!(
        file,
        "{} - {} - {}",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
        url,
        error
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::client::test_server::spawn_head_server;
    use std::time::Duration;

    fn read_rows(path: &Path) -> Vec<ProbeRecord> {
        let mut r = csv::Reader::from_path(path).unwrap();
        r.deserialize().map(|row| row.unwrap()).collect()
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc").join("v--hd_plex.csv");
        let record = ProbeRecord {
            timestamp: "01-01-2026_10:00:00:000001".into(),
            response_ip: "1.2.3.4".into(),
            resp_code: Some(200),
            latency_ms: Some(12.5),
            timing_info: "{}".into(),
            response_headers: "{}".into(),
            name: "v".into(),
            content: "plex".into(),
            quality: "hd".into(),
            url: "https://p/1".into(),
            segment_index: Some(0),
        };

        append_record(&path, &record).unwrap();
        append_record(&path, &record).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("responseIP").count(), 1);
        assert_eq!(read_rows(&path).len(), 2);
    }

    #[test]
    fn test_error_sidecar_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.errors.txt");
        append_error(&path, "https://a/1", "timeout").unwrap();
        append_error(&path, "https://a/2", "dns").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - https://a/1 - timeout"));
        assert!(lines[1].contains("T"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_run_against_local_server() {
        let (addr, requests, server) = spawn_head_server(
            "HTTP/1.1 200 OK\r\nX-Cache: HIT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let refused = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let urls = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let segs = format!(
            "[\"\"http://{a}/0\"\", \"\"ftp://{a}/1\"\", \"\"http://{a}/2\"\", \"\"http://{r}/3\"\", \
             {{\"\"url\"\": \"\"http://{a}/4\"\", \"\"req_headers\"\": \"\"Range: bytes=0-9\"\"}}, \
             \"\"http://{a}/5\"\"]",
            a = addr,
            r = refused
        );
        std::fs::write(
            urls.path().join("m.csv"),
            format!("name,content,quality_urls\nclip,plex_free,\"{{\"\"hd\"\": {}}}\"\n", segs),
        )
        .unwrap();

        let config = MeasureConfig {
            urls_dir: urls.path().to_path_buf(),
            results_dir: results.path().to_path_buf(),
            workers: 2,
            num_chunks: 5,
            location: "lab 2".into(),
            connect_timeout: Duration::from_secs(2),
            total_timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let summary = run(&config, None).await.unwrap();
        server.abort();

        assert_eq!(summary.videos, 1);
        assert_eq!(summary.skipped_invalid, 1);
        assert_eq!(summary.planned, 4);
        assert_eq!(summary.written, 3);
        assert_eq!(summary.failed, 1);
        assert!(!summary.interrupted);
        assert_eq!(requests.lock().unwrap().len(), 3);

        let run_name = summary.run_dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(run_name.ends_with("_lab-2"), "{run_name}");

        let dir = summary.run_dir.join("plex");
        let rows = read_rows(&dir.join("clip--hd_plex_free.csv"));
        let mut indices: Vec<u32> = rows.iter().filter_map(|r| r.segment_index).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 2, 4]);
        assert!(rows.iter().all(|r| r.resp_code == Some(200)));
        assert!(rows.iter().any(|r| r.url.ends_with("/4 Range: bytes=0-9")));

        let errors = std::fs::read_to_string(dir.join("clip--hd_plex_free.errors.txt")).unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.contains(&format!("http://{}/3", refused)));
    }

    #[test]
    fn test_run_dir_name() {
        assert_eq!(run_dir_name("05-02-2026_10hh_05mm", "paris"), "05-02-2026_10hh_05mm_paris");
        assert_eq!(run_dir_name("s", "new_york/1"), "s_new-york1");
        assert_eq!(run_dir_name("s", "  "), "s_local");
    }

    #[test]
    fn test_planned_paths_carry_location() {
        let entry = ManifestEntry {
            name: "clip".into(),
            content: "plex_free".into(),
            quality: "hd".into(),
            segments: vec![crate::manifest::SegmentDescriptor::Url("https://p/0.m4s".into())],
        };
        let run_dir = Path::new("/results").join(run_dir_name("05-02-2026_10hh_05mm", "paris"));
        let mut skipped = 0;
        let tasks = plan(vec![entry], &run_dir, 50, &mut skipped);

        assert_eq!(tasks.len(), 1);
        assert_eq!(crate::pipeline::ingest::location_for(&tasks[0].csv_path, 3), "paris");
        assert_eq!(crate::pipeline::ingest::location_for(&tasks[0].errors_path, 3), "paris");
    }
}
