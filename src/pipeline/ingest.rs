//! Result-tree ingestion.
//!
//! Walks a results directory, reads every per-video CSV under a bounded
//! read pool and tags each row with its vantage location and (when the file
//! name says so) its CDN. No classification happens here.

use std::path::{Path, PathBuf};

use anyhow::Result;
use walkdir::WalkDir;

use crate::cdn::Cdn;
use crate::config::ProcessConfig;
use crate::pool::WorkerPool;
use crate::record::ProbeRecord;

/// Sort key restoring manifest order after unordered completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    /// Position of the source file in the sorted file list.
    pub file: u32,
    /// Manifest segment index, or the row position for files without one.
    pub segment: u32,
    pub row: u32,
}

#[derive(Debug, Clone)]
pub struct TaggedRecord {
    pub record: ProbeRecord,
    pub location: String,
    /// `None` when the file name carries no vendor tag.
    pub cdn: Option<Cdn>,
    pub order: OrderKey,
}

#[derive(Debug, Default)]
pub struct IngestedTable {
    pub rows: Vec<TaggedRecord>,
    pub files: usize,
    pub unreadable_files: usize,
    pub malformed_rows: usize,
}

/// All `*.csv` files under `root`, sorted, skipping directories whose name
/// contains `skip_marker` (case-insensitive).
pub fn discover_result_files(root: &Path, skip_marker: &str) -> Vec<PathBuf> {
    let marker = skip_marker.to_lowercase();
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() || marker.is_empty() {
                return true;
            }
            let name = e.file_name().to_string_lossy().to_lowercase();
            if name.contains(&marker) {
                tracing::debug!("Skipping directory {}", e.path().display());
                return false;
            }
            true
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "csv"))
        .collect();
    files.sort();
    files
}

/// Vantage point from the path component `depth` levels up (1 = the file
/// itself), keeping the text after its last `_`.
pub fn location_for(path: &Path, depth: usize) -> String {
    let parts: Vec<String> = path
        .iter()
        .map(|c| c.to_string_lossy().into_owned())
        .filter(|c| !c.is_empty() && c != "/")
        .collect();
    if depth == 0 || parts.len() < depth {
        return "NaN".to_string();
    }
    let component = &parts[parts.len() - depth];
    component
        .rsplit('_')
        .next()
        .unwrap_or(component.as_str())
        .to_string()
}

/// Parse one result file. Rows that do not deserialize are counted and skipped.
pub fn parse_result_file(bytes: &[u8]) -> Result<(Vec<ProbeRecord>, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let mut records = Vec::new();
    let mut malformed = 0;
    for row in reader.deserialize::<ProbeRecord>() {
        match row {
            Ok(r) => records.push(r),
            Err(e) => {
                tracing::debug!("Malformed result row: {}", e);
                malformed += 1;
            }
        }
    }
    Ok((records, malformed))
}

fn tag(path: &Path, ordinal: u32, records: Vec<ProbeRecord>, location_depth: usize) -> Vec<TaggedRecord> {
    let location = location_for(path, location_depth);
    let cdn = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(Cdn::from_file_name);

    records
        .into_iter()
        .enumerate()
        .map(|(row, record)| {
            let order = OrderKey {
                file: ordinal,
                segment: record.segment_index.unwrap_or(row as u32),
                row: row as u32,
            };
            TaggedRecord {
                record,
                location: location.clone(),
                cdn,
                order,
            }
        })
        .collect()
}

/// Read and tag every result file under `config.results_dir`.
pub async fn ingest(config: &ProcessConfig) -> Result<IngestedTable> {
    let root = config.results_dir.clone();
    let marker = config.skip_marker.clone();
    let files = tokio::task::spawn_blocking(move || discover_result_files(&root, &marker)).await?;
    tracing::info!(
        "Reading {} result files under {}",
        files.len(),
        config.results_dir.display()
    );

    let pool = WorkerPool::new("ingest", config.read_concurrency);
    let depth = config.location_depth;
    let drained = pool
        .drain(files.into_iter().enumerate(), |(ordinal, path)| async move {
            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => parse_result_file(&bytes),
                Err(e) => Err(anyhow::Error::new(e)),
            };
            (ordinal as u32, path, parsed)
        })
        .await;

    let mut finished = drained.results;
    finished.sort_by_key(|(ordinal, _, _)| *ordinal);

    let mut table = IngestedTable {
        files: finished.len(),
        ..Default::default()
    };
    for (ordinal, path, parsed) in finished {
        match parsed {
            Ok((records, malformed)) => {
                table.malformed_rows += malformed;
                table.rows.extend(tag(&path, ordinal, records, depth));
            }
            Err(e) => {
                tracing::warn!("Skip {}: {:#}", path.display(), e);
                table.unreadable_files += 1;
            }
        }
    }
    table.unreadable_files += drained.lost;

    tracing::info!(
        "Ingested {} rows from {} files ({} unreadable, {} malformed rows)",
        table.rows.len(),
        table.files,
        table.unreadable_files,
        table.malformed_rows
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "timestamp(dd-mm-yyyy hh:mm:ss:ms),responseIP,resp_code,latency(ms),\
                          timing_info,responseHeaders,name,content,quality,url,segment_index\n";

    fn row(index: u32, latency: f64) -> String {
        format!(
            "01-02-2026_10:00:0{}:000001,1.1.1.1,200,{},\"{{\"\"dns\"\": 1.0, \"\"tcp\"\": 2.0, \"\"ssl\"\": 3.0}}\",\
             \"{{\"\"x-cache\"\": \"\"HIT\"\"}}\",v,plex,hd,https://p/{},{}\n",
            index, latency, index, index
        )
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_location_for() {
        let p = Path::new("/data/results/01-02-2026_london/plex/v--hd_plex.csv");
        assert_eq!(location_for(p, 3), "london");
        assert_eq!(location_for(p, 2), "plex");
        assert_eq!(location_for(Path::new("v.csv"), 3), "NaN");
        assert_eq!(location_for(Path::new("a/nounderscore/b/v.csv"), 3), "nounderscore");
    }

    #[test]
    fn test_discover_skips_marker_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("run_paris/plex/a.csv"), HEADER);
        write(&dir.path().join("run_paris/plex/a.errors.txt"), "");
        write(&dir.path().join("Test_run/plex/b.csv"), HEADER);
        write(&dir.path().join("run_paris/latest/c.csv"), HEADER);

        let files = discover_result_files(dir.path(), "test");
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["run_paris/latest/c.csv", "run_paris/plex/a.csv"]);
    }

    #[test]
    fn test_parse_counts_malformed_rows() {
        let body = format!("{}{}not,enough\n{}", HEADER, row(0, 1.5), row(1, 2.5));
        let (records, malformed) = parse_result_file(body.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(malformed, 1);
        assert_eq!(records[1].latency_ms, Some(2.5));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_ingest_tags_and_orders_rows() {
        let dir = tempfile::tempdir().unwrap();
        // Completion order scrambled the rows; segment_index restores it
        write(
            &dir.path().join("05-02-2026_tokyo/plex/v--hd_plex_fastly_x.csv"),
            &format!("{}{}{}{}", HEADER, row(2, 30.0), row(0, 10.0), row(1, 20.0)),
        );
        write(
            &dir.path().join("05-02-2026_tokyo/vimeo/w--hd_vimeo.csv"),
            &format!("{}{}", HEADER, row(0, 5.0)),
        );

        let mut config = ProcessConfig::new(dir.path(), &dir.path().join("out.parquet"));
        config.read_concurrency = 2;
        let mut table = ingest(&config).await.unwrap();

        assert_eq!(table.files, 2);
        assert_eq!(table.rows.len(), 4);
        assert!(table.rows.iter().all(|r| r.location == "tokyo"));

        table.rows.sort_by_key(|r| r.order);
        let fastly: Vec<f64> = table
            .rows
            .iter()
            .filter(|r| r.cdn == Some(Cdn::Fastly))
            .filter_map(|r| r.record.latency_ms)
            .collect();
        assert_eq!(fastly, vec![10.0, 20.0, 30.0]);
        assert_eq!(table.rows.iter().filter(|r| r.cdn.is_none()).count(), 1);
    }
}
