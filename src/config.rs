//! Run configuration.
//!
//! Measurement, processing and QoE runs each get a plain config struct with
//! defaults, optional env overrides and CLI overrides. The vendor → content
//! mapping is passed explicitly instead of living in module globals.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cdn::Cdn;

pub const DEFAULT_USER_AGENT: &str =
    "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MeasureConfig {
    pub urls_dir: PathBuf,
    pub results_dir: PathBuf,
    pub user_agent: String,
    /// In-flight probes across the whole manifest, not per video.
    pub workers: usize,
    /// Segments probed per (video, quality).
    pub num_chunks: usize,
    /// Vantage point, appended to the run directory name.
    pub location: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            urls_dir: PathBuf::from("./urls"),
            results_dir: PathBuf::from("./results"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            workers: 50,
            num_chunks: 50,
            location: "local".to_string(),
            connect_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_secs(10),
        }
    }
}

impl MeasureConfig {
    /// Defaults plus `EDGEPROBE_WORKERS`, `EDGEPROBE_USER_AGENT` and `EDGEPROBE_LOCATION`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(workers) = std::env::var("EDGEPROBE_WORKERS") {
            config.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("EDGEPROBE_WORKERS is not a number: {}", workers))?;
        }
        if let Ok(ua) = std::env::var("EDGEPROBE_USER_AGENT") {
            if !ua.is_empty() {
                config.user_agent = ua;
            }
        }
        if let Ok(location) = std::env::var("EDGEPROBE_LOCATION") {
            if !location.trim().is_empty() {
                config.location = location.trim().to_string();
            }
        }

        Ok(config)
    }

    /// Override fields from CLI args (only override if given).
    pub fn with_overrides(
        mut self,
        urls_dir: Option<&Path>,
        results_dir: Option<&Path>,
        user_agent: Option<&str>,
        workers: Option<usize>,
        num_chunks: Option<usize>,
    ) -> Self {
        if let Some(d) = urls_dir {
            self.urls_dir = d.to_path_buf();
        }
        if let Some(d) = results_dir {
            self.results_dir = d.to_path_buf();
        }
        if let Some(ua) = user_agent {
            self.user_agent = ua.to_string();
        }
        if let Some(w) = workers {
            self.workers = w;
        }
        if let Some(n) = num_chunks {
            self.num_chunks = n;
        }
        self.workers = self.workers.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Vendor taxonomy
// ---------------------------------------------------------------------------

/// Which content providers are served by which CDN.
///
/// Needed because some manifests carry no vendor tag in their file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorTaxonomy {
    content: BTreeMap<String, Cdn>,
}

#[derive(Deserialize)]
struct VendorSection {
    content: Vec<String>,
}

impl Default for VendorTaxonomy {
    fn default() -> Self {
        let lists: [(Cdn, &[&str]); 4] = [
            (
                Cdn::Akamai,
                &["vimeo", "dw", "nobudge", "waterbear", "channel5", "zdf"],
            ),
            (Cdn::CloudFront, &["prime", "magellantv", "pbs", "dailymotion"]),
            (Cdn::Edgio, &["rakuten", "fawesome"]),
            (Cdn::Fastly, &["plex"]),
        ];
        let content = lists
            .into_iter()
            .flat_map(|(cdn, names)| names.iter().map(move |n| (n.to_string(), cdn)))
            .collect();
        Self { content }
    }
}

impl VendorTaxonomy {
    /// Parse a TOML taxonomy:
    ///
    /// ```toml
    /// [akamai]
    /// content = ["vimeo", "zdf"]
    /// ```
    pub fn load_from_str(s: &str) -> Result<Self> {
        let vendors: BTreeMap<String, VendorSection> =
            toml::from_str(s).context("parsing vendor taxonomy")?;
        let mut content = BTreeMap::new();
        for (vendor, section) in vendors {
            let cdn: Cdn = vendor.parse()?;
            for name in section.content {
                let name = name.trim().to_lowercase();
                if let Some(prev) = content.insert(name.clone(), cdn) {
                    anyhow::ensure!(
                        prev == cdn,
                        "content {:?} listed under both {} and {}",
                        name,
                        prev,
                        cdn
                    );
                }
            }
        }
        Ok(Self { content })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::load_from_str(&s)
    }

    pub fn vendor_for_content(&self, content: &str) -> Option<Cdn> {
        self.content.get(&content.to_lowercase()).copied()
    }

    pub fn contents_for(&self, cdn: Cdn) -> impl Iterator<Item = &str> {
        self.content
            .iter()
            .filter(move |(_, c)| **c == cdn)
            .map(|(name, _)| name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub results_dir: PathBuf,
    pub output_path: PathBuf,
    /// Concurrent CSV reads during ingestion.
    pub read_concurrency: usize,
    /// Directories whose name contains this marker are skipped.
    pub skip_marker: String,
    /// The location tag is read from the path component this many levels up
    /// from the file itself (1 = the file name).
    pub location_depth: usize,
    /// Reproduce the historical `ssl(ms)` column, which carried the DNS time.
    pub legacy_ssl_from_dns: bool,
    pub taxonomy: VendorTaxonomy,
}

impl ProcessConfig {
    pub fn new(results_dir: &Path, output_path: &Path) -> Self {
        Self {
            results_dir: results_dir.to_path_buf(),
            output_path: output_path.to_path_buf(),
            read_concurrency: 800,
            skip_marker: "test".to_string(),
            location_depth: 3,
            legacy_ssl_from_dns: false,
            taxonomy: VendorTaxonomy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// QoE simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QoeConfig {
    pub interpreter: String,
    pub simulator: PathBuf,
    pub network_json: PathBuf,
    pub manifest_json: PathBuf,
    /// Mbps.
    pub bandwidth: f64,
    /// Milliseconds injected at every miss index.
    pub miss_latency: f64,
    /// Player buffer in seconds.
    pub buffer_size: u32,
    pub abr: String,
    pub workers: usize,
}

impl Default for QoeConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            simulator: PathBuf::from("./src/sabre.py"),
            network_json: PathBuf::from("./config/my_network.json"),
            manifest_json: PathBuf::from("./config/bbb4k.json"),
            bandwidth: 25.0,
            miss_latency: 62.0,
            buffer_size: 30,
            abr: "dynamic".to_string(),
            workers: 25,
        }
    }
}
