mod cdn;
mod config;
mod error;
mod manifest;
mod measure;
mod pipeline;
mod pool;
mod probe;
mod qoe;
mod record;
mod store;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cdn::Cdn;
use config::{MeasureConfig, ProcessConfig, QoeConfig, VendorTaxonomy};

#[derive(Parser)]
#[command(name = "edgeprobe", version, about = "CDN edge-cache probe and per-video cache analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe manifest segments with timed HEAD requests and write per-video CSVs
    Measure {
        /// Directory with URL manifests (*.csv)
        urls_dir: Option<PathBuf>,

        /// Directory to write results to
        results_dir: Option<PathBuf>,

        /// Override HTTP User-Agent
        #[arg(long)]
        user_agent: Option<String>,

        /// Max concurrent probes across the whole manifest
        #[arg(long)]
        workers: Option<usize>,

        /// Segments probed per video quality
        #[arg(long)]
        chunks: Option<usize>,

        /// Vantage point name, appended to the run directory (or EDGEPROBE_LOCATION env)
        #[arg(long)]
        location: Option<String>,

        /// Log directory for rolling log files (or EDGEPROBE_LOG_DIR env)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        verbose: bool,
    },

    /// Classify a results tree and write the per-video Parquet table
    Process {
        /// Root folder with CSV results
        results_dir: PathBuf,

        /// Path to write the Parquet table
        output_parquet: PathBuf,

        /// TOML file mapping vendors to content names (default: built-in lists)
        #[arg(long)]
        taxonomy: Option<PathBuf>,

        /// Concurrent CSV reads
        #[arg(long, default_value = "800")]
        read_concurrency: usize,

        /// Fill ssl_ms from the DNS phase (compatibility with historical tables; known incorrect)
        #[arg(long)]
        legacy_ssl_from_dns: bool,

        /// Print the per-CDN hit-rate summary
        #[arg(long)]
        summary: bool,

        /// Classification threads (default: num_cpus)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Run the QoE simulator over a video table, or once for a single trace
    Qoe {
        /// Input Parquet video table (batch mode)
        #[arg(long)]
        input_parquet: Option<PathBuf>,

        /// Output Parquet path (batch mode)
        #[arg(long)]
        output_parquet: Option<PathBuf>,

        /// JSON list of miss indices, e.g. '[2,1]' (direct mode)
        #[arg(long)]
        miss_indices: Option<String>,

        /// JSON list of latencies in ms, e.g. '[25,625,700]' (direct mode)
        #[arg(long)]
        latency_list: Option<String>,

        /// Interpreter used to launch the simulator
        #[arg(long)]
        interpreter: Option<String>,

        /// Simulator script
        #[arg(long)]
        simulator: Option<PathBuf>,

        /// Network profile JSON
        #[arg(long)]
        network_json: Option<PathBuf>,

        /// Video manifest JSON
        #[arg(long)]
        manifest_json: Option<PathBuf>,

        /// Bandwidth in Mbps
        #[arg(long)]
        bandwidth: Option<f64>,

        /// Latency injected at every miss, in ms
        #[arg(long)]
        miss_latency: Option<f64>,

        /// Player buffer size in seconds
        #[arg(long)]
        buffer_size: Option<u32>,

        /// ABR algorithm
        #[arg(long)]
        abr: Option<String>,

        /// Parallel simulator runs in batch mode
        #[arg(long)]
        workers: Option<usize>,

        /// Enable debug logging
        #[arg(long)]
        verbose: bool,
    },

    /// Classify one JSON header map (dev/validation tool)
    Classify {
        /// CDN vendor: akamai, cloudfront, edgio or fastly
        #[arg(long)]
        cdn: String,

        /// Path to a JSON object of response headers
        headers_json: PathBuf,
    },
}

fn resolve_log_dir(log_dir_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = log_dir_arg {
        return Some(p.to_path_buf());
    }
    std::env::var("EDGEPROBE_LOG_DIR").ok().map(PathBuf::from)
}

fn prune_old_logs(log_dir: &Path, keep_days: u64) {
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(keep_days * 86400))
        .unwrap_or(std::time::UNIX_EPOCH);

    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            // rolling::daily names files "measure.log.YYYY-MM-DD"
            let is_measure_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("measure.log"))
                .unwrap_or(false);
            if !is_measure_log {
                continue;
            }
            let expired = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if expired {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

fn env_filter(verbose: bool) -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let level = if verbose { "edgeprobe=debug" } else { "edgeprobe=info" };
    Ok(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Measure { verbose, .. } | Commands::Qoe { verbose, .. } => *verbose,
        _ => false,
    };
    // Long measurement runs may log to a rolling file; everything else logs to stderr.
    let measure_log_dir = match &cli.command {
        Commands::Measure { log_dir, .. } => resolve_log_dir(log_dir.as_deref()),
        _ => None,
    };

    let _guard = if let Some(log_path) = measure_log_dir {
        std::fs::create_dir_all(&log_path)?;
        prune_old_logs(&log_path, 7);

        let file_appender = tracing_appender::rolling::daily(&log_path, "measure.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_env_filter(env_filter(verbose)?)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter(verbose)?)
            .init();
        None
    };

    match cli.command {
        Commands::Measure {
            urls_dir,
            results_dir,
            user_agent,
            workers,
            chunks,
            location,
            log_dir: _,
            verbose: _,
        } => {
            let mut config = MeasureConfig::from_env()?.with_overrides(
                urls_dir.as_deref(),
                results_dir.as_deref(),
                user_agent.as_deref(),
                workers,
                chunks,
            );
            if let Some(location) = location {
                config.location = location;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_measure(config))?;
        }
        Commands::Process {
            results_dir,
            output_parquet,
            taxonomy,
            read_concurrency,
            legacy_ssl_from_dns,
            summary,
            threads,
        } => {
            let mut config = ProcessConfig::new(&results_dir, &output_parquet);
            config.read_concurrency = read_concurrency.max(1);
            config.legacy_ssl_from_dns = legacy_ssl_from_dns;
            if let Some(path) = taxonomy {
                config.taxonomy = VendorTaxonomy::load(&path)?;
            }
            cmd_process(&config, summary, threads)?;
        }
        Commands::Qoe {
            input_parquet,
            output_parquet,
            miss_indices,
            latency_list,
            interpreter,
            simulator,
            network_json,
            manifest_json,
            bandwidth,
            miss_latency,
            buffer_size,
            abr,
            workers,
            verbose: _,
        } => {
            let mut config = QoeConfig::default();
            if let Some(v) = interpreter {
                config.interpreter = v;
            }
            if let Some(v) = simulator {
                config.simulator = v;
            }
            if let Some(v) = network_json {
                config.network_json = v;
            }
            if let Some(v) = manifest_json {
                config.manifest_json = v;
            }
            if let Some(v) = bandwidth {
                config.bandwidth = v;
            }
            if let Some(v) = miss_latency {
                config.miss_latency = v;
            }
            if let Some(v) = buffer_size {
                config.buffer_size = v.max(1);
            }
            if let Some(v) = abr {
                config.abr = v;
            }
            if let Some(v) = workers {
                config.workers = v.max(1);
            }

            let rt = tokio::runtime::Runtime::new()?;
            match (miss_indices, latency_list) {
                (Some(m), Some(l)) => rt.block_on(cmd_qoe_direct(&config, &m, &l))?,
                (None, None) => {
                    let (Some(input), Some(output)) = (input_parquet, output_parquet) else {
                        anyhow::bail!(
                            "--input-parquet and --output-parquet are required for batch mode"
                        );
                    };
                    rt.block_on(cmd_qoe_batch(&config, &input, &output))?;
                }
                _ => anyhow::bail!(
                    "Both --miss-indices and --latency-list are required for direct mode"
                ),
            }
        }
        Commands::Classify { cdn, headers_json } => {
            let cdn: Cdn = cdn.parse()?;
            cmd_classify(cdn, &headers_json)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// measure subcommand
// ---------------------------------------------------------------------------

/// Flip the returned flag on Ctrl-C / SIGTERM.
fn spawn_shutdown_listener() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Interrupted, finishing in-flight probes...");
        let _ = tx.send(true);
    });
    rx
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn cmd_measure(config: MeasureConfig) -> anyhow::Result<()> {
    eprintln!("Manifests: {}", config.urls_dir.display());
    eprintln!("Results:   {}", config.results_dir.display());
    eprintln!("Location:  {}", config.location);

    let shutdown = spawn_shutdown_listener();
    let summary = measure::run(&config, Some(shutdown)).await?;

    eprintln!();
    eprintln!("=== Measurement Complete ===");
    eprintln!("Video qualities:  {}", summary.videos);
    eprintln!("Probes planned:   {}", summary.planned);
    eprintln!("Rows written:     {}", summary.written);
    eprintln!("Failures:         {}", summary.failed);
    eprintln!("Invalid URLs:     {}", summary.skipped_invalid);
    if summary.interrupted {
        eprintln!("Interrupted before all probes were submitted");
    }
    eprintln!("Results saved in {}", summary.run_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// process subcommand
// ---------------------------------------------------------------------------

fn cmd_process(config: &ProcessConfig, print_summary: bool, threads: usize) -> anyhow::Result<()> {
    let start = Instant::now();

    let num_threads = if threads > 0 { threads } else { num_cpus::get() };
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
        .ok(); // Ignore if already initialized

    for cdn in Cdn::ALL {
        let contents: Vec<&str> = config.taxonomy.contents_for(cdn).collect();
        tracing::debug!("{} serves {:?}", cdn, contents);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(pipeline::run(config))?;
    let segments = &report.segments;

    eprintln!("Read {} rows from {} files", report.rows_read, report.files);
    eprintln!("Non-2xx rows dropped: {}", segments.non_success);
    if !segments.excluded.is_empty() {
        eprintln!("Excluded rows: {:?}", segments.excluded);
    }

    if print_summary {
        let summary = pipeline::hitrate::summarize(&segments.rows);
        eprint!("{}", pipeline::hitrate::render(&summary));
    }

    let elapsed = start.elapsed().as_secs();
    eprintln!(
        "\n{} segments -> {} videos, processed data saved at: {} ({} min, {} sec)",
        segments.rows.len(),
        report.videos,
        config.output_path.display(),
        elapsed / 60,
        elapsed % 60
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// qoe subcommand
// ---------------------------------------------------------------------------

async fn cmd_qoe_batch(config: &QoeConfig, input: &Path, output: &Path) -> anyhow::Result<()> {
    let summary = qoe::run_batch(config, input, output).await?;
    eprintln!(
        "QoE: {} of {} videos simulated ({} failed) -> {}",
        summary.succeeded,
        summary.total,
        summary.failed,
        output.display()
    );
    Ok(())
}

async fn cmd_qoe_direct(config: &QoeConfig, miss_indices: &str, latency_list: &str) -> anyhow::Result<()> {
    let miss_indices: Vec<u32> = qoe::parse_json_list(miss_indices)?;
    let latency_list: Vec<Option<f64>> = qoe::parse_json_list::<f64>(latency_list)?
        .into_iter()
        .map(Some)
        .collect();

    let result = qoe::run_simulator(config, &miss_indices, &latency_list)
        .await
        .context("direct run produced no result")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// classify subcommand
// ---------------------------------------------------------------------------

fn cmd_classify(cdn: Cdn, path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let headers = pipeline::headers::HeaderMap::decode(&raw)?;
    if headers.is_empty() {
        tracing::warn!("{} holds no headers", path.display());
    }
    let fields = pipeline::classifier::classify(cdn, &headers);

    eprintln!(
        "{} headers, vendor {}, accepted: {}",
        headers.len(),
        cdn,
        cdn.accepts(fields.cache_trace)
    );
    println!("{}", serde_json::to_string_pretty(&fields)?);
    Ok(())
}
