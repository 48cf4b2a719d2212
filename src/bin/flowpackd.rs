//! Process entry point: parses the CLI surface the collector core itself
//! declares out of scope (§6), wires up structured logging, and drives the
//! supervisor through startup, a consumer loop, and cooperative shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use flowpack::{parse_config, Collector, FsLoader, SourceError};

/// Multi-protocol flow collector: ingests NetFlow/IPFIX/sFlow, classifies
/// records onto sensors, and hands them to a downstream packer.
#[derive(Debug, Parser)]
#[command(name = "flowpackd", version, about)]
struct Cli {
    /// Path to the probe/sensor/group configuration file (§4.6).
    #[arg(long)]
    config: PathBuf,

    /// Path to a site file mapping sensor names to numeric ids (§1: treated
    /// as an external collaborator; this binary loads a minimal
    /// `name id` stand-in format rather than implementing the real one).
    #[arg(long)]
    site_file: Option<PathBuf>,

    /// Parse and verify the configuration, report any errors, and exit
    /// without starting any listeners.
    #[arg(long)]
    check_config: bool,

    /// How often (seconds) to log and clear per-source statistics.
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,
}

/// Minimal `name id` site-file stand-in. The real site file (§1, §3: "an
/// external collaborator") maps sensor names to numeric ids and classes;
/// this loader only covers the one fact this crate needs to verify a
/// sensor, not the site file's full schema.
fn load_site_file(path: &Path) -> Result<HashMap<String, u32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading site file {}", path.display()))?;
    let mut ids = HashMap::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .with_context(|| format!("{}:{}: missing sensor name", path.display(), line_no + 1))?;
        let id: u32 = parts
            .next()
            .with_context(|| format!("{}:{}: missing sensor id", path.display(), line_no + 1))?
            .parse()
            .with_context(|| format!("{}:{}: sensor id is not a number", path.display(), line_no + 1))?;
        ids.insert(name.to_string(), id);
    }
    Ok(ids)
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let site_ids = match &cli.site_file {
        Some(path) => load_site_file(path)?,
        None => HashMap::new(),
    };
    let resolve_sensor_id = move |name: &str| site_ids.get(name).copied();

    let registry = match parse_config(&cli.config, &FsLoader, resolve_sensor_id) {
        Ok(registry) => registry,
        Err(diagnostics) => {
            for diag in &diagnostics {
                tracing::error!(file = %diag.file, line = diag.line, "{}", diag.error);
            }
            anyhow::bail!("{} configuration error(s) in {}", diagnostics.len(), cli.config.display());
        }
    };

    tracing::info!(
        probes = registry.probes().count(),
        sensors = registry.sensors().count(),
        "configuration verified"
    );

    if cli.check_config {
        println!("configuration OK: {} probe(s), {} sensor(s)", registry.probes().count(), registry.sensors().count());
        return Ok(());
    }

    let collector = Collector::start(registry).context("starting collector")?;

    install_shutdown_hook(Arc::clone(&collector));
    run_consumer_loop(&collector, Duration::from_secs(cli.stats_interval_secs));

    Ok(())
}

/// Spawns a dedicated single-threaded tokio runtime whose only job is to
/// await `ctrl_c` and stop the collector (§4.7: "Shutdown is cooperative")
/// instead of aborting the process. The collector's own listener fabric
/// (C2's poll threads, C4's adapter runtime) runs independently of this one.
fn install_shutdown_hook(collector: Arc<Collector>) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "failed to start shutdown-signal runtime");
                return;
            }
        };
        runtime.block_on(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, stopping sources");
                collector.stop();
            }
        });
    });
}

/// Pulls records off every probe's source and classifies them (§2's data
/// flow final step, `consumer pulls via NextRecord → C6 classifier →
/// downstream`). The downstream packer itself is out of scope (§1); this
/// loop logs what the classifier decided as a stand-in sink.
fn run_consumer_loop(collector: &Arc<Collector>, stats_interval: Duration) {
    let mut last_stats = std::time::Instant::now();
    let probe_ids: Vec<_> = collector.registry.probes().map(|(id, _)| id).collect();

    while !collector.is_stopped() {
        let mut any_progress = false;
        for &probe_id in &probe_ids {
            match collector.next_record(probe_id) {
                Ok(record) => {
                    any_progress = true;
                    let probe = collector.registry.probe(probe_id);
                    let outcomes = flowpack::classifier::classify(&record, probe, &collector.registry);
                    for (sensor_id, outcome) in outcomes {
                        if let flowpack::classifier::SensorOutcome::Accepted { source_network, dest_network } = outcome {
                            let sensor = collector.registry.sensor(sensor_id);
                            tracing::debug!(
                                sensor = %sensor.name,
                                source_network,
                                dest_network,
                                "record classified"
                            );
                        }
                    }
                }
                Err(SourceError::Stopped) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "source error");
                }
            }
        }

        if last_stats.elapsed() >= stats_interval {
            collector.log_stats_and_clear_all();
            last_stats = std::time::Instant::now();
        }

        if !any_progress {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
