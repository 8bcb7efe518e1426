//! sitewatchd - site monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by SITEWATCH_CONFIG, then env overrides)
//! 2. Opens the SQLite store and the vision/perception clients
//! 3. Starts one worker per configured or `--assign`ed (source, pipeline) pair
//! 4. Logs new events and periodic source health until Ctrl-C
//! 5. Stops every worker and releases every source on shutdown

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use sitewatch::config::{Assignment, SitewatchConfig};
use sitewatch::runtime::Collaborators;
use sitewatch::Sitewatch;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera site monitoring daemon")]
struct Args {
    /// Config file (TOML or JSON). Overrides SITEWATCH_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra `source:pipeline` pair to start. Repeatable.
    #[arg(long = "assign", value_name = "SOURCE:PIPELINE")]
    assign: Vec<String>,

    /// Seconds between source health log lines.
    #[arg(long, default_value_t = 30)]
    health_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => SitewatchConfig::load_from(Some(path))?,
        None => SitewatchConfig::load()?,
    };
    for raw in &args.assign {
        let assignment = Assignment::parse(raw)?;
        if !sitewatch::validate_id(&assignment.source_id)
            || !sitewatch::validate_id(&assignment.pipeline_id)
        {
            return Err(anyhow!("invalid assignment '{}'", raw));
        }
        cfg.assignments.push(assignment);
    }

    let collaborators = Collaborators::from_config(&cfg).context("open collaborators")?;
    let core = Sitewatch::new(&cfg, collaborators);
    let started = core.start_assignments(&cfg);
    log::info!(
        "sitewatchd running: {} of {} assignments started, store {}",
        started,
        cfg.assignments.len(),
        cfg.db_path
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let health_interval = Duration::from_secs(args.health_interval_secs.max(1));
    let mut last_health = Instant::now();
    let mut cursor = core.events.last_id();
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        for event in core.events.since(cursor) {
            cursor = event.id();
            log::info!("event #{} {} {}", event.id(), event.kind().as_str(), event.data());
        }

        if last_health.elapsed() >= health_interval {
            last_health = Instant::now();
            for snapshot in core.registry.snapshot() {
                log::info!(
                    "source {} [{}] {} via {}: {} frames, {} consecutive errors",
                    snapshot.id,
                    snapshot.uri,
                    snapshot.state,
                    snapshot.transport,
                    snapshot.frames_read,
                    snapshot.consecutive_errors
                );
            }
            for status in core.supervisor.status() {
                log::info!(
                    "worker {}/{} running={} sampled={} errors={}",
                    status.source_id,
                    status.pipeline_id,
                    status.running,
                    status.counters.frames_sampled,
                    status.counters.pipeline_errors
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping workers...");
    core.shutdown();
    Ok(())
}
