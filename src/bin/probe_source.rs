//! probe_source - report which transports can open a video source.
//!
//! Tries every compiled-in transport against one URI and prints, per
//! transport, whether it opened and delivered a frame. Optionally writes a
//! single JPEG capture through the full registry path.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use sitewatch::source::{default_transports, CaptureSettings, ProbeOutcome, SourceRegistry};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a video source against every transport")]
struct Args {
    /// Source URI: rtsp://, http(s)://, /dev/videoN, a device index, or stub://.
    uri: String,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Acquire the source and write one JPEG capture here.
    #[arg(long)]
    capture: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let settings = CaptureSettings {
        width: args.width,
        height: args.height,
        ..CaptureSettings::default()
    };
    let registry = SourceRegistry::new(default_transports(), settings);
    let reports = registry.probe(&args.uri)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            let line = match &report.outcome {
                ProbeOutcome::Opened => "opened, frame ok".to_string(),
                ProbeOutcome::OpenedNoFrame => "opened, no frame".to_string(),
                ProbeOutcome::FailedToOpen(reason) => format!("failed: {}", reason),
                ProbeOutcome::Unsupported => "not applicable".to_string(),
            };
            println!("{:<10} {}", report.transport, line);
        }
    }

    if let Some(path) = &args.capture {
        registry
            .acquire("probe", &args.uri)
            .map_err(|e| anyhow!("{}", e))?;
        let jpeg = registry.capture_jpeg("probe")?;
        std::fs::write(path, &jpeg)
            .with_context(|| format!("write capture to {}", path.display()))?;
        println!("wrote {} bytes to {}", jpeg.len(), path.display());
        registry.release("probe");
    }

    if !reports.iter().any(|r| r.outcome == ProbeOutcome::Opened) {
        return Err(anyhow!("no transport delivered a frame from {}", args.uri));
    }
    Ok(())
}
