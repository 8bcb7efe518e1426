//! enroll - register identities, sources and pipelines in the store.
//!
//! `enroll identity` derives a face template from an image through the
//! perception service and stores it; `enroll source` and `enroll pipeline`
//! add the directory rows the daemon resolves ids against.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sitewatch::config::SitewatchConfig;
use sitewatch::frame::Frame;
use sitewatch::identity::encode_template;
use sitewatch::perception::{HttpPerceptionBackend, PerceptionBackend};
use sitewatch::pipeline::PipelineKind;
use sitewatch::store::{IdentityRecord, PipelineRecord, SourceRecord, SqliteStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage sitewatch identities, sources and pipelines")]
struct Args {
    /// Database path. Defaults to the configured db_path.
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a face template derived from an image.
    Identity {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        designation: Option<String>,
        /// JPEG showing exactly one face.
        #[arg(long)]
        image: PathBuf,
        /// Perception service base URL. Defaults to the configured one.
        #[arg(long)]
        perception_url: Option<String>,
    },
    /// Add or update a video source.
    Source {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        uri: String,
    },
    /// Add or update a pipeline definition.
    Pipeline {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// fire, helmet, activity or attendance.
        #[arg(long)]
        kind: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = SitewatchConfig::load()?;
    let store = SqliteStore::open(args.db.as_deref().unwrap_or(&cfg.db_path))?;

    match args.command {
        Command::Identity {
            id,
            name,
            department,
            designation,
            image,
            perception_url,
        } => {
            let url = perception_url
                .or(cfg.perception.url.clone())
                .ok_or_else(|| anyhow!("no perception url configured; pass --perception-url"))?;
            let backend = HttpPerceptionBackend::with_timeout(&url, cfg.perception.timeout)?;
            let bytes = std::fs::read(&image)
                .with_context(|| format!("read image {}", image.display()))?;
            let frame = Frame::decode(&bytes)?;
            let faces = backend.faces(&frame)?;
            let face = match faces.as_slice() {
                [] => return Err(anyhow!("no face found in {}", image.display())),
                [face] => face,
                many => {
                    return Err(anyhow!(
                        "{} faces found in {}; use an image with exactly one",
                        many.len(),
                        image.display()
                    ))
                }
            };
            if face.embedding.len() != cfg.template_dim {
                return Err(anyhow!(
                    "perception returned {} values, expected {}",
                    face.embedding.len(),
                    cfg.template_dim
                ));
            }
            store.upsert_identity(&IdentityRecord {
                external_id: id.clone(),
                name,
                department,
                designation,
                template: encode_template(&face.embedding),
            })?;
            log::info!("enrolled identity {}", id);
        }
        Command::Source { id, name, uri } => {
            if !sitewatch::validate_id(&id) {
                return Err(anyhow!("invalid source id '{}'", id));
            }
            sitewatch::source::SourceUri::parse(&uri)?;
            store.upsert_source(&SourceRecord { id: id.clone(), name, uri })?;
            log::info!("saved source {}", id);
        }
        Command::Pipeline { id, name, kind } => {
            if !sitewatch::validate_id(&id) {
                return Err(anyhow!("invalid pipeline id '{}'", id));
            }
            let parsed = PipelineKind::parse(&kind)
                .ok_or_else(|| anyhow!("unknown pipeline kind '{}'", kind))?;
            store.upsert_pipeline(&PipelineRecord {
                id: id.clone(),
                name,
                kind: parsed.as_str().to_string(),
            })?;
            log::info!("saved {} pipeline {}", parsed, id);
        }
    }
    Ok(())
}
