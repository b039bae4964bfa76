mod capture;
mod config;
mod cooldown;
mod store;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use presence_core::{EnrollmentAggregator, LandmarkScheme, LivenessSession};
use presence_signals::ReplaySource;

use crate::capture::{AttendContext, EnrollContext};
use crate::config::Config;
use crate::cooldown::MarkCooldown;
use crate::store::IdentityStore;

#[derive(Parser)]
#[command(name = "presence", about = "Face attendance: liveness-gated enrollment and punch in/out")]
struct Cli {
    /// SQLite database path (overrides PRESENCE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) an identity from live frames
    Enroll {
        /// Name the identity is stored under
        #[arg(short, long)]
        name: String,
        /// Number of samples to collect
        #[arg(long, default_value_t = 20)]
        samples: usize,
        /// Recorded signals (JSON lines), or `-` for stdin
        #[arg(long, default_value = "-")]
        source: PathBuf,
    },
    /// Recognise live faces and mark attendance
    Attend {
        /// Cosine similarity threshold (overrides config)
        #[arg(long)]
        threshold: Option<f32>,
        /// Recorded signals (JSON lines), or `-` for stdin
        #[arg(long, default_value = "-")]
        source: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        #[arg(short, long)]
        name: String,
    },
    /// Print attendance records for a day
    Report {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(long)]
        day: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let store = IdentityStore::open(&config.db_path, config.embedding_dim)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::debug!(db = %config.db_path.display(), dim = config.embedding_dim, "store ready");

    match cli.command {
        Commands::Enroll {
            name,
            samples,
            source,
        } => {
            let mut frames = capture::spawn_source(open_source(&source)?)?;
            let base = Instant::now();
            let ctx = EnrollContext::new(
                LivenessSession::new(config.liveness(), base),
                EnrollmentAggregator::new(config.enroll_interval()),
                samples,
                base,
            );
            let summary = capture::run_enroll(&mut frames, &store, &name, ctx, shutdown_signal())
                .await
                .with_context(|| format!("enrollment of '{name}' failed"))?;
            println!(
                "Enrolled '{}' from {} samples ({} frames)",
                summary.name, summary.samples, summary.frames
            );
        }
        Commands::Attend { threshold, source } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let mut frames = capture::spawn_source(open_source(&source)?)?;
            let base = Instant::now();
            let ctx = AttendContext::new(
                LivenessSession::new(config.liveness(), base),
                MarkCooldown::new(config.mark_cooldown()),
                threshold,
                base,
            );
            let summary = capture::run_attend(&mut frames, &store, ctx, shutdown_signal()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::List => {
            let identities = store.list_identities().await?;
            if identities.is_empty() {
                println!("No identities enrolled");
            } else {
                println!("{}", serde_json::to_string_pretty(&identities)?);
            }
        }
        Commands::Remove { name } => {
            if store.remove_identity(&name).await? {
                println!("Removed '{name}'");
            } else {
                anyhow::bail!("no identity named '{name}'");
            }
        }
        Commands::Report { day } => {
            let day = day.unwrap_or_else(|| capture::local_now().date());
            let entries = store.attendance_for_day(day).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}

fn open_source(path: &Path) -> Result<ReplaySource<Box<dyn std::io::BufRead + Send>>> {
    ReplaySource::open(path, LandmarkScheme::FACE_MESH)
        .with_context(|| format!("failed to open signal source {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
