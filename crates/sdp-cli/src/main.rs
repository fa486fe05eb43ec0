use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdp_sync::{AppConfig, DataService};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sdp-cli")]
#[command(about = "Survey dashboard data pipeline")]
struct Cli {
    /// Give up on fetch/load work after this many seconds.
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the snapshot when stale (or always with --force) and print its summary.
    Sync {
        #[arg(long)]
        force: bool,
    },
    /// Show the current snapshot without contacting the feed.
    Status,
    /// Print per-species survival for completed surveys.
    Species,
    /// Run the dashboard web server.
    Serve,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn with_deadline<T, F>(deadline_secs: Option<u64>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, sdp_core::PipelineError>>,
{
    match deadline_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .with_context(|| format!("deadline of {secs}s exceeded"))?
            .map_err(Into::into),
        None => fut.await.map_err(Into::into),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Sync { force } => {
            let service = DataService::new(config)?;
            let processed = with_deadline(cli.deadline_secs, service.ensure_available(force)).await?;
            let summary = service.store().load_summary().await?;
            println!(
                "snapshot {} ({}): raw={} processed={} completed={} sites={} enumerators={}",
                summary.run_id,
                summary.last_updated.format("%Y-%m-%d %H:%M UTC"),
                summary.raw_rows,
                processed.len(),
                summary.completed_rows,
                summary.distinct_sites,
                summary.distinct_enumerators,
            );
        }
        Commands::Status => {
            let service = DataService::new(config)?;
            let status = service.status().await?;
            println!("data dir: {}", status.data_dir);
            match status.snapshot {
                Some(meta) => {
                    println!("snapshot: {}", meta.summary.run_id);
                    println!("last updated: {}", meta.summary.last_updated.to_rfc3339());
                    println!(
                        "stale: {} (max age {}h)",
                        status.stale, status.max_age_hours
                    );
                    for table in &meta.tables {
                        println!("  {}: {} rows, {} columns", table.name, table.rows, table.columns.len());
                    }
                }
                None => println!("snapshot: none"),
            }
        }
        Commands::Species => {
            let service = DataService::new(config)?;
            let species = with_deadline(cli.deadline_secs, service.species()).await?;
            println!(
                "{:<20} {:>10} {:>10} {:>10} {:>8}",
                "species", "planted", "survived", "survival%", "loss%"
            );
            for s in species {
                println!(
                    "{:<20} {:>10.0} {:>10.0} {:>10.1} {:>8.1}",
                    s.species, s.planted, s.survived, s.survival_rate, s.loss_rate
                );
            }
        }
        Commands::Serve => {
            sdp_web::serve(config).await?;
        }
    }

    Ok(())
}
