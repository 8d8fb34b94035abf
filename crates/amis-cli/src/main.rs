use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "amis-cli")]
#[command(about = "AMIS cooperative settlement exports: harvest, sync, report, serve")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, extract and dedup every enabled source, then write reports.
    Sync,
    /// Download one day's export from the settlement portal.
    Harvest {
        /// Trade date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Serve the dashboard.
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Print a digest of recent sync runs.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = amis_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} files={} failed_files={} records={} duplicates={} reports={}",
                summary.run_id,
                summary.stats.files,
                summary.stats.failed_files,
                summary.unique_records,
                summary.stats.duplicates,
                summary.reports_dir
            );
        }
        Commands::Harvest { date } => {
            let path = amis_sync::harvest_once_from_env(date).await?;
            println!("harvested export saved to {}", path.display());
        }
        Commands::Serve => {
            amis_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut config = amis_sync::SyncConfig::from_env();
            config.scheduler_enabled = true;
            let mut sched =
                amis_sync::maybe_build_scheduler(config, amis_sync::HarvestConfig::from_env())
                    .await?
                    .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let root = amis_sync::SyncConfig::from_env().workspace_root;
            println!("{}", amis_sync::report_daily_markdown(runs, Some(root))?);
        }
    }

    Ok(())
}
