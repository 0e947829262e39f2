mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tajrobe_sync::{ProgressReporter, SyncConfig, TracingReporter};
use tracing_subscriber::EnvFilter;

use crate::progress::BarReporter;

#[derive(Debug, Parser)]
#[command(name = "tajrobe")]
#[command(about = "Synchronize the tajrobe company review dataset")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Directory holding data.json, progress.json and backups/.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch reviews missing from data.json and merge them in.
    Sync(SyncArgs),
    /// Print dataset totals.
    Count,
    /// Refresh cached-companies.json from the paginated companies endpoint.
    CacheCompanies {
        #[arg(long)]
        api_url: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    batch_delay_ms: Option<u64>,
    /// Log progress lines instead of drawing progress bars.
    #[arg(long)]
    no_progress: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(url) = &self.api_base_url {
            config.api_base_url = url.clone();
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size.max(1);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        if let Some(ms) = self.batch_delay_ms {
            config.batch_delay = Duration::from_millis(ms);
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = SyncConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        api_base_url = %config.api_base_url,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let reporter: Arc<dyn ProgressReporter> = if args.no_progress || cli.json_logs {
                Arc::new(TracingReporter)
            } else {
                Arc::new(BarReporter::new())
            };
            let summary = tajrobe_sync::run_sync_once(config, reporter).await?;
            if summary.up_to_date {
                println!(
                    "dataset is already up to date (latest review id {})",
                    summary.latest_review_id
                );
            } else {
                println!(
                    "sync complete: run_id={} candidates={} merged={} absent={} failed={} orphaned={} backup={}",
                    summary.run_id,
                    summary.candidates,
                    summary.merged,
                    summary.absent,
                    summary.failed,
                    summary.orphaned,
                    summary
                        .backup_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
            }
        }
        Commands::Count => {
            let stats = tajrobe_sync::dataset_report(&config.data_dir).await?;
            println!("companies: {}", stats.companies);
            println!("companies without reviews: {}", stats.companies_without_reviews);
            println!("total number of reviews: {}", stats.reviews);
            match stats.highest_review_id {
                Some(id) => println!("highest review id: {id}"),
                None => println!("highest review id: none"),
            }
        }
        Commands::CacheCompanies { api_url } => {
            if let Some(url) = api_url {
                config.companies_api_url = url;
            }
            let summary = tajrobe_sync::cache_companies_from_config(&config).await?;
            println!(
                "cached {} companies from {} page(s) into {}",
                summary.companies,
                summary.pages,
                summary.path.display()
            );
        }
    }

    Ok(())
}
