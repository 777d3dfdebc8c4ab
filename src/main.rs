//! Command-line entry point.
//!
//! Logs go to stderr (filter with `RUST_LOG`, default `info`); the JSON
//! summary of the selected mode goes to stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mediador_crawler::{Config, Crawler, DocumentType, HttpSessionFactory, Region, RunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Crawl the Sistema Mediador registry and capture instrument PDFs",
    long_about = None
)]
struct Cli {
    /// Root directory of the artifact store
    #[arg(long, env = "DATA_ROOT", global = true)]
    data_root: Option<PathBuf>,

    /// Maximum number of concurrent workers
    #[arg(long, env = "MAX_WORKERS", global = true)]
    max_workers: Option<usize>,

    /// Minimum seconds between two requests of one worker
    #[arg(long, env = "RATE_LIMIT", global = true)]
    rate_limit: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl every configured region and document type
    Crawl {
        /// Regions to crawl, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        regions: Vec<Region>,

        /// Document types to crawl, comma separated (default: all)
        #[arg(long = "types", value_delimiter = ',')]
        document_types: Vec<DocumentType>,

        /// First registration year
        #[arg(long)]
        start_year: Option<i32>,

        /// Last registration year
        #[arg(long)]
        end_year: Option<i32>,
    },

    /// Crawl a single region and document type
    Tuple {
        /// Region code, e.g. SP
        #[arg(long)]
        region: Region,

        /// Document type: CCT, ACT or ADITIVO (or 1, 2, 3)
        #[arg(long = "type")]
        document_type: DocumentType,

        /// Stop after this many pages per year window
        #[arg(long)]
        max_pages: Option<u32>,

        /// First registration year
        #[arg(long)]
        start_year: Option<i32>,

        /// Last registration year
        #[arg(long)]
        end_year: Option<i32>,
    },

    /// Re-download stored attachments that are missing or invalid
    Repair,

    /// Report what the stored attachments actually contain
    Diagnose,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;
    if let Some(root) = cli.data_root {
        config.data_root = root;
    }
    if let Some(workers) = cli.max_workers {
        config.max_workers = workers;
    }
    if let Some(secs) = cli.rate_limit {
        config.min_request_interval = std::time::Duration::try_from_secs_f64(secs)?;
    }

    match cli.command {
        Command::Crawl {
            regions,
            document_types,
            start_year,
            end_year,
        } => {
            if !regions.is_empty() {
                config.regions = regions;
            }
            if !document_types.is_empty() {
                config.document_types = document_types;
            }
            apply_years(&mut config, start_year, end_year);

            let crawler = build(config).await?;
            print_json(&crawler.run().await)
        }
        Command::Tuple {
            region,
            document_type,
            max_pages,
            start_year,
            end_year,
        } => {
            config.regions = vec![region];
            config.document_types = vec![document_type];
            config.max_pages = max_pages.or(config.max_pages);
            apply_years(&mut config, start_year, end_year);

            let crawler = build(config).await?;
            let started_at = chrono::Utc::now();
            let report = crawler.run_tuple(region, document_type).await;
            let summary = RunSummary::from_reports(started_at, chrono::Utc::now(), vec![report]);
            print_json(&summary)
        }
        Command::Repair => {
            let crawler = build(config).await?;
            print_json(&crawler.repair_attachments().await?)
        }
        Command::Diagnose => {
            let crawler = build(config).await?;
            print_json(&crawler.diagnose().await?)
        }
    }
}

fn apply_years(config: &mut Config, start_year: Option<i32>, end_year: Option<i32>) {
    if let Some(start) = start_year {
        config.start_year = start;
    }
    if let Some(end) = end_year {
        config.end_year = Some(end);
    }
}

async fn build(config: Config) -> mediador_crawler::Result<Crawler> {
    let sessions = Arc::new(HttpSessionFactory::new(&config));
    Crawler::new(config, sessions).await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
