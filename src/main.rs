use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use sentinel_fetch::catalog::{BearerToken, CatalogClient};
use sentinel_fetch::config::FetchConfig;
use sentinel_fetch::error::FetchError;
use sentinel_fetch::pipeline::{self, FetchOptions};
use sentinel_fetch::retry::RetryPolicy;
use sentinel_fetch::scheduler::{JobReport, JobState, SchedulerConfig};
use sentinel_fetch::store::AnonymousStore;

/// Exit codes: 0 success (or nothing matched), 1 fatal error, 2 partial
/// download, 3 cancelled.
#[derive(Parser, Debug)]
#[command(name = "sentinel-fetch", version, about = "Download Sentinel-2 products for an area of interest")]
struct Cli {
    /// Fetch configuration file.
    #[arg(long, default_value = "fetch.toml")]
    config: PathBuf,

    /// Override the configured output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override the configured worker-pool width.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Bearer token for the catalog, as resolved by the credential
    /// provider.
    #[arg(long, env = "COPERNICUS_TOKEN", hide_env_values = true)]
    token: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(report) => {
            info!(outcome = %report.summary(), "done");
            for failed in &report.failed {
                warn!(key = %failed.key, attempts = failed.attempts, reason = %failed.reason, "object not downloaded");
            }
            match report.state {
                JobState::Succeeded => ExitCode::SUCCESS,
                JobState::Partial => ExitCode::from(2),
                JobState::Cancelled => ExitCode::from(3),
                _ => ExitCode::from(1),
            }
        }
        Err(err) => {
            if let Some(FetchError::NoMatch) = err.downcast_ref::<FetchError>() {
                info!("no products matched the query, nothing to do");
                return ExitCode::SUCCESS;
            }
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<JobReport> {
    let config = FetchConfig::read(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;

    let aoi = config.aoi()?;
    let filter = config.filter()?;

    let endpoint = Url::parse(&config.catalog.endpoint)
        .with_context(|| format!("invalid catalog endpoint '{}'", config.catalog.endpoint))?;
    let catalog = CatalogClient::new(
        endpoint,
        config.catalog.collection.clone(),
        BearerToken::non_expiring(cli.token),
        RetryPolicy::default(),
    )?;

    let store = AnonymousStore::connect(&config.store.region).await;

    let options = FetchOptions {
        policy: Default::default(),
        output_dir: cli.output_dir.unwrap_or_else(|| config.download.output_dir.clone()),
        scheduler: SchedulerConfig {
            concurrency: cli.concurrency.unwrap_or(config.download.concurrency),
            retry: RetryPolicy {
                max_attempts: config.download.max_attempts,
                ..RetryPolicy::default()
            },
        },
        listing_retry: RetryPolicy::default(),
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            signal_token.cancel();
        }
    });

    let report = pipeline::fetch(
        &catalog,
        &store,
        &config.store.bucket,
        &aoi,
        &filter,
        &options,
        cancel,
    )
    .await?;
    Ok(report)
}
