//! End-to-end control flow: query the catalog, pick the best candidate,
//! resolve its tile prefix, list the product's files, download them.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aoi::AreaOfInterest;
use crate::catalog::{CatalogClient, Product, QueryFilter};
use crate::error::FetchError;
use crate::listing;
use crate::retry::RetryPolicy;
use crate::scheduler::{DownloadJob, DownloadScheduler, JobReport, SchedulerConfig};
use crate::selection::{self, SelectionPolicy};
use crate::store::StoreOps;
use crate::tile::{self, TilePath};

const REPORT_FILE_NAME: &str = "download_report.json";

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub policy: SelectionPolicy,
    pub output_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub listing_retry: RetryPolicy,
}

/// The candidate that will be fetched, with its resolved tile prefix.
#[derive(Debug)]
pub struct PlannedFetch<'a> {
    pub product: &'a Product,
    pub tile: TilePath,
}

/// Rank the candidates and resolve the best one whose title conforms to
/// the tile grammar. A malformed title disqualifies only that candidate;
/// the next-ranked one is tried instead.
pub fn plan_product(
    products: &[Product],
    policy: SelectionPolicy,
) -> Result<PlannedFetch<'_>, FetchError> {
    let ranked = selection::rank(products, policy);
    if ranked.is_empty() {
        return Err(FetchError::NoMatch);
    }

    let mut last_error = None;
    for product in ranked {
        match tile::resolve(&product.title) {
            Ok(tile) => {
                info!(
                    product = %product.id,
                    cloud_cover = product.cloud_cover_percent,
                    prefix = %tile.prefix(),
                    "selected product"
                );
                return Ok(PlannedFetch { product, tile });
            }
            Err(e) => {
                warn!(product = %product.id, error = %e, "skipping candidate");
                last_error = Some(e);
            }
        }
    }

    // Unreachable only if ranked were empty, which returned above.
    Err(last_error.expect("at least one candidate was examined"))
}

/// Select, resolve, list and download from an already-queried candidate
/// set. The settled job's report is also written into the job directory.
pub async fn fetch_from_candidates<S: StoreOps>(
    store: &S,
    bucket: &str,
    products: &[Product],
    options: &FetchOptions,
    cancel: CancellationToken,
) -> Result<JobReport, FetchError> {
    let plan = plan_product(products, options.policy)?;
    let prefix = plan.tile.prefix();

    let objects = listing::list_prefix(store, bucket, &prefix, &options.listing_retry).await?;
    let mut job = DownloadJob::new(&plan.product.title, &options.output_dir, &prefix, objects);

    let scheduler = DownloadScheduler::new(store, options.scheduler.clone(), cancel);
    let report = scheduler.run(&mut job).await?;

    if let Err(e) = report.write(job.job_dir.join(REPORT_FILE_NAME)) {
        warn!(error = %e, "failed to write job report");
    }
    Ok(report)
}

/// The full pipeline against live endpoints.
pub async fn fetch<S: StoreOps>(
    catalog: &CatalogClient,
    store: &S,
    bucket: &str,
    aoi: &AreaOfInterest,
    filter: &QueryFilter,
    options: &FetchOptions,
    cancel: CancellationToken,
) -> Result<JobReport, FetchError> {
    let products = catalog.query(aoi, filter).await?;
    info!(candidates = products.len(), "catalog query complete");
    fetch_from_candidates(store, bucket, &products, options, cancel).await
}
