//! TOML fetch configuration.
//!
//! One file describes a complete acquisition: the area of interest, the
//! query constraints, where the catalog and bucket live, and how the
//! download should run. Everything but the AOI and date range has a
//! default taken from the public Copernicus/AWS setup.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::aoi::AreaOfInterest;
use crate::catalog::QueryFilter;
use crate::error::FetchError;

#[derive(Deserialize, Debug, Clone)]
pub struct FetchConfig {
    pub aoi: AoiConfig,
    pub query: QueryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AoiConfig {
    /// Closed polygon ring, `[lon, lat]` pairs.
    pub ring: Vec<[f64; 2]>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct QueryConfig {
    /// Inclusive, `YYYY-MM-DD`.
    pub date_start: String,
    /// Inclusive, `YYYY-MM-DD`.
    pub date_end: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default = "default_product_type")]
    pub product_type: String,
    #[serde(default)]
    pub cloud_cover_min: f64,
    #[serde(default = "default_cloud_cover_max")]
    pub cloud_cover_max: f64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub endpoint: String,
    pub collection: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://catalogue.dataspace.copernicus.eu/stac/search".to_string(),
            collection: "SENTINEL-2".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub bucket: String,
    pub region: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: "sentinel-s2-l2a".to_string(),
            region: "eu-central-1".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub max_attempts: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            concurrency: 4,
            max_attempts: 3,
        }
    }
}

fn default_product_type() -> String {
    "S2MSI2A".to_string()
}

fn default_cloud_cover_max() -> f64 {
    100.0
}

impl FetchConfig {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, FetchError> {
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| {
            FetchError::Config(format!(
                "failed to parse {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    pub fn aoi(&self) -> Result<AreaOfInterest, FetchError> {
        let ring = self.aoi.ring.iter().map(|&[lon, lat]| (lon, lat)).collect();
        AreaOfInterest::new(ring)
    }

    pub fn filter(&self) -> Result<QueryFilter, FetchError> {
        let filter = QueryFilter {
            date_start: parse_date(&self.query.date_start)?,
            date_end: parse_date(&self.query.date_end)?,
            platform: self.query.platform.clone(),
            product_type: self.query.product_type.clone(),
            cloud_cover_min: self.query.cloud_cover_min,
            cloud_cover_max: self.query.cloud_cover_max,
        };
        filter.validate()?;
        Ok(filter)
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, FetchError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| FetchError::Config(format!("invalid date '{value}': {e}")))
}
