//! Dataset module for the per-location tide observation files.
//!
//! Each monitored location ships as one JSON file in the data provider's raw
//! shape:
//!
//! ```json
//! {"rawtide": {"tideInfo": [{"units": "feet", "tideSite": "Hanalei"}],
//!              "rawTideObs": [{"height": 1.23, "epoch": 1577836800}]}}
//! ```
//!
//! Files are read once at startup and are read-only afterwards.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Slugs of the monitored coastal locations, in load order.
pub const MONITORED_LOCATIONS: &[&str] = &["hanalei", "hilo", "honolulu", "kahului"];

/// A single tide reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TideObservation {
    /// Water height in the dataset's unit
    pub height: f64,

    /// Seconds since the Unix epoch
    pub epoch: i64,
}

impl TideObservation {
    pub fn new(height: f64, epoch: i64) -> Self {
        Self { height, epoch }
    }

    /// Reading time as a UTC timestamp, if the epoch is representable.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.epoch, 0)
    }
}

/// All observations for one monitored location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationDataset {
    /// Tide station name, used as the `location` tag
    pub site: String,

    /// Height unit, used as the `unit` tag
    pub unit: String,

    /// Observations in provider order
    pub observations: Vec<TideObservation>,
}

impl LocationDataset {
    pub fn new(
        site: impl Into<String>,
        unit: impl Into<String>,
        observations: Vec<TideObservation>,
    ) -> Self {
        Self {
            site: site.into(),
            unit: unit.into(),
            observations,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Earliest and latest reading times, for diagnostics.
    pub fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.observations.iter().map(|o| o.epoch).min()?;
        let last = self.observations.iter().map(|o| o.epoch).max()?;
        Some((
            DateTime::from_timestamp(first, 0)?,
            DateTime::from_timestamp(last, 0)?,
        ))
    }
}

/// Errors that can occur while loading dataset files.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed dataset {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Dataset {path} has no tideInfo entry")]
    MissingTideInfo { path: PathBuf },

    #[error("Dataset {path} has an empty {field}")]
    EmptyTag { path: PathBuf, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct RawFile {
    rawtide: RawTide,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTide {
    #[serde(default)]
    tide_info: Vec<RawTideInfo>,

    #[serde(default)]
    raw_tide_obs: Vec<TideObservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTideInfo {
    units: String,
    tide_site: String,
}

/// Parse a dataset from the provider's raw JSON.
///
/// Site and unit come from the first `tideInfo` entry; every observation in
/// the file shares them.
pub fn parse_dataset(path: &Path, bytes: &[u8]) -> Result<LocationDataset, DatasetError> {
    let raw: RawFile = serde_json::from_slice(bytes).map_err(|source| DatasetError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let info = raw
        .rawtide
        .tide_info
        .into_iter()
        .next()
        .ok_or_else(|| DatasetError::MissingTideInfo {
            path: path.to_path_buf(),
        })?;

    if info.tide_site.trim().is_empty() {
        return Err(DatasetError::EmptyTag {
            path: path.to_path_buf(),
            field: "tideSite",
        });
    }
    if info.units.trim().is_empty() {
        return Err(DatasetError::EmptyTag {
            path: path.to_path_buf(),
            field: "units",
        });
    }

    Ok(LocationDataset::new(
        info.tide_site,
        info.units,
        raw.rawtide.raw_tide_obs,
    ))
}

/// Path of the dataset file for a location slug.
pub fn dataset_path(data_dir: &Path, slug: &str) -> PathBuf {
    data_dir.join(format!("tides-{}.json", slug))
}

/// Read and parse one dataset file.
pub async fn load_dataset(path: &Path) -> Result<LocationDataset, DatasetError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let dataset = parse_dataset(path, &bytes)?;

    match dataset.time_span() {
        Some((first, last)) => debug!(
            path = %path.display(),
            site = %dataset.site,
            observations = dataset.len(),
            first = %first,
            last = %last,
            "Dataset parsed"
        ),
        None => debug!(path = %path.display(), site = %dataset.site, "Dataset parsed (no observations)"),
    }

    Ok(dataset)
}

/// Load the datasets for every monitored location from `data_dir`.
///
/// Fails on the first unreadable or malformed file; a partial set is never
/// returned.
pub async fn load_monitored(data_dir: &Path) -> Result<Vec<LocationDataset>, DatasetError> {
    let mut datasets = Vec::with_capacity(MONITORED_LOCATIONS.len());

    for slug in MONITORED_LOCATIONS {
        let dataset = load_dataset(&dataset_path(data_dir, slug)).await?;
        info!(
            location = %dataset.site,
            unit = %dataset.unit,
            observations = dataset.len(),
            "Loaded tide dataset"
        );
        datasets.push(dataset);
    }

    Ok(datasets)
}
