//! Configuration loading for the analytics pipeline
//!
//! One TOML file drives a run. Only the dataset key is required; every
//! other field has a default matching the GBIF API's expectations.

use crate::time::YearMonth;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What the download phase should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Probe the total activity count only; fetch no pages
    CountOnly,
    /// Fetch every page of activity
    Full,
    /// Fetch until a page holds only records older than this month
    Since(YearMonth),
}

impl std::str::FromStr for DownloadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "count-only" => Ok(Self::CountOnly),
            "full" => Ok(Self::Full),
            other => YearMonth::parse(other).map(Self::Since).map_err(|_| {
                Error::Config(format!(
                    "download_mode must be \"count-only\", \"full\" or \"YYYY-MM\", got {:?}",
                    other
                ))
            }),
        }
    }
}

/// Which persisted records the reporting phase covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// All persisted months
    Full,
    /// The most recently completed calendar month only
    LatestMonth,
}

impl std::str::FromStr for ReportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "month" => Ok(Self::LatestMonth),
            other => Err(Error::Config(format!(
                "report_mode must be \"full\" or \"month\", got {:?}",
                other
            ))),
        }
    }
}

/// Pipeline configuration, deserialized from a TOML file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// GBIF dataset key the activity belongs to
    pub dataset_key: Uuid,

    /// "count-only", "full" or "YYYY-MM" (incremental since-month)
    #[serde(default = "default_download_mode")]
    pub download_mode: String,

    /// "full" or "month"
    #[serde(default = "default_report_mode")]
    pub report_mode: String,

    /// GBIF API base URL (overridable for tests)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Page size for activity requests
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Fixed delay between page requests, milliseconds
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// Per-request timeout, seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per request before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay between retry attempts, milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Directory holding monthly activity batches and run metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory the report data export is written to
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    /// Contributor record counts above this are bulk downloads, excluded
    /// from ranking
    #[serde(default = "default_bulk_download_threshold")]
    pub bulk_download_threshold: u64,

    /// Taxon keys whose presence excludes a record from ranking
    #[serde(default = "default_excluded_taxon_keys")]
    pub excluded_taxon_keys: Vec<String>,
}

fn default_download_mode() -> String {
    "count-only".to_string()
}

fn default_report_mode() -> String {
    "full".to_string()
}

fn default_api_base_url() -> String {
    "https://api.gbif.org/v1".to_string()
}

fn default_page_limit() -> u32 {
    100
}

fn default_page_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/saved_data")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("data/report_data")
}

fn default_bulk_download_threshold() -> u64 {
    245_000
}

fn default_excluded_taxon_keys() -> Vec<String> {
    // Kingdom-level backbone keys (Fungi, Plantae)
    vec!["5".to_string(), "6".to_string()]
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed download mode
    pub fn download_mode(&self) -> Result<DownloadMode> {
        self.download_mode.parse()
    }

    /// Parsed report mode
    pub fn report_mode(&self) -> Result<ReportMode> {
        self.report_mode.parse()
    }

    fn validate(&self) -> Result<()> {
        if self.page_limit == 0 {
            return Err(Error::Config("page_limit must be at least 1".to_string()));
        }
        if self.attempts == 0 {
            return Err(Error::Config("attempts must be at least 1".to_string()));
        }
        self.download_mode()?;
        self.report_mode()?;
        Ok(())
    }
}
