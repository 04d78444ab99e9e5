//! # GBIFA Common Library
//!
//! Shared code for the dataset analytics pipeline:
//! - Error type and result alias
//! - Configuration loading
//! - Calendar-month utilities

pub mod config;
pub mod error;
pub mod time;

pub use config::{Config, DownloadMode, ReportMode};
pub use error::{Error, Result};
pub use time::YearMonth;
