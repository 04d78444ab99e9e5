//! Calendar-month utilities
//!
//! Activity records are batched and filtered by the calendar month of their
//! creation date, so (year, month) is a first-class value here.

use crate::{Error, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A calendar month: (year, month) with month in 1..=12
///
/// Ordering is chronological (derived field order: year, then month).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Create a new YearMonth, validating the month number
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::InvalidInput(format!(
                "month out of range: {}",
                month
            )));
        }
        Ok(Self { year, month })
    }

    /// Parse a "YYYY-MM" string (the `since` download mode format)
    pub fn parse(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidInput(format!("not a YYYY-MM month: {:?}", s)))?;
        let year: i32 = year
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad year in month: {:?}", s)))?;
        let month: u32 = month
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad month in month: {:?}", s)))?;
        Self::new(year, month)
    }

    /// The calendar month a date falls in
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The calendar month before the one `date` falls in
    ///
    /// Used to pick the reporting month: a run early in a month reports on
    /// the month that just finished.
    pub fn preceding(date: NaiveDate) -> Self {
        if date.month() == 1 {
            Self {
                year: date.year() - 1,
                month: 12,
            }
        } else {
            Self {
                year: date.year(),
                month: date.month() - 1,
            }
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First day of the month, the boundary used by date cutoff checks
    pub fn first_day(&self) -> NaiveDate {
        // Month is validated at construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("validated month")
    }

    /// Compact "YYYYMM" form used in batch filenames
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Extract the creation date from a raw activity record
///
/// The API reports `download.created` as an ISO datetime with an offset
/// (e.g. "2024-03-28T09:41:17.123+0000"); only the date part matters to the
/// pipeline. Returns None when the field is missing or unparseable.
pub fn created_date(record: &Value) -> Option<NaiveDate> {
    let created = record.get("download")?.get("created")?.as_str()?;
    let date_part = created.split('T').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
