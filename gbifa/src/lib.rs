//! # GBIF Dataset Activity Analytics
//!
//! Pipeline that ingests a dataset's occurrence-download activity from the
//! GBIF API, persists it in monthly batches, extracts taxonomic and
//! geographic filter criteria from each download's predicate tree, and
//! ranks downloads by the dataset's contribution percentage:
//! - API client with bounded retry and request pacing
//! - Pagination with date-bounded early termination
//! - Monthly batch persistence
//! - Predicate extraction and aggregation
//! - Ranking and report-data export

pub mod api;
pub mod download;
pub mod predicate;
pub mod process;
pub mod report;
pub mod store;
