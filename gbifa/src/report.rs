//! Ranking and report-data export
//!
//! Produces the two downstream artifacts of a run: the ranked top-N
//! download list with flattened taxon/location summaries, and the global
//! "strengths" frequency tables, written together as `report_data.yaml`
//! for the report renderer to consume.

use crate::api::GbifClient;
use crate::process::{ActivityRecord, PipelineContext};
use gbifa_common::Result;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;

pub const REPORT_DATA_FILE: &str = "report_data.yaml";
pub const DEFAULT_TOP_N: usize = 10;

/// Ranked records keep at most this many taxon name labels
const MAX_TAXA_LABELS: usize = 5;

/// The export consumed by the report renderer
#[derive(Debug, Serialize)]
pub struct ReportData {
    pub downloads: Vec<RankedDownload>,
    pub strengths: Strengths,
}

/// One ranked download, flattened for presentation
#[derive(Debug, Serialize)]
pub struct RankedDownload {
    pub download_key: String,
    pub doi: Option<String>,
    pub link: String,
    pub request_type: Option<String>,
    pub contributor_records: Option<u64>,
    pub total_records: Option<u64>,
    pub contribution_percentage: f64,
    pub taxa: Option<String>,
    pub locations: Option<String>,
}

/// Global frequency tables, top-10 each
#[derive(Debug, Serialize)]
pub struct Strengths {
    pub taxa: Vec<Strength>,
    pub locations: Vec<Strength>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Strength {
    pub label: String,
    pub count: u64,
}

/// Included records ranked by descending contribution percentage
///
/// Stable on ties, so equal percentages keep their input order; returns at
/// most `top_n` records.
pub fn rank_by_contribution(records: &[ActivityRecord], top_n: usize) -> Vec<&ActivityRecord> {
    let mut included: Vec<&ActivityRecord> = records
        .iter()
        .filter(|record| record.include_in_report)
        .collect();
    included.sort_by(|a, b| {
        let a = a.contribution_percentage.unwrap_or(0.0);
        let b = b.contribution_percentage.unwrap_or(0.0);
        b.partial_cmp(&a).unwrap_or(Ordering::Equal)
    });
    included.truncate(top_n);
    included
}

/// Top `n` entries of a frequency table by descending count
///
/// Stable: equal counts keep the table's first-seen order.
pub fn top_counts<K: Clone + Eq + Hash>(counts: &IndexMap<K, u64>, n: usize) -> Vec<(K, u64)> {
    let mut entries: Vec<(K, u64)> = counts
        .iter()
        .map(|(key, count)| (key.clone(), *count))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(n);
    entries
}

/// Per-run memo of taxon key -> scientific name lookups
///
/// Failed lookups are cached too, so one dead endpoint costs one request
/// per key, not one per use.
#[derive(Debug, Default)]
pub struct TaxonNameCache {
    names: HashMap<String, Option<String>>,
}

impl TaxonNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scientific name for a taxon key, if the species service knows it
    pub async fn scientific_name(
        &mut self,
        client: &GbifClient,
        taxon_key: &str,
    ) -> Option<String> {
        if let Some(cached) = self.names.get(taxon_key) {
            return cached.clone();
        }
        let name = match client.species_name(taxon_key).await {
            Ok(value) => value
                .get("scientificName")
                .and_then(Value::as_str)
                .map(String::from),
            Err(error) => {
                tracing::warn!(taxon_key, %error, "species name lookup failed");
                None
            }
        };
        self.names.insert(taxon_key.to_string(), name.clone());
        name
    }
}

/// Assemble, log and persist the report data
pub async fn export_report_data(
    context: &PipelineContext,
    client: &GbifClient,
    report_dir: &Path,
    top_n: usize,
) -> Result<ReportData> {
    let data = build_report_data(context, client, top_n).await;
    log_proportion_report(&data.downloads);
    write_report_data(report_dir, &data)?;
    Ok(data)
}

/// Build the export structure, resolving taxon names as needed
pub async fn build_report_data(
    context: &PipelineContext,
    client: &GbifClient,
    top_n: usize,
) -> ReportData {
    let mut names = TaxonNameCache::new();

    let mut downloads = Vec::new();
    for record in rank_by_contribution(&context.records, top_n) {
        downloads.push(flatten_record(record, client, &mut names).await);
    }

    let mut taxa = Vec::new();
    for (key, count) in top_counts(&context.taxon_counts, DEFAULT_TOP_N) {
        let label = names
            .scientific_name(client, &key)
            .await
            .unwrap_or_else(|| key.clone());
        taxa.push(Strength { label, count });
    }

    let locations = top_counts(&context.location_counts, DEFAULT_TOP_N)
        .into_iter()
        .map(|((label, _), count)| Strength { label, count })
        .collect();

    ReportData {
        downloads,
        strengths: Strengths { taxa, locations },
    }
}

async fn flatten_record(
    record: &ActivityRecord,
    client: &GbifClient,
    names: &mut TaxonNameCache,
) -> RankedDownload {
    let truncated = record.taxon_keys.len() > MAX_TAXA_LABELS;
    let mut taxa_labels = Vec::new();
    for key in record.taxon_keys.iter().take(MAX_TAXA_LABELS) {
        let label = names
            .scientific_name(client, key)
            .await
            .unwrap_or_else(|| key.clone());
        taxa_labels.push(label);
    }

    RankedDownload {
        download_key: record.key.clone(),
        doi: record.doi.clone(),
        link: record.link.clone(),
        request_type: record
            .raw
            .pointer("/download/request/type")
            .and_then(Value::as_str)
            .map(String::from),
        contributor_records: record.contributor_records,
        total_records: record.total_records,
        contribution_percentage: record.contribution_percentage.unwrap_or(0.0),
        taxa: join_taxa_labels(taxa_labels, truncated),
        locations: join_location_labels(record),
    }
}

/// "name, name, ..., and other taxa"; None when the record names no taxa
fn join_taxa_labels(mut labels: Vec<String>, truncated: bool) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    if truncated {
        labels.push("and other taxa".to_string());
    }
    Some(labels.join(", "))
}

fn join_location_labels(record: &ActivityRecord) -> Option<String> {
    if record.locations.is_empty() {
        return None;
    }
    let labels: Vec<&str> = record
        .locations
        .iter()
        .map(|(label, _)| label.as_str())
        .collect();
    Some(labels.join(", "))
}

/// Write the export file, creating the report directory as needed
pub fn write_report_data(report_dir: &Path, data: &ReportData) -> Result<()> {
    std::fs::create_dir_all(report_dir)?;
    let body = serde_yaml::to_string(data)?;
    let path = report_dir.join(REPORT_DATA_FILE);
    std::fs::write(&path, body)?;
    tracing::info!(path = %path.display(), "report data written");
    Ok(())
}

/// Log the ranked list as the run's proportion report
fn log_proportion_report(downloads: &[RankedDownload]) {
    for (rank, download) in downloads.iter().enumerate() {
        tracing::info!(
            rank = rank + 1,
            key = %download.download_key,
            doi = download.doi.as_deref().unwrap_or("-"),
            contributor = download.contributor_records,
            total = download.total_records,
            percentage = download.contribution_percentage,
            taxa = download.taxa.as_deref().unwrap_or("-"),
            locations = download.locations.as_deref().unwrap_or("-"),
            "top contribution"
        );
    }
}
