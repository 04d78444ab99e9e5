//! Record finalization and aggregation
//!
//! The reporting pass turns raw persisted records into finalized
//! [`ActivityRecord`]s: extraction, deduplication, contribution percentage
//! and the exclusion rule all happen in one construction step, after which
//! a record never changes. Everything a run accumulates lives in one
//! [`PipelineContext`] that is passed around explicitly.

use crate::predicate::Predicate;
use gbifa_common::time::created_date;
use gbifa_common::{Config, YearMonth};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::hash::Hash;

/// Category of a geographic filter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationType {
    Continent,
    Country,
    StateProvince,
    Locality,
}

impl LocationType {
    pub const ALL: [LocationType; 4] = [
        LocationType::Continent,
        LocationType::Country,
        LocationType::StateProvince,
        LocationType::Locality,
    ];

    /// The predicate filter key carrying this category
    pub fn filter_key(self) -> &'static str {
        match self {
            LocationType::Continent => "CONTINENT",
            LocationType::Country => "COUNTRY",
            LocationType::StateProvince => "STATE_PROVINCE",
            LocationType::Locality => "LOCALITY",
        }
    }
}

impl std::fmt::Display for LocationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.filter_key())
    }
}

/// One finalized occurrence-download event
///
/// Built fully populated; immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    /// Download key, unique within a run
    pub key: String,
    /// DOI minted for the download, when present
    pub doi: Option<String>,
    /// Public landing page for the download
    pub link: String,
    /// Source-reported total record count of the download
    pub total_records: Option<u64>,
    /// Records in the download that came from this dataset
    pub contributor_records: Option<u64>,
    /// Share of the download attributable to this dataset, percent
    ///
    /// None when the record was filtered out before computation
    pub contribution_percentage: Option<f64>,
    /// Contributor count exceeded the total; percentage forced to zero
    pub anomalous: bool,
    /// Taxon keys from the download's filter, deduplicated, first-seen order
    pub taxon_keys: Vec<String>,
    /// Geographic filter values, deduplicated, first-seen order
    pub locations: Vec<(String, LocationType)>,
    /// Whether the record counts toward the report
    pub include_in_report: bool,
    /// Raw source payload
    pub raw: Value,
}

/// Thresholds and lists deciding which records the report may rank
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    /// Contributor counts above this are bulk/automated downloads
    pub bulk_download_threshold: u64,
    /// Taxon keys too broad to indicate a dataset strength
    pub excluded_taxon_keys: Vec<String>,
}

impl ExclusionRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bulk_download_threshold: config.bulk_download_threshold,
            excluded_taxon_keys: config.excluded_taxon_keys.clone(),
        }
    }
}

/// Everything one reporting run accumulates
///
/// Owns the finalized records and both frequency tables; constructed once
/// and threaded through the ranking and export stages.
#[derive(Debug, Default)]
pub struct PipelineContext {
    pub records: Vec<ActivityRecord>,
    /// Taxon key -> number of records whose filter names it (first-seen order)
    pub taxon_counts: IndexMap<String, u64>,
    /// (location, category) -> number of records whose filter names it
    pub location_counts: IndexMap<(String, LocationType), u64>,
    /// Raw records dropped for having no usable key, or duplicating one
    pub skipped: usize,
}

impl PipelineContext {
    /// Finalize raw records and accumulate the frequency tables
    ///
    /// `target_month` is set in month report mode: records created outside
    /// it are excluded before extraction and contribute nothing to the
    /// tables.
    pub fn build(
        raw_records: Vec<Value>,
        rules: &ExclusionRules,
        target_month: Option<YearMonth>,
    ) -> Self {
        let mut context = Self::default();
        let mut seen_keys: HashSet<String> = HashSet::new();

        for raw in raw_records {
            let Some(key) = raw
                .get("downloadKey")
                .and_then(Value::as_str)
                .map(String::from)
            else {
                tracing::warn!("record without a downloadKey, skipping");
                context.skipped += 1;
                continue;
            };
            if !seen_keys.insert(key.clone()) {
                tracing::debug!(key, "duplicate download key, keeping first occurrence");
                context.skipped += 1;
                continue;
            }

            let record = finalize_record(key, raw, rules, target_month);

            for taxon_key in &record.taxon_keys {
                *context.taxon_counts.entry(taxon_key.clone()).or_insert(0) += 1;
            }
            for location in &record.locations {
                *context.location_counts.entry(location.clone()).or_insert(0) += 1;
            }

            context.records.push(record);
        }

        tracing::info!(
            records = context.records.len(),
            included = context.included_count(),
            skipped = context.skipped,
            taxa = context.taxon_counts.len(),
            locations = context.location_counts.len(),
            "activity processing complete"
        );
        context
    }

    /// Records eligible for ranking
    pub fn included_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.include_in_report)
            .count()
    }
}

/// Build one finalized record from its raw payload
fn finalize_record(
    key: String,
    raw: Value,
    rules: &ExclusionRules,
    target_month: Option<YearMonth>,
) -> ActivityRecord {
    let link = format!("https://www.gbif.org/occurrence/download/{}", key);

    // Recency filter: outside the reporting month nothing else is computed
    if let Some(target) = target_month {
        let in_target = created_date(&raw)
            .map(|date| YearMonth::from_date(date) == target)
            .unwrap_or(false);
        if !in_target {
            return ActivityRecord {
                key,
                doi: None,
                link,
                total_records: None,
                contributor_records: None,
                contribution_percentage: None,
                anomalous: false,
                taxon_keys: Vec::new(),
                locations: Vec::new(),
                include_in_report: false,
                raw,
            };
        }
    }

    let predicate = raw
        .pointer("/download/request/predicate")
        .map(Predicate::parse)
        .unwrap_or(Predicate::Unsupported);

    let taxon_keys = dedup_preserving_order(predicate.values_for("TAXON_KEY"));
    let mut locations = Vec::new();
    for location_type in LocationType::ALL {
        for value in predicate.values_for(location_type.filter_key()) {
            locations.push((value, location_type));
        }
    }
    let locations = dedup_preserving_order(locations);

    let doi = raw
        .pointer("/download/doi")
        .and_then(Value::as_str)
        .map(String::from);
    let total_records = raw.pointer("/download/totalRecords").and_then(Value::as_u64);
    let contributor_records = raw.get("numberRecords").and_then(Value::as_u64);

    let (percentage, anomalous) = contribution_percentage(contributor_records, total_records);
    if anomalous {
        tracing::warn!(
            key,
            contributor = contributor_records,
            total = total_records,
            "contributor count exceeds download total, percentage set to 0"
        );
    }

    let include_in_report =
        !is_excluded(rules, contributor_records, total_records, &taxon_keys);

    ActivityRecord {
        key,
        doi,
        link,
        total_records,
        contributor_records,
        contribution_percentage: Some(percentage),
        anomalous,
        taxon_keys,
        locations,
        include_in_report,
        raw,
    }
}

/// Contribution percentage in [0, 100] plus the anomaly flag
///
/// Zero when either count is missing or zero; zero (flagged) when the
/// contributor count exceeds the total, so malformed upstream data cannot
/// outrank real contributions.
pub fn contribution_percentage(
    contributor: Option<u64>,
    total: Option<u64>,
) -> (f64, bool) {
    match (contributor, total) {
        (Some(contributor), Some(total)) if contributor > 0 && total > 0 => {
            if contributor > total {
                (0.0, true)
            } else {
                (round2(contributor as f64 / total as f64 * 100.0), false)
            }
        }
        _ => (0.0, false),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn is_excluded(
    rules: &ExclusionRules,
    contributor: Option<u64>,
    total: Option<u64>,
    taxon_keys: &[String],
) -> bool {
    // Download of exactly this dataset's own records: degenerate
    if contributor == total {
        return true;
    }
    if let Some(contributor) = contributor {
        if contributor > rules.bulk_download_threshold {
            return true;
        }
    }
    taxon_keys
        .iter()
        .any(|key| rules.excluded_taxon_keys.contains(key))
}

/// Keep the first occurrence of each value, preserving order
fn dedup_preserving_order<T: Eq + Hash + Clone>(values: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> ExclusionRules {
        ExclusionRules {
            bulk_download_threshold: 245_000,
            excluded_taxon_keys: vec!["5".to_string(), "6".to_string()],
        }
    }

    fn raw_record(key: &str, created: &str, contributor: u64, total: u64) -> Value {
        raw_record_with_predicate(
            key,
            created,
            contributor,
            total,
            json!({"type": "equals", "key": "TAXON_KEY", "value": "212"}),
        )
    }

    fn raw_record_with_predicate(
        key: &str,
        created: &str,
        contributor: u64,
        total: u64,
        predicate: Value,
    ) -> Value {
        json!({
            "downloadKey": key,
            "numberRecords": contributor,
            "download": {
                "created": format!("{}T08:00:00.000+0000", created),
                "doi": "10.15468/dl.example",
                "totalRecords": total,
                "request": {"predicate": predicate}
            }
        })
    }

    #[test]
    fn test_contribution_percentage_rounds_to_two_places() {
        assert_eq!(contribution_percentage(Some(450), Some(900)), (50.0, false));
        assert_eq!(contribution_percentage(Some(2), Some(3)), (66.67, false));
        assert_eq!(contribution_percentage(Some(1), Some(7)), (14.29, false));
    }

    #[test]
    fn test_contribution_percentage_anomaly_clamped_to_zero() {
        assert_eq!(contribution_percentage(Some(901), Some(900)), (0.0, true));
    }

    #[test]
    fn test_contribution_percentage_missing_counts() {
        assert_eq!(contribution_percentage(None, Some(900)), (0.0, false));
        assert_eq!(contribution_percentage(Some(450), None), (0.0, false));
        assert_eq!(contribution_percentage(Some(450), Some(0)), (0.0, false));
        assert_eq!(contribution_percentage(Some(0), Some(900)), (0.0, false));
    }

    #[test]
    fn test_contribution_percentage_always_in_bounds() {
        let samples = [
            (Some(0), Some(0)),
            (Some(1), Some(1)),
            (Some(899), Some(900)),
            (Some(901), Some(900)),
            (Some(u64::MAX), Some(1)),
            (None, None),
        ];
        for (contributor, total) in samples {
            let (percentage, _) = contribution_percentage(contributor, total);
            assert!(
                (0.0..=100.0).contains(&percentage),
                "out of bounds for {:?}/{:?}: {}",
                contributor,
                total,
                percentage
            );
        }
    }

    #[test]
    fn test_equal_counts_excluded() {
        let context = PipelineContext::build(
            vec![raw_record("eq", "2024-03-10", 900, 900)],
            &rules(),
            None,
        );
        let record = &context.records[0];
        assert_eq!(record.contribution_percentage, Some(100.0));
        assert!(!record.include_in_report);
    }

    #[test]
    fn test_bulk_download_excluded() {
        let context = PipelineContext::build(
            vec![raw_record("bulk", "2024-03-10", 245_001, 10_000_000)],
            &rules(),
            None,
        );
        assert!(!context.records[0].include_in_report);
    }

    #[test]
    fn test_excluded_taxon_key_excludes_record() {
        let predicate = json!({"type": "in", "key": "TAXON_KEY", "values": ["212", "5"]});
        let context = PipelineContext::build(
            vec![raw_record_with_predicate("kingdom", "2024-03-10", 10, 100, predicate)],
            &rules(),
            None,
        );
        assert!(!context.records[0].include_in_report);
    }

    #[test]
    fn test_ordinary_record_included() {
        let context = PipelineContext::build(
            vec![raw_record("ok", "2024-03-10", 450, 900)],
            &rules(),
            None,
        );
        let record = &context.records[0];
        assert!(record.include_in_report);
        assert_eq!(record.contribution_percentage, Some(50.0));
        assert_eq!(record.taxon_keys, vec!["212"]);
        assert_eq!(record.doi.as_deref(), Some("10.15468/dl.example"));
        assert_eq!(
            record.link,
            "https://www.gbif.org/occurrence/download/ok"
        );
    }

    #[test]
    fn test_extraction_dedupes_per_record_sets() {
        let predicate = json!({
            "type": "and",
            "predicates": [
                {"type": "equals", "key": "TAXON_KEY", "value": "212"},
                {"type": "in", "key": "TAXON_KEY", "values": ["797", "212"]},
                {"type": "equals", "key": "COUNTRY", "value": "NZ"},
                {"type": "equals", "key": "COUNTRY", "value": "NZ"}
            ]
        });
        let context = PipelineContext::build(
            vec![raw_record_with_predicate("dedup", "2024-03-10", 10, 100, predicate)],
            &rules(),
            None,
        );
        let record = &context.records[0];
        assert_eq!(record.taxon_keys, vec!["212", "797"]);
        assert_eq!(
            record.locations,
            vec![("NZ".to_string(), LocationType::Country)]
        );
        // Frequency tables count each key once per record
        assert_eq!(context.taxon_counts["212"], 1);
        assert_eq!(
            context.location_counts[&("NZ".to_string(), LocationType::Country)],
            1
        );
    }

    #[test]
    fn test_counts_accumulate_across_records_in_first_seen_order() {
        let records = vec![
            raw_record_with_predicate(
                "a",
                "2024-03-10",
                10,
                100,
                json!({"type": "equals", "key": "TAXON_KEY", "value": "797"}),
            ),
            raw_record_with_predicate(
                "b",
                "2024-03-09",
                10,
                100,
                json!({"type": "in", "key": "TAXON_KEY", "values": ["212", "797"]}),
            ),
        ];
        let context = PipelineContext::build(records, &rules(), None);
        let counts: Vec<(&String, &u64)> = context.taxon_counts.iter().collect();
        assert_eq!(counts[0], (&"797".to_string(), &2));
        assert_eq!(counts[1], (&"212".to_string(), &1));
    }

    #[test]
    fn test_duplicate_download_key_kept_once() {
        let records = vec![
            raw_record("dup", "2024-03-10", 450, 900),
            raw_record("dup", "2024-03-10", 450, 900),
        ];
        let context = PipelineContext::build(records, &rules(), None);
        assert_eq!(context.records.len(), 1);
        assert_eq!(context.skipped, 1);
        assert_eq!(context.taxon_counts["212"], 1);
    }

    #[test]
    fn test_record_without_key_skipped() {
        let context = PipelineContext::build(vec![json!({"numberRecords": 3})], &rules(), None);
        assert!(context.records.is_empty());
        assert_eq!(context.skipped, 1);
    }

    #[test]
    fn test_month_mode_excludes_other_months_before_extraction() {
        let target = YearMonth::parse("2024-03").unwrap();
        let records = vec![
            raw_record("in-month", "2024-03-10", 450, 900),
            raw_record("previous", "2024-02-27", 450, 900),
        ];
        let context = PipelineContext::build(records, &rules(), Some(target));

        let in_month = &context.records[0];
        assert!(in_month.include_in_report);

        let stale = &context.records[1];
        assert!(!stale.include_in_report);
        assert!(stale.taxon_keys.is_empty());
        assert_eq!(stale.contribution_percentage, None);
        // Excluded-by-recency records must not feed the frequency tables
        assert_eq!(context.taxon_counts["212"], 1);
    }

    #[test]
    fn test_missing_predicate_yields_empty_sets() {
        let raw = json!({
            "downloadKey": "nopredicate",
            "numberRecords": 10,
            "download": {
                "created": "2024-03-10T08:00:00.000+0000",
                "totalRecords": 100,
                "request": {}
            }
        });
        let context = PipelineContext::build(vec![raw], &rules(), None);
        let record = &context.records[0];
        assert!(record.taxon_keys.is_empty());
        assert!(record.locations.is_empty());
        assert!(record.include_in_report);
    }

    #[test]
    fn test_missing_counts_percentage_zero_and_excluded_by_equality() {
        // Both counts absent compare equal: degenerate, excluded
        let raw = json!({
            "downloadKey": "nocounts",
            "download": {
                "created": "2024-03-10T08:00:00.000+0000",
                "request": {"predicate": {"type": "equals", "key": "TAXON_KEY", "value": "212"}}
            }
        });
        let context = PipelineContext::build(vec![raw], &rules(), None);
        let record = &context.records[0];
        assert_eq!(record.contribution_percentage, Some(0.0));
        assert!(!record.include_in_report);
    }
}
