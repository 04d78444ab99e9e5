//! End-to-end pipeline test: download to persisted batches to ranked export
//!
//! Drives the pipeline with a scripted activity source and a client pointed
//! at an unreachable endpoint, so taxon name lookups exercise their
//! fallback path instead of the network.

use async_trait::async_trait;
use gbifa::api::{ActivitySource, GbifClient, PagedResponse, QueryError};
use gbifa::{download, process, report, store};
use gbifa_common::{Config, DownloadMode};
use serde_json::{json, Value};

struct ScriptedSource {
    pages: Vec<Vec<Value>>,
}

#[async_trait]
impl ActivitySource for ScriptedSource {
    async fn activity_page(&self, limit: u32, offset: u64) -> Result<PagedResponse, QueryError> {
        let count = self.pages.iter().map(Vec::len).sum::<usize>() as u64;
        if limit == 0 {
            return Ok(PagedResponse {
                count,
                results: Vec::new(),
            });
        }
        let page_index = (offset / u64::from(limit)) as usize;
        Ok(PagedResponse {
            count,
            results: self.pages.get(page_index).cloned().unwrap_or_default(),
        })
    }
}

fn offline_config(data_dir: &std::path::Path, report_dir: &std::path::Path) -> Config {
    let toml_str = format!(
        "dataset_key = \"6b67d2dc-5a72-4647-9b8e-93b3f9f96a2f\"\n\
         api_base_url = \"http://127.0.0.1:9\"\n\
         page_limit = 2\n\
         page_delay_ms = 0\n\
         retry_delay_ms = 0\n\
         attempts = 1\n\
         timeout_secs = 2\n\
         data_dir = \"{}\"\n\
         report_dir = \"{}\"",
        data_dir.display(),
        report_dir.display()
    );
    toml::from_str(&toml_str).unwrap()
}

fn record(key: &str, created: &str, contributor: u64, total: u64, taxon: &str) -> Value {
    json!({
        "downloadKey": key,
        "numberRecords": contributor,
        "download": {
            "created": format!("{}T08:00:00.000+0000", created),
            "doi": format!("10.15468/dl.{}", key),
            "totalRecords": total,
            "request": {
                "type": "PREDICATE",
                "predicate": {
                    "type": "and",
                    "predicates": [
                        {"type": "equals", "key": "TAXON_KEY", "value": taxon},
                        {"type": "equals", "key": "COUNTRY", "value": "NZ"}
                    ]
                }
            }
        }
    })
}

#[tokio::test]
async fn test_full_pipeline_produces_ranked_report() {
    let data_dir = tempfile::tempdir().unwrap();
    let report_dir = tempfile::tempdir().unwrap();
    let config = offline_config(data_dir.path(), report_dir.path());

    // Five records over two months, most recent first; "self" is a
    // degenerate download of exactly this dataset's records
    let source = ScriptedSource {
        pages: vec![
            vec![
                record("top", "2024-04-20", 75, 100, "212"),
                record("tie", "2024-04-12", 750, 1000, "797"),
            ],
            vec![
                record("self", "2024-04-02", 500, 500, "212"),
                record("half", "2024-03-28", 50, 100, "212"),
            ],
            vec![record("small", "2024-03-05", 1, 10, "951")],
        ],
    };

    let summary = download::download_activity(
        &source,
        DownloadMode::Full,
        config.page_limit,
        &config.data_dir,
    )
    .await;
    assert_eq!(summary.total_count, 5);
    assert_eq!(summary.pages_fetched, 3);
    assert_eq!(summary.batches_written, 2);
    assert_eq!(store::read_metadata(&config.data_dir).unwrap().total_count, 5);

    // Reload from disk the way a reporting run would
    let raw_records = store::load_all_activity(&config.data_dir);
    assert_eq!(raw_records.len(), 5);

    let rules = process::ExclusionRules::from_config(&config);
    let context = process::PipelineContext::build(raw_records, &rules, None);
    assert_eq!(context.records.len(), 5);
    // "self" is excluded: contributor count equals the download total
    assert_eq!(context.included_count(), 4);
    assert_eq!(context.taxon_counts["212"], 3);
    assert_eq!(context.taxon_counts["797"], 1);

    let client = GbifClient::new(&config);
    let data = report::export_report_data(
        &context,
        &client,
        &config.report_dir,
        report::DEFAULT_TOP_N,
    )
    .await
    .unwrap();

    let keys: Vec<&str> = data
        .downloads
        .iter()
        .map(|d| d.download_key.as_str())
        .collect();
    // 75.0 ties keep stream order; the degenerate download never ranks
    assert_eq!(keys, vec!["top", "tie", "half", "small"]);
    assert_eq!(data.downloads[0].contribution_percentage, 75.0);
    assert_eq!(data.downloads[1].contribution_percentage, 75.0);
    // Name lookups fail offline, so labels fall back to the raw keys
    assert_eq!(data.downloads[0].taxa.as_deref(), Some("212"));
    assert_eq!(data.downloads[0].locations.as_deref(), Some("NZ"));

    // Strengths reflect per-record deduplicated counts, ties in stream order
    assert_eq!(data.strengths.taxa[0].label, "212");
    assert_eq!(data.strengths.taxa[0].count, 3);
    assert_eq!(data.strengths.locations[0].label, "NZ");
    assert_eq!(data.strengths.locations[0].count, 5);

    // The export landed on disk and parses back
    let yaml = std::fs::read_to_string(config.report_dir.join(report::REPORT_DATA_FILE)).unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(
        parsed["downloads"][0]["download_key"].as_str(),
        Some("top")
    );
    assert_eq!(parsed["strengths"]["locations"][0]["count"].as_u64(), Some(5));
}

#[tokio::test]
async fn test_incremental_download_replaces_cutoff_months_only() {
    let data_dir = tempfile::tempdir().unwrap();
    let report_dir = tempfile::tempdir().unwrap();
    let config = offline_config(data_dir.path(), report_dir.path());
    let cutoff = gbifa_common::YearMonth::parse("2024-04").unwrap();

    // A previous run left an April batch behind
    store::write_month_batch(
        &config.data_dir,
        cutoff,
        &[record("stale", "2024-04-01", 1, 10, "212")],
        false,
    )
    .unwrap();

    let source = ScriptedSource {
        pages: vec![
            vec![
                record("fresh-a", "2024-04-20", 75, 100, "212"),
                record("fresh-b", "2024-04-12", 10, 100, "212"),
            ],
            // March page: everything is older than the cutoff
            vec![
                record("old-a", "2024-03-28", 5, 100, "212"),
                record("old-b", "2024-03-05", 5, 100, "212"),
            ],
            vec![record("never-fetched", "2024-02-01", 5, 100, "212")],
        ],
    };

    let summary = download::download_activity(
        &source,
        DownloadMode::Since(cutoff),
        config.page_limit,
        &config.data_dir,
    )
    .await;

    // The all-March page stops pagination; the February page is never asked for
    assert!(summary.early_stopped);
    assert_eq!(summary.pages_fetched, 2);

    // April was resynced: the stale record is superseded, not appended to
    let april = store::load_month(&config.data_dir, cutoff);
    let keys: Vec<&str> = april
        .iter()
        .filter_map(|r| r.get("downloadKey").and_then(Value::as_str))
        .collect();
    assert_eq!(keys, vec!["fresh-a", "fresh-b"]);

    // Bucketing halted at the cutoff, so no March batch was written
    let march = store::load_month(
        &config.data_dir,
        gbifa_common::YearMonth::parse("2024-03").unwrap(),
    );
    assert!(march.is_empty());
}
