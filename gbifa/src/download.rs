//! Activity download: pagination, monthly batching, citations
//!
//! The download phase walks the dataset's occurrence-download activity feed
//! page by page (most recent first), then cuts the fetched stream into
//! calendar-month batches for persistence. In incremental ("since") mode
//! both stages stop early at the cutoff month. A failed page is an accepted
//! gap, counted in the run summary, never a failed run.

use crate::api::{ActivitySource, GbifClient, QueryError};
use crate::store;
use chrono::NaiveDate;
use gbifa_common::time::created_date;
use gbifa_common::{DownloadMode, YearMonth};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

/// What one download phase did, for the run summary
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadSummary {
    /// Source-reported total activity count (0 if the probe failed)
    pub total_count: u64,
    /// Pages implied by the total count and page size
    pub pages_planned: u32,
    /// Pages fetched successfully
    pub pages_fetched: u32,
    /// Pages that exhausted the retry budget; their records are missing
    pub pages_failed: u32,
    /// Records fetched across all pages
    pub records_fetched: usize,
    /// Monthly batches written to disk
    pub batches_written: u32,
    /// Whether the date cutoff ended pagination before the last page
    pub early_stopped: bool,
}

/// Run the download phase for a dataset and persist the results
pub async fn download_activity(
    source: &impl ActivitySource,
    mode: DownloadMode,
    page_limit: u32,
    data_dir: &Path,
) -> DownloadSummary {
    let since = match mode {
        DownloadMode::Since(month) => Some(month),
        _ => None,
    };

    let probe = match source.activity_page(0, 0).await {
        Ok(page) => page,
        Err(error) => {
            tracing::warn!(%error, "activity count probe failed, nothing to download");
            return DownloadSummary::default();
        }
    };
    let total_count = probe.count;
    tracing::info!(total_count, "activity count probe complete");

    if let Err(error) = store::write_metadata(data_dir, &store::RunMetadata { total_count }) {
        tracing::warn!(%error, "failed to persist run metadata");
    }

    if mode == DownloadMode::CountOnly {
        return DownloadSummary {
            total_count,
            ..DownloadSummary::default()
        };
    }

    let mut outcome = fetch_pages(source, total_count, page_limit, since).await;

    let batches = bucket_by_month(std::mem::take(&mut outcome.records), since);
    let mut summary = outcome.summary;
    summary.batches_written = persist_batches(data_dir, &batches);
    summary.total_count = total_count;
    summary
}

/// Pagination controller state: summary plus the fetched stream
struct FetchOutcome {
    summary: DownloadSummary,
    records: Vec<Value>,
}

/// Fetch pages in increasing offset order until exhausted or cut off
async fn fetch_pages(
    source: &impl ActivitySource,
    total_count: u64,
    page_limit: u32,
    since: Option<YearMonth>,
) -> FetchOutcome {
    let pages_planned = page_count(total_count, page_limit);
    let cutoff = since.map(|month| month.first_day());

    let mut summary = DownloadSummary {
        pages_planned,
        ..DownloadSummary::default()
    };
    let mut records = Vec::new();

    for page_index in 0..pages_planned {
        let offset = u64::from(page_index) * u64::from(page_limit);
        match source.activity_page(page_limit, offset).await {
            Ok(page) => {
                summary.pages_fetched += 1;
                let reached_cutoff = match cutoff {
                    Some(cutoff) => !page_has_record_on_or_after(&page.results, cutoff),
                    None => false,
                };
                records.extend(page.results);

                if reached_cutoff {
                    tracing::info!(
                        page = page_index,
                        "page holds no records at or after cutoff, stopping pagination"
                    );
                    summary.early_stopped = true;
                    break;
                }
            }
            Err(error) => {
                // Accepted completeness gap; surfaced in the run summary
                tracing::warn!(page = page_index, offset, %error, "page fetch failed");
                summary.pages_failed += 1;
            }
        }
    }

    summary.records_fetched = records.len();
    FetchOutcome { summary, records }
}

/// Number of pages needed for `total_count` records
fn page_count(total_count: u64, page_limit: u32) -> u32 {
    ((total_count + u64::from(page_limit) - 1) / u64::from(page_limit)) as u32
}

/// True when at least one record in the page was created on/after `cutoff`
///
/// Pagination stops only when an entire page is older than the cutoff.
/// This is exact under the feed's non-increasing creation-date order, and
/// merely conservative without it. Records with unparseable dates do not
/// keep pagination alive.
fn page_has_record_on_or_after(records: &[Value], cutoff: NaiveDate) -> bool {
    records
        .iter()
        .filter_map(created_date)
        .any(|date| date >= cutoff)
}

/// One calendar month's slice of the fetched stream
#[derive(Debug, Clone, PartialEq)]
pub struct MonthBatch {
    pub month: YearMonth,
    pub records: Vec<Value>,
    /// Supersede the persisted batch instead of appending to it
    pub replace: bool,
}

/// Cut the fetched stream (most recent first) into monthly batches
///
/// Consecutive records sharing a calendar month form one batch; a month
/// that reappears later in a non-monotonic stream simply forms another
/// batch, flagged to append rather than replace. In incremental mode,
/// batching halts at the first record strictly older than the cutoff
/// month, and batches at/after the cutoff supersede their persisted
/// predecessors.
pub fn bucket_by_month(records: Vec<Value>, since: Option<YearMonth>) -> Vec<MonthBatch> {
    let cutoff_day = since.map(|month| month.first_day());

    let mut batches: Vec<MonthBatch> = Vec::new();
    let mut seen_months: HashSet<YearMonth> = HashSet::new();
    let mut current: Option<(YearMonth, Vec<Value>)> = None;

    for record in records {
        let Some(date) = created_date(&record) else {
            tracing::warn!("record without a usable creation date, skipping");
            continue;
        };
        let month = YearMonth::from_date(date);

        match &mut current {
            Some((open_month, buffer)) if *open_month == month => buffer.push(record),
            _ => {
                flush_batch(&mut current, &mut seen_months, &mut batches, since);
                if let Some(cutoff) = cutoff_day {
                    if date < cutoff {
                        // Incremental mode is done once the stream passes
                        // the cutoff; the rest of the stream stays unread
                        return batches;
                    }
                }
                current = Some((month, vec![record]));
            }
        }
    }

    flush_batch(&mut current, &mut seen_months, &mut batches, since);
    batches
}

/// Close the open buffer, if any, and emit it as a batch
///
/// The first flush of a month in a run may supersede the persisted file;
/// later flushes of the same month (non-monotonic stream) always append so
/// they cannot clobber this run's earlier flush.
fn flush_batch(
    current: &mut Option<(YearMonth, Vec<Value>)>,
    seen_months: &mut HashSet<YearMonth>,
    batches: &mut Vec<MonthBatch>,
    since: Option<YearMonth>,
) {
    if let Some((month, records)) = current.take() {
        let first_flush = seen_months.insert(month);
        let replace = first_flush
            && match since {
                Some(cutoff) => cutoff <= month,
                None => true,
            };
        batches.push(MonthBatch {
            month,
            records,
            replace,
        });
    }
}

/// Write monthly batches to disk; a failed write is logged and skipped
fn persist_batches(data_dir: &Path, batches: &[MonthBatch]) -> u32 {
    let mut written = 0;
    for batch in batches {
        match store::write_month_batch(data_dir, batch.month, &batch.records, batch.replace) {
            Ok(()) => written += 1,
            Err(error) => {
                tracing::warn!(month = %batch.month, %error, "failed to write activity batch");
            }
        }
    }
    written
}

/// Citations list persisted for the report
#[derive(Debug, Clone, Serialize)]
pub struct CitationList {
    pub count: usize,
    pub publications: Vec<Publication>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Publication {
    pub reference: String,
    pub link: Option<String>,
}

/// Fetch literature citing the dataset and persist a formatted list
pub async fn download_citations(client: &GbifClient, dataset: &Uuid, data_dir: &Path) {
    let page = match client.citation_search(dataset).await {
        Ok(page) => page,
        Err(error) => {
            tracing::warn!(%error, "citation search failed, keeping previous citations");
            return;
        }
    };

    let citations = build_citation_list(&page.results);
    tracing::info!(count = citations.count, "citation search complete");

    let path = data_dir.join(store::CITATIONS_FILE);
    if let Err(error) = store::write_json_file(&path, &citations) {
        tracing::warn!(%error, "failed to persist citations");
    }
}

fn build_citation_list(results: &[Value]) -> CitationList {
    let publications: Vec<Publication> = results
        .iter()
        .map(|citation| Publication {
            reference: format_reference(citation),
            link: citation
                .get("websites")
                .and_then(Value::as_array)
                .and_then(|sites| sites.first())
                .and_then(Value::as_str)
                .map(String::from),
        })
        .collect();

    CitationList {
        count: publications.len(),
        publications,
    }
}

/// "{authors}, {title}, ({year}) {source}" with absent fields left blank
fn format_reference(citation: &Value) -> String {
    let title = citation.get("title").and_then(Value::as_str).unwrap_or("");
    let year = citation
        .get("year")
        .and_then(Value::as_u64)
        .map(|y| y.to_string())
        .unwrap_or_default();
    let source = citation.get("source").and_then(Value::as_str).unwrap_or("");

    let authors: Vec<String> = citation
        .get("authors")
        .and_then(Value::as_array)
        .map(|authors| {
            authors
                .iter()
                .map(|author| {
                    let first = author.get("firstName").and_then(Value::as_str).unwrap_or("");
                    let last = author.get("lastName").and_then(Value::as_str).unwrap_or("");
                    format!("{} {}", first, last).trim().to_string()
                })
                .collect()
        })
        .unwrap_or_default();

    format!("{}, {}, ({}) {}", authors.join(", "), title, year, source)
        .trim()
        .to_string()
}
