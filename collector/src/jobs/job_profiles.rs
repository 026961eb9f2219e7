//! Picks the most interesting recent queries and downloads their profiles.

use super::write_bytes;
use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
    rest::cancellable,
};
use eyre::{
    bail,
    Context as _,
    Result,
};
use flate2::read::GzDecoder;
use futures::{
    stream,
    StreamExt as _,
};
use reqwest::Method;
use serde::Deserialize;
use std::{
    collections::HashSet,
    fs,
    io::{
        BufRead as _,
        BufReader,
        Read,
    },
    path::Path,
};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub query_id: String,
    pub query_type: String,
    pub query_cost: f64,
    pub planning_ms: u64,
    pub running_ms: u64,
    /// Epoch milliseconds.
    pub submitted_at: i64,
    pub outcome: String,
}

impl QueryRecord {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome.as_str(), "FAILED" | "CANCELLED" | "CANCELED")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueriesJsonLine {
    #[serde(default)]
    query_id: String,
    #[serde(default)]
    query_type: String,
    #[serde(default)]
    query_cost: f64,
    #[serde(default)]
    planning_time: f64,
    #[serde(default, alias = "runningTime")]
    execution_time: f64,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    outcome: String,
}

impl From<QueriesJsonLine> for QueryRecord {
    fn from(line: QueriesJsonLine) -> Self {
        Self {
            query_id: line.query_id,
            query_type: line.query_type,
            query_cost: line.query_cost,
            planning_ms: line.planning_time as u64,
            running_ms: line.execution_time as u64,
            submitted_at: line.start as i64,
            outcome: normalize_outcome(&line.outcome),
        }
    }
}

#[derive(Deserialize)]
struct HistoryRow {
    #[serde(default)]
    job_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    query_type: String,
    #[serde(default)]
    planner_estimated_cost: f64,
    #[serde(default)]
    submitted_epoch_millis: i64,
    #[serde(default)]
    planning_start_epoch_millis: i64,
    #[serde(default)]
    query_enqueued_epoch_millis: i64,
    #[serde(default)]
    execution_start_epoch_millis: i64,
    #[serde(default)]
    final_state_epoch_millis: i64,
}

impl From<HistoryRow> for QueryRecord {
    fn from(row: HistoryRow) -> Self {
        let span = |from: i64, to: i64| if from > 0 && to > from { (to - from) as u64 } else { 0 };
        Self {
            query_id: row.job_id,
            query_type: row.query_type,
            query_cost: row.planner_estimated_cost,
            planning_ms: span(row.planning_start_epoch_millis, row.query_enqueued_epoch_millis),
            running_ms: span(row.execution_start_epoch_millis, row.final_state_epoch_millis),
            submitted_at: row.submitted_epoch_millis,
            outcome: normalize_outcome(&row.status),
        }
    }
}

#[derive(Deserialize)]
struct HistoryPage {
    #[serde(default)]
    rows: Vec<HistoryRow>,
}

fn normalize_outcome(outcome: &str) -> String {
    match outcome.to_ascii_uppercase().as_str() {
        "CANCELED" => "CANCELLED".to_string(),
        other => other.to_string(),
    }
}

/// Parses newline-delimited query log records. Unparseable lines are skipped.
pub fn parse_queries_json(reader: impl Read) -> Vec<QueryRecord> {
    BufReader::new(reader)
        .lines()
        .map_while(|line| line.ok())
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<QueriesJsonLine>(&line).ok())
        .map(QueryRecord::from)
        .filter(|r| !r.query_id.is_empty())
        .collect()
}

/// Parses one exported results page of a job-history system table.
pub fn parse_history_page(bytes: &[u8]) -> Vec<QueryRecord> {
    serde_json::from_slice::<HistoryPage>(bytes)
        .map(|page| page.rows.into_iter().map(QueryRecord::from).filter(|r| !r.query_id.is_empty()).collect())
        .unwrap_or_default()
}

fn files_with_prefix(dir: &Path, prefixes: &[&str]) -> Vec<std::path::PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| prefixes.iter().any(|prefix| n.starts_with(prefix)))
        })
        .collect();
    files.sort();
    files
}

/// Records from the collected query logs, falling back to the exported
/// job-history table pages when no query log was captured.
pub fn load_records(queries_dir: &Path, system_tables_dir: &Path) -> Result<Vec<QueryRecord>> {
    let mut records = Vec::new();
    for path in files_with_prefix(queries_dir, &["queries.json"]) {
        let file = fs::File::open(&path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
        let parsed = if path.extension().is_some_and(|ext| ext == "gz") {
            parse_queries_json(GzDecoder::new(file))
        } else {
            parse_queries_json(file)
        };
        records.extend(parsed);
    }
    if !records.is_empty() {
        return Ok(records);
    }
    for path in files_with_prefix(system_tables_dir, &["sys.jobs_recent_", "sys.project.history.jobs_"]) {
        let bytes = fs::read(&path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
        records.extend(parse_history_page(&bytes));
    }
    Ok(records)
}

/// The `n` highest records by `key`. Ties keep input order.
pub fn top_by(records: &[QueryRecord], n: usize, key: impl Fn(&QueryRecord) -> f64) -> Vec<&QueryRecord> {
    let mut sorted: Vec<&QueryRecord> = records.iter().collect();
    sorted.sort_by(|a, b| key(b).total_cmp(&key(a)));
    sorted.truncate(n);
    sorted
}

/// The `n` most recently submitted failed or cancelled records.
pub fn recent_errors(records: &[QueryRecord], n: usize) -> Vec<&QueryRecord> {
    let mut errors: Vec<&QueryRecord> = records.iter().filter(|r| r.is_error()).collect();
    errors.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    errors.truncate(n);
    errors
}

/// Union of the four rankings, deduplicated by id and capped at `n`.
pub fn select_profiles(records: &[QueryRecord], n: usize) -> Vec<String> {
    let per_bucket = n.div_ceil(4);
    let buckets = [
        top_by(records, per_bucket, |r| r.planning_ms as f64),
        top_by(records, per_bucket, |r| r.running_ms as f64),
        top_by(records, per_bucket, |r| r.query_cost),
        recent_errors(records, per_bucket),
    ];
    let mut seen = HashSet::new();
    buckets
        .iter()
        .flatten()
        .filter(|r| seen.insert(r.query_id.as_str()))
        .map(|r| r.query_id.clone())
        .take(n)
        .collect()
}

pub struct JobProfilesJob;

impl Job for JobProfilesJob {
    fn name(&self) -> &'static str {
        "job-profiles"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.number_job_profiles > 0 && ctx.conf.rest_enabled()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let ctx: &CaptureContext = ctx;
            let queries_dir = ctx.layout.queries_dir();
            let tables_dir = ctx.layout.system_tables_dir();
            let records = tokio::task::spawn_blocking(move || load_records(&queries_dir, &tables_dir)).await??;
            let ids = select_profiles(&records, ctx.conf.number_job_profiles as usize);
            if ids.is_empty() {
                info!(records = records.len(), "no job ids to download");
                return Ok(());
            }

            let client = ctx.rest()?;
            let cancel = ctx.token();
            let dir = ctx.layout.job_profiles_dir();
            let downloads = ids
                .iter()
                .map(|id| {
                    let (client, cancel, pat) = (client.clone(), cancel.clone(), ctx.pat().to_string());
                    let (id, url, out) = (id.clone(), ctx.paths.job_profile(id), dir.join(format!("{id}.zip")));
                    async move {
                        if out.exists() {
                            return true;
                        }
                        let headers = [("Accept", "application/octet-stream")];
                        let result = match cancellable(&cancel, client.api_request(&url, &pat, Method::POST, &headers, None)).await {
                            Ok(body) => write_bytes(&out, &body).await,
                            Err(err) => Err(err.into()),
                        };
                        match result {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(job_id = %id, "profile download failed: {err:#}");
                                false
                            },
                        }
                    }
                })
                .collect::<Vec<_>>();
            let outcomes = stream::iter(downloads)
                .buffer_unordered(ctx.conf.number_threads.max(1))
                .collect::<Vec<bool>>()
                .await;

            let tried = outcomes.len();
            let collected = outcomes.into_iter().filter(|ok| *ok).count();
            info!(tried, collected, "job profiles downloaded");
            if collected == 0 {
                bail!("none of the {tried} job profiles could be downloaded");
            }
            Ok(())
        })
    }
}
