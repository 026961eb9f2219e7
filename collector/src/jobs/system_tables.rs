//! Exports configured `sys.*` tables through the SQL REST API, one file per
//! results page.

use super::write_bytes;
use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
    rest::{
        cancellable,
        poll_job,
        RestError,
    },
};
use eyre::{
    bail,
    Result,
};
use reqwest::Method;
use serde::Deserialize;
use std::{
    path::Path,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub const PAGE_SIZE: u64 = 500;

const JOBS_RECENT: &str = "jobs_recent";
const JOB_HISTORY_TABLES: [&str; 2] = [JOBS_RECENT, "project.history.jobs"];

/// Filesystem-safe output name for one page of `table`.
pub fn system_table_name(table: &str, suffix: &str) -> String {
    let name = format!("sys.{table}_{suffix}.json");
    name.replace("\\\"", "")
        .replace('"', "")
        .replace('?', "")
        .replace(['=', '&'], "_")
        .replace("_.json", ".json")
}

/// `{"sql": ...}` body for `table`. The table name is inserted as-is so that
/// pre-escaped quotes in the configuration stay valid JSON escapes.
pub fn table_query(table: &str, row_limit: u64, history_days: u64) -> String {
    let sql = if JOB_HISTORY_TABLES.contains(&table) {
        format!(
            "SELECT * FROM sys.{table} WHERE submitted_ts > DATE_SUB(NOW(), INTERVAL {history_days} DAY) ORDER BY submitted_ts DESC LIMIT {row_limit}"
        )
    } else {
        format!("SELECT * FROM sys.{table} LIMIT {row_limit}")
    };
    format!("{{\"sql\": \"{sql}\"}}")
}

#[derive(Debug, Deserialize)]
pub struct UsageDay {
    #[serde(rename = "jobCount", default)]
    pub job_count: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterUsage {
    #[serde(default)]
    stats: Vec<UsageDay>,
}

/// Average daily job count over the usage stats. The denominator is one more
/// than the number of days reported.
pub fn calculate_job_count(stats: &[UsageDay]) -> u64 {
    let total: u64 = stats.iter().map(|d| d.job_count).sum();
    total / (stats.len() as u64 + 1)
}

/// Average daily jobs from a previously captured `cluster_usage.json`.
pub fn daily_jobs_from_usage(path: &Path) -> Option<u64> {
    let bytes = std::fs::read(path).ok()?;
    let usage: ClusterUsage = serde_json::from_slice(&bytes).ok()?;
    Some(calculate_job_count(&usage.stats))
}

#[derive(Deserialize)]
struct ResultsPage {
    #[serde(rename = "rowCount", default)]
    row_count: u64,
}

pub struct SystemTablesJob;

impl Job for SystemTablesJob {
    fn name(&self) -> &'static str {
        "system-tables"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_system_tables_export && ctx.conf.rest_enabled()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let ctx: &CaptureContext = ctx;
            let deadline = ctx.deadline(Duration::from_secs(ctx.conf.collect_system_tables_timeout_seconds));
            let _guard = deadline.clone().drop_guard();

            let tables = gated_tables(ctx);
            let mut failed = 0usize;
            for table in &tables {
                if deadline.is_cancelled() {
                    warn!(table, "system tables deadline reached, skipping");
                    failed += 1;
                    continue;
                }
                match export_table(ctx, table, &deadline).await {
                    Ok(pages) => debug!(table, pages, "exported"),
                    Err(err) => {
                        warn!(table, "export failed: {err}");
                        failed += 1;
                    },
                }
            }
            if failed > 0 {
                bail!("{failed} of {} system tables failed", tables.len());
            }
            Ok(())
        })
    }
}

/// Configured tables minus `jobs_recent` when the cluster runs too many jobs
/// per day for the export to be reasonable.
fn gated_tables(ctx: &CaptureContext) -> Vec<String> {
    let tables = ctx.conf.tables_to_export().to_vec();
    if !tables.iter().any(|t| t == JOBS_RECENT) {
        return tables;
    }
    let usage = ctx.layout.wlm_dir().join("cluster_usage.json");
    let Some(daily) = daily_jobs_from_usage(&usage) else {
        debug!(path = %usage.display(), "no cluster usage available, keeping {JOBS_RECENT}");
        return tables;
    };
    let limit = ctx.conf.rest_collect_daily_jobs_limit;
    if daily > limit {
        warn!("skipping {JOBS_RECENT}: {daily} jobs per day exceeds the limit of {limit}");
        tables.into_iter().filter(|t| t != JOBS_RECENT).collect()
    } else {
        tables
    }
}

async fn export_table(ctx: &CaptureContext, table: &str, cancel: &CancellationToken) -> Result<usize> {
    let client = ctx.rest()?;
    let row_limit = ctx.conf.system_tables_row_limit;
    let body = table_query(table, row_limit, ctx.conf.dremio_queries_json_num_days);

    let job_id = cancellable(cancel, client.post_query(&ctx.paths.sql(), ctx.pat(), &[], &body)).await?;
    poll_job(client, &ctx.paths, ctx.pat(), &job_id, cancel).await?;

    let dir = ctx.layout.system_tables_dir();
    let mut offset = 0;
    let mut pages = 0;
    while offset < row_limit {
        let limit = PAGE_SIZE.min(row_limit - offset);
        let suffix = format!("?offset={offset}&limit={limit}");
        let url = ctx.paths.job_results(&job_id, &suffix);
        let bytes = cancellable(cancel, client.api_request(&url, ctx.pat(), Method::GET, &[], None)).await?;
        write_bytes(&dir.join(system_table_name(table, &suffix)), &bytes).await?;
        pages += 1;

        let page: ResultsPage = serde_json::from_slice(&bytes).map_err(|source| RestError::Decode {
            url: url.clone(),
            source,
        })?;
        offset += limit;
        if offset >= page.row_count {
            break;
        }
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn escaped_table_name() {
        assert_eq!(
            system_table_name("\\\"tables\\\"", "?offset=0&limit=500"),
            "sys.tables_offset_0_limit_500.json"
        );
        assert_eq!(
            system_table_name("project.history.jobs", "?offset=500&limit=250"),
            "sys.project.history.jobs_offset_500_limit_250.json"
        );
    }

    #[test]
    fn table_names_never_carry_unsafe_characters() {
        for table in ["\\\"tables\\\"", "a?b", "x=y&z", "\"quoted\"", "plain"] {
            for suffix in ["?offset=0&limit=500", "?a=b", ""] {
                let name = system_table_name(table, suffix);
                for bad in ["?", "=", "&", "\\\"", "\""] {
                    assert!(!name.contains(bad), "{name} contains {bad}");
                }
            }
        }
    }

    #[test]
    fn queries_keep_escaped_quotes() {
        let body = table_query("\\\"tables\\\"", 100, 7);
        assert_eq!(body, r#"{"sql": "SELECT * FROM sys.\"tables\" LIMIT 100"}"#);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["sql"], "SELECT * FROM sys.\"tables\" LIMIT 100");
    }

    #[test]
    fn history_tables_use_retention_window() {
        let body = table_query("jobs_recent", 1000, 28);
        assert!(body.contains("INTERVAL 28 DAY"));
        assert!(body.contains("ORDER BY submitted_ts DESC LIMIT 1000"));
    }

    #[test]
    fn daily_job_count_divides_by_days_plus_one() {
        let counts = [500, 600, 700, 680, 700, 700, 700];
        let stats: Vec<UsageDay> = counts.iter().map(|&job_count| UsageDay { job_count }).collect();
        assert_eq!(counts.iter().sum::<u64>(), 4580);
        assert_eq!(calculate_job_count(&stats), 572);
        assert_eq!(calculate_job_count(&[]), 0);
    }

    #[test]
    fn usage_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster_usage.json");
        std::fs::write(&path, r#"{"stats":[{"date":"2024-01-01","jobCount":30},{"date":"2024-01-02","jobCount":60}]}"#)
            .unwrap();
        assert_eq!(daily_jobs_from_usage(&path), Some(30));
        assert_eq!(daily_jobs_from_usage(&dir.path().join("missing.json")), None);
    }
}
