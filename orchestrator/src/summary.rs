use crate::status::{
    NodeResult,
    StatusSnapshot,
};
use chrono::{
    DateTime,
    Utc,
};
use ddc_collector::jobs::{
    ClusterStats,
    CLUSTER_STATS_FILE,
};
use eyre::{
    Context as _,
    Result,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::Path,
};
use walkdir::WalkDir;

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub err: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub total_nodes_attempted: usize,
    pub number_nodes_contacted: usize,
}

/// `summary.json` at the top of the final archive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryBundle {
    #[serde(rename = "startTimeUTC")]
    pub start_time_utc: DateTime<Utc>,
    #[serde(rename = "endTimeUTC")]
    pub end_time_utc: DateTime<Utc>,
    pub total_runtime_seconds: u64,
    pub total_bytes_collected: u64,
    pub cluster_info: ClusterInfo,
    pub collected_files: Vec<CollectedFile>,
    pub failed_files: Vec<FailedFile>,
    pub executors: Vec<String>,
    pub coordinators: Vec<String>,
    pub node_results: BTreeMap<String, NodeResult>,
    pub dremio_version: BTreeMap<String, String>,
    #[serde(rename = "clusterID")]
    pub cluster_id: BTreeMap<String, String>,
    pub collections_enabled: Vec<String>,
    pub collections_disabled: Vec<String>,
    pub ddc_version: String,
}

/// Every regular file under `root`, with forward-slash relative paths.
pub fn collected_files(root: &Path) -> Vec<CollectedFile> {
    let mut files: Vec<CollectedFile> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?;
            let path = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
            let size = e.metadata().ok()?.len();
            Some(CollectedFile { path, size })
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// Version and cluster id per node, from every `cluster-stats.json` below `root`.
pub fn cluster_stats(root: &Path) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut versions = BTreeMap::new();
    let mut ids = BTreeMap::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == CLUSTER_STATS_FILE)
    {
        let stats = std::fs::read(entry.path())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ClusterStats>(&bytes).ok());
        let Some(stats) = stats else {
            warn!(path = %entry.path().display(), "unreadable cluster stats");
            continue;
        };
        let node = if stats.node_name.is_empty() {
            entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            stats.node_name
        };
        if !stats.version.is_empty() {
            versions.insert(node.clone(), stats.version);
        }
        if !stats.cluster_id.is_empty() {
            ids.insert(node, stats.cluster_id);
        }
    }
    (versions, ids)
}

impl SummaryBundle {
    pub fn build(
        staging: &Path,
        status: &StatusSnapshot,
        failed_files: Vec<FailedFile>,
        enabled: Vec<String>,
        disabled: Vec<String>,
    ) -> Self {
        let end = Utc::now();
        let start = status.started_at.unwrap_or(end);
        let collected = collected_files(staging);
        let (dremio_version, cluster_id) = cluster_stats(staging);
        let contacted = status.nodes.values().filter(|n| n.contacted).count();
        Self {
            start_time_utc: start,
            end_time_utc: end,
            total_runtime_seconds: (end - start).num_seconds().max(0) as u64,
            total_bytes_collected: collected.iter().map(|f| f.size).sum(),
            cluster_info: ClusterInfo {
                total_nodes_attempted: status.nodes.len(),
                number_nodes_contacted: contacted,
            },
            collected_files: collected,
            failed_files,
            executors: status.executors().map(|n| n.name.clone()).collect(),
            coordinators: status.coordinators().map(|n| n.name.clone()).collect(),
            node_results: status.nodes.values().map(|n| (n.name.clone(), n.result)).collect(),
            dremio_version,
            cluster_id,
            collections_enabled: enabled,
            collections_disabled: disabled,
            ddc_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json).wrap_err_with(|| format!("failed to write {}", path.display()))
    }
}
