use super::write_bytes;
use crate::{
    context::CaptureContext,
    layout::OutputLayout,
    pipeline::{
        Job,
        JobFuture,
    },
};
use ddc_config::CaptureConf;
use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    io::{
        BufRead as _,
        BufReader,
    },
    path::Path,
};

lazy_static::lazy_static! {
    static ref COMMON_JAR: Regex = Regex::new(r"^dremio-common-(.+)\.jar$").expect("jar regex");
    static ref CLUSTER_ID: Regex =
        Regex::new(r#"(?i)cluster[ _-]?id\W+([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})"#).expect("cluster id regex");
}

pub const FILE_NAME: &str = "cluster-stats.json";

/// Identity of one node as seen by its collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub node_name: String,
    pub version: String,
    pub cluster_id: String,
}

#[derive(Deserialize)]
struct VersionPage {
    #[serde(default)]
    rows: Vec<VersionRow>,
}

#[derive(Deserialize)]
struct VersionRow {
    #[serde(default)]
    version: String,
}

/// Version from an exported `sys.version` page.
pub fn version_from_export(tables_dir: &Path) -> Option<String> {
    let entries = fs::read_dir(tables_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sys.version_"))
        .filter_map(|e| fs::read(e.path()).ok())
        .filter_map(|bytes| serde_json::from_slice::<VersionPage>(&bytes).ok())
        .flat_map(|page| page.rows)
        .map(|row| row.version)
        .find(|v| !v.is_empty())
}

/// Version from the `dremio-common-<version>.jar` in the install.
pub fn version_from_jars(home: &Path) -> Option<String> {
    let entries = fs::read_dir(home.join("jars")).ok()?;
    entries
        .filter_map(|e| e.ok())
        .find_map(|e| COMMON_JAR.captures(&e.file_name().to_string_lossy()).map(|c| c[1].to_string()))
}

/// First cluster id mentioned in a server log.
pub fn cluster_id_from_log(log: &Path) -> Option<String> {
    let file = fs::File::open(log).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .find_map(|line| CLUSTER_ID.captures(&line).map(|c| c[1].to_string()))
}

pub fn gather(conf: &CaptureConf, layout: &OutputLayout) -> ClusterStats {
    let version = version_from_export(&layout.system_tables_dir())
        .or_else(|| (!conf.dremio_home.is_empty()).then(|| version_from_jars(Path::new(&conf.dremio_home))).flatten())
        .unwrap_or_default();
    let mut logs = vec![layout.logs_dir().join("server.log")];
    if !conf.dremio_log_dir.is_empty() {
        logs.push(Path::new(&conf.dremio_log_dir).join("server.log"));
    }
    let cluster_id = logs.iter().find_map(|log| cluster_id_from_log(log)).unwrap_or_default();
    ClusterStats {
        node_name: layout.node().to_string(),
        version,
        cluster_id,
    }
}

pub struct ClusterStatsJob;

impl Job for ClusterStatsJob {
    fn name(&self) -> &'static str {
        "cluster-stats"
    }

    fn enabled(&self, _ctx: &CaptureContext) -> bool {
        true
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let conf = ctx.conf.clone();
            let layout = ctx.layout.clone();
            let stats = tokio::task::spawn_blocking(move || gather(&conf, &layout)).await?;
            if stats.version.is_empty() {
                warn!("could not determine the server version");
            }
            let json = serde_json::to_vec_pretty(&stats)?;
            write_bytes(&ctx.layout.cluster_stats_dir().join(FILE_NAME), &json).await?;
            Ok(())
        })
    }
}
