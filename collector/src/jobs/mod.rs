mod cluster_stats;
mod configuration;
mod job_profiles;
mod jvm;
mod kvstore;
mod logs;
mod node_info;
mod system_tables;
mod wlm;

pub use cluster_stats::{
    ClusterStats,
    ClusterStatsJob,
    FILE_NAME as CLUSTER_STATS_FILE,
};
pub use configuration::ConfigurationJob;
pub use job_profiles::{
    recent_errors,
    select_profiles,
    top_by,
    JobProfilesJob,
    QueryRecord,
};
pub use jvm::{
    HeapDumpJob,
    JfrStartJob,
    JfrStopJob,
    ThreadDumpsJob,
    TtopJob,
};
pub use kvstore::KvStoreJob;
pub use logs::LogsJob;
pub use node_info::NodeInfoJob;
pub use system_tables::{
    calculate_job_count,
    system_table_name,
    SystemTablesJob,
    UsageDay,
    PAGE_SIZE,
};
pub use wlm::WlmJob;

use crate::pipeline::JobQueue;
use eyre::{
    Context as _,
    Result,
};
use std::path::Path;

pub(crate) async fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .wrap_err_with(|| format!("failed to write {}", path.display()))
}

/// The node pipeline in execution order. REST captures go first while the
/// token is fresh; the query logs are copied before profiles are picked from
/// them; the JFR recording spans everything between its start and stop jobs.
pub fn node_pipeline() -> JobQueue {
    let mut queue = JobQueue::new();
    queue
        .push(WlmJob)
        .push(SystemTablesJob)
        .push(KvStoreJob)
        .push(ConfigurationJob)
        .push(NodeInfoJob)
        .push(LogsJob)
        .push(JfrStartJob)
        .push(ThreadDumpsJob)
        .push(TtopJob)
        .push(HeapDumpJob)
        .push(JobProfilesJob)
        .push(JfrStopJob)
        .push(ClusterStatsJob);
    queue
}
