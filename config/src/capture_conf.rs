use crate::{
    profile::CollectionProfile,
    redact,
    ConfigError,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::path::{
    Path,
    PathBuf,
};

/// Fully resolved capture configuration for one node. Immutable once the
/// resolver hands it out; the local collector owns it for the whole run.
#[derive(Clone, derive_more::Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureConf {
    #[serde(default)]
    pub verbose: String,
    pub collect: CollectionProfile,

    pub collect_acceleration_log: bool,
    pub collect_access_log: bool,
    pub collect_audit_log: bool,
    pub collect_meta_refresh_log: bool,
    pub collect_reflection_log: bool,
    pub collect_vacuum_log: bool,
    pub collect_server_logs: bool,
    pub collect_queries_json: bool,
    pub collect_gc_logs: bool,
    pub collect_hs_err_files: bool,

    pub collect_jvm_flags: bool,
    pub collect_os_config: bool,
    pub collect_disk_usage: bool,
    pub collect_dremio_configuration: bool,

    pub collect_jfr: bool,
    pub collect_jstack: bool,
    pub collect_ttop: bool,
    pub capture_heap_dump: bool,

    pub collect_wlm: bool,
    pub collect_system_tables_export: bool,
    pub collect_kvstore_report: bool,
    pub number_job_profiles: u64,

    pub dremio_log_dir: String,
    pub dremio_conf_dir: String,
    pub dremio_rocksdb_dir: String,
    pub dremio_gclogs_dir: String,
    pub dremio_gc_file_pattern: String,
    #[serde(default)]
    pub dremio_home: String,
    #[serde(default)]
    pub dremio_pid: i32,

    pub dremio_endpoint: String,
    pub dremio_username: String,
    #[debug(skip)]
    #[serde(default, skip_serializing)]
    pub dremio_pat_token: String,
    pub allow_insecure_ssl: bool,
    pub rest_http_timeout: u64,

    pub is_rest_collect: bool,
    pub is_dremio_cloud: bool,
    pub dremio_cloud_project_id: String,
    #[serde(default)]
    pub disable_rest_api: bool,

    pub dremio_jfr_time_seconds: u64,
    pub dremio_jstack_time_seconds: u64,
    pub dremio_jstack_freq_seconds: u64,
    pub dremio_ttop_time_seconds: u64,
    pub dremio_ttop_freq_seconds: u64,

    pub dremio_logs_num_days: u64,
    pub dremio_queries_json_num_days: u64,

    pub system_tables_row_limit: u64,
    pub collect_system_tables_timeout_seconds: u64,
    pub rest_collect_daily_jobs_limit: u64,

    pub tarball_out_dir: String,
    pub tmp_output_dir: String,
    pub node_name: String,
    pub number_threads: usize,

    pub archive_size_limit_mb: u64,
    pub disable_archive_splitting: bool,

    pub min_free_space_gb: u64,
    pub disable_free_space_check: bool,
    pub no_log_dir: bool,

    #[serde(default)]
    pub system_tables: Vec<String>,
    #[serde(default)]
    pub system_tables_cloud: Vec<String>,
}

const DEFAULT_CONFIG: &str = include_str!("default-ddc.yaml");

impl Default for CaptureConf {
    fn default() -> Self {
        serde_yml::from_str(DEFAULT_CONFIG).expect("Failed to parse default config")
    }
}

impl CaptureConf {
    pub(crate) fn defaults_yaml() -> &'static str {
        DEFAULT_CONFIG
    }

    /// Console verbosity: the number of `v` characters, or the literal number.
    pub fn verbosity(&self) -> u8 {
        let trimmed = self.verbose.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return level;
        }
        trimmed.chars().filter(|c| *c == 'v').count().min(u8::MAX as usize) as u8
    }

    pub fn has_pat(&self) -> bool {
        !self.dremio_pat_token.trim().is_empty()
    }

    /// REST captures run on this node.
    pub fn rest_enabled(&self) -> bool {
        !self.disable_rest_api && self.has_pat()
    }

    /// Filesystem and JVM captures are meaningless in cloud and REST-only modes.
    pub fn filesystem_enabled(&self) -> bool {
        !self.is_dremio_cloud && !self.is_rest_collect
    }

    pub fn pid_known(&self) -> bool {
        self.dremio_pid > 0
    }

    pub fn days_to_collect(&self) -> u64 {
        self.dremio_logs_num_days
    }

    /// Tables exported through the system-tables job for the current deployment.
    pub fn tables_to_export(&self) -> &[String] {
        if self.is_dremio_cloud {
            &self.system_tables_cloud
        } else {
            &self.system_tables
        }
    }

    pub fn tarball_out_dir(&self) -> &Path {
        Path::new(&self.tarball_out_dir)
    }

    /// Root of the per-node output tree; defaults under the transfer directory.
    pub fn output_dir(&self) -> PathBuf {
        if self.tmp_output_dir.trim().is_empty() {
            self.tarball_out_dir().join("ddc-output")
        } else {
            PathBuf::from(&self.tmp_output_dir)
        }
    }

    /// Split threshold for the final archive, `None` when splitting is off.
    pub fn archive_split_bytes(&self) -> Option<u64> {
        if self.disable_archive_splitting || self.archive_size_limit_mb == 0 {
            return None;
        }
        Some(self.archive_size_limit_mb * 1024 * 1024)
    }

    /// Turns off every REST-dependent capture and zeroes its counters.
    pub fn disable_rest_captures(&mut self) {
        self.collect_wlm = false;
        self.collect_system_tables_export = false;
        self.collect_kvstore_report = false;
        self.number_job_profiles = 0;
    }

    pub fn disable_jvm_captures(&mut self) {
        self.collect_jfr = false;
        self.collect_jstack = false;
        self.collect_ttop = false;
        self.capture_heap_dump = false;
        self.collect_jvm_flags = false;
    }

    pub fn disable_log_captures(&mut self) {
        self.collect_acceleration_log = false;
        self.collect_access_log = false;
        self.collect_audit_log = false;
        self.collect_meta_refresh_log = false;
        self.collect_reflection_log = false;
        self.collect_vacuum_log = false;
        self.collect_server_logs = false;
        self.collect_queries_json = false;
        self.collect_hs_err_files = false;
    }

    fn collections(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("acceleration-log", self.collect_acceleration_log),
            ("access-log", self.collect_access_log),
            ("audit-log", self.collect_audit_log),
            ("meta-refresh-log", self.collect_meta_refresh_log),
            ("reflection-log", self.collect_reflection_log),
            ("vacuum-log", self.collect_vacuum_log),
            ("server-logs", self.collect_server_logs),
            ("queries-json", self.collect_queries_json),
            ("gc-logs", self.collect_gc_logs),
            ("hs-err-files", self.collect_hs_err_files),
            ("jvm-flags", self.collect_jvm_flags),
            ("os-config", self.collect_os_config),
            ("disk-usage", self.collect_disk_usage),
            ("dremio-configuration", self.collect_dremio_configuration),
            ("jfr", self.collect_jfr),
            ("jstack", self.collect_jstack),
            ("ttop", self.collect_ttop),
            ("heap-dump", self.capture_heap_dump),
            ("wlm", self.collect_wlm),
            ("system-tables-export", self.collect_system_tables_export),
            ("kvstore-report", self.collect_kvstore_report),
            ("job-profiles", self.number_job_profiles > 0),
        ]
    }

    pub fn collections_enabled(&self) -> Vec<String> {
        self.collections()
            .into_iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn collections_disabled(&self) -> Vec<String> {
        self.collections()
            .into_iter()
            .filter(|(_, on)| !*on)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// YAML shipped to nodes. The token is never part of it.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_yaml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::io(path, e))
    }

    /// Logs every resolved key at debug level with secrets masked.
    pub fn log_resolved(&self) {
        let Ok(serde_yml::Value::Mapping(map)) = serde_yml::to_value(self) else {
            return;
        };
        for (key, value) in map {
            let key = key.as_str().unwrap_or_default().to_string();
            let value = match value {
                serde_yml::Value::String(s) => s,
                other => serde_yml::to_string(&other).unwrap_or_default().trim().to_string(),
            };
            debug!("{}", redact::log_line(&key, &value));
        }
        debug!("{}", redact::log_line("dremio-pat-token", &self.dremio_pat_token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_yaml_parses() {
        let conf = CaptureConf::default();
        assert_eq!(conf.collect, CollectionProfile::Standard);
        assert_eq!(conf.system_tables[0], "\\\"tables\\\"");
        assert_eq!(conf.number_threads, 2);
        assert!(!conf.has_pat());
    }

    #[test]
    fn verbosity_counts_vs() {
        let mut conf = CaptureConf::default();
        assert_eq!(conf.verbosity(), 0);
        conf.verbose = "vvv".into();
        assert_eq!(conf.verbosity(), 3);
        conf.verbose = "2".into();
        assert_eq!(conf.verbosity(), 2);
    }

    #[test]
    fn token_never_serialized() {
        let conf = CaptureConf {
            dremio_pat_token: "super-secret-pat".into(),
            ..CaptureConf::default()
        };
        let yaml = conf.to_yaml().unwrap();
        assert!(!yaml.contains("super-secret-pat"));
        assert!(!format!("{conf:?}").contains("super-secret-pat"));
    }

    #[test]
    fn disabling_rest_zeroes_profiles() {
        let mut conf = CaptureConf::default();
        conf.disable_rest_captures();
        let disabled = conf.collections_disabled();
        for name in ["wlm", "system-tables-export", "kvstore-report", "job-profiles"] {
            assert!(disabled.contains(&name.to_string()), "{name} should be disabled");
        }
        assert_eq!(conf.number_job_profiles, 0);
    }

    #[test]
    fn split_threshold() {
        let mut conf = CaptureConf::default();
        assert_eq!(conf.archive_split_bytes(), None);
        conf.archive_size_limit_mb = 2;
        assert_eq!(conf.archive_split_bytes(), Some(2 * 1024 * 1024));
        conf.disable_archive_splitting = true;
        assert_eq!(conf.archive_split_bytes(), None);
    }
}
