//! Directory predicates and the fallback policy applied after autodetection.

use crate::{
    autodetect::Detected,
    CaptureConf,
    ConfigError,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

/// A log dir holds at least one `server.log*` or `queries.json*` file.
pub fn is_valid_log_dir(path: &Path) -> Result<(), String> {
    let entries = fs::read_dir(path).map_err(|e| e.to_string())?;
    let found = entries.filter_map(|e| e.ok()).any(|e| {
        let name = e.file_name();
        let name = name.to_string_lossy();
        name.starts_with("server.log") || name.starts_with("queries.json")
    });
    if found {
        Ok(())
    } else {
        Err("no server.log or queries.json files found".to_string())
    }
}

pub fn is_valid_conf_dir(path: &Path) -> Result<(), String> {
    let mut entries = fs::read_dir(path).map_err(|e| e.to_string())?;
    if entries.next().is_some() {
        Ok(())
    } else {
        Err("directory is empty".to_string())
    }
}

pub fn is_valid_db_dir(path: &Path) -> Result<(), String> {
    if path.join("catalog").exists() {
        Ok(())
    } else {
        Err("no catalog entry found".to_string())
    }
}

/// Outcome of checking one configured directory against its detected counterpart.
#[derive(Debug, PartialEq)]
pub enum Resolved {
    Configured(PathBuf),
    Detected(PathBuf),
    Invalid(String),
}

/// Keeps the configured value if it passes `check`, otherwise falls back to
/// the detected one.
pub fn choose_dir(
    key: &'static str,
    configured: &str,
    detected: Option<&Path>,
    check: impl Fn(&Path) -> Result<(), String>,
) -> Resolved {
    let configured_err = if configured.trim().is_empty() {
        "not set".to_string()
    } else {
        match check(Path::new(configured)) {
            Ok(()) => return Resolved::Configured(PathBuf::from(configured)),
            Err(e) => e,
        }
    };
    match detected {
        Some(path) => match check(path) {
            Ok(()) => {
                if !configured.trim().is_empty() {
                    warn!(%key, configured, detected = %path.display(), reason = %configured_err, "configured directory is invalid, using autodetected value");
                }
                Resolved::Detected(path.to_path_buf())
            },
            Err(e) => Resolved::Invalid(format!("{configured_err}; autodetected {}: {e}", path.display())),
        },
        None => Resolved::Invalid(configured_err),
    }
}

/// Applies autodetected values and the directory rules to `conf`.
pub fn finalize(conf: &mut CaptureConf, detected: &Detected) -> Result<(), ConfigError> {
    if conf.dremio_pid <= 0 {
        conf.dremio_pid = detected.pid;
    }
    if conf.dremio_home.is_empty() {
        if let Some(home) = &detected.home {
            conf.dremio_home = home.display().to_string();
        }
    }

    if conf.filesystem_enabled() {
        match choose_dir("dremio-log-dir", &conf.dremio_log_dir, detected.log_dir.as_deref(), is_valid_log_dir) {
            Resolved::Configured(_) => {},
            Resolved::Detected(path) => conf.dremio_log_dir = path.display().to_string(),
            Resolved::Invalid(reason) if conf.no_log_dir => {
                warn!(%reason, "no usable log directory, log collection disabled");
                conf.disable_log_captures();
            },
            Resolved::Invalid(reason) => {
                return Err(ConfigError::InvalidDirectory {
                    key: "dremio-log-dir",
                    path: PathBuf::from(&conf.dremio_log_dir),
                    reason,
                });
            },
        }

        match choose_dir("dremio-conf-dir", &conf.dremio_conf_dir, detected.conf_dir.as_deref(), is_valid_conf_dir) {
            Resolved::Configured(_) => {},
            Resolved::Detected(path) => conf.dremio_conf_dir = path.display().to_string(),
            Resolved::Invalid(reason) => {
                warn!(%reason, "no usable configuration directory, configuration collection disabled");
                conf.collect_dremio_configuration = false;
            },
        }

        match choose_dir("dremio-rocksdb-dir", &conf.dremio_rocksdb_dir, detected.db_dir.as_deref(), is_valid_db_dir) {
            Resolved::Configured(_) => {},
            Resolved::Detected(path) => conf.dremio_rocksdb_dir = path.display().to_string(),
            Resolved::Invalid(reason) => {
                debug!(%reason, "no usable db directory");
                conf.dremio_rocksdb_dir.clear();
            },
        }

        if conf.dremio_gclogs_dir.trim().is_empty() {
            match &detected.gc_log_dir {
                Some(dir) => conf.dremio_gclogs_dir = dir.display().to_string(),
                None => conf.dremio_gclogs_dir = conf.dremio_log_dir.clone(),
            }
        }
        if let Some(pattern) = &detected.gc_file_pattern {
            if conf.dremio_gc_file_pattern.trim().is_empty() || conf.dremio_gc_file_pattern == "gc*.log*" {
                conf.dremio_gc_file_pattern = pattern.clone();
            }
        }

        if !conf.pid_known() {
            warn!("server process not found, JVM captures disabled");
            conf.disable_jvm_captures();
        }
    } else {
        conf.disable_log_captures();
        conf.disable_jvm_captures();
        conf.collect_gc_logs = false;
        conf.collect_os_config = false;
        conf.collect_disk_usage = false;
        conf.collect_dremio_configuration = false;
    }

    if conf.is_dremio_cloud && conf.dremio_cloud_project_id.trim().is_empty() {
        return Err(ConfigError::InvalidDirectory {
            key: "dremio-cloud-project-id",
            path: PathBuf::new(),
            reason: "cloud mode requires a project id".to_string(),
        });
    }

    // Token check comes last so every other rule sees the user's REST toggles.
    if !conf.rest_enabled() {
        if (conf.is_rest_collect || conf.is_dremio_cloud) && !conf.disable_rest_api {
            return Err(ConfigError::MissingPat {
                mode: "collecting over REST only",
            });
        }
        if !conf.disable_rest_api {
            info!("no personal access token, REST captures disabled");
        }
        conf.disable_rest_captures();
    }
    Ok(())
}
