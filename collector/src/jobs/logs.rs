//! Server, query and GC log copies filtered to a retention window.

use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
};
use ddc_config::CaptureConf;
use eyre::{
    Context as _,
    Result,
};
use regex::Regex;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::{
        Duration,
        SystemTime,
    },
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Filename prefixes of the server log streams enabled in `conf`.
pub fn enabled_prefixes(conf: &CaptureConf) -> Vec<&'static str> {
    [
        (conf.collect_server_logs, "server.log"),
        (conf.collect_server_logs, "server.out"),
        (conf.collect_access_log, "access.log"),
        (conf.collect_audit_log, "audit.json"),
        (conf.collect_acceleration_log, "acceleration.log"),
        (conf.collect_meta_refresh_log, "metadata_refresh.log"),
        (conf.collect_reflection_log, "reflection.log"),
        (conf.collect_vacuum_log, "vacuum.json"),
    ]
    .into_iter()
    .filter_map(|(on, prefix)| on.then_some(prefix))
    .collect()
}

/// Anchored regex for a shell-style glob (`*` and `?` only).
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).wrap_err_with(|| format!("invalid file pattern {pattern}"))
}

pub fn cutoff(days: u64) -> SystemTime {
    DAY.checked_mul(u32::try_from(days).unwrap_or(u32::MAX))
        .and_then(|window| SystemTime::now().checked_sub(window))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Regular files directly under `dir` whose name matches and whose
/// modification time is not older than `since`.
pub fn select_files(dir: &Path, matches: impl Fn(&str) -> bool, since: SystemTime) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().is_some_and(&matches))
        .filter(|e| e.metadata().ok().and_then(|m| m.modified().ok()).is_some_and(|m| m >= since))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Same as [`select_files`] but also looks in `<dir>/archive`.
pub fn select_with_archive(dir: &Path, matches: impl Fn(&str) -> bool, since: SystemTime) -> Vec<PathBuf> {
    let mut files = select_files(dir, &matches, since);
    files.extend(select_files(&dir.join("archive"), &matches, since));
    files
}

/// Copies `files` flat into `dest`. Returns bytes copied; a failed copy is
/// logged and skipped.
pub fn copy_into(files: &[PathBuf], dest: &Path) -> Result<u64> {
    fs::create_dir_all(dest).wrap_err_with(|| format!("failed to create {}", dest.display()))?;
    let mut total = 0;
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        match fs::copy(file, dest.join(name)) {
            Ok(bytes) => total += bytes,
            Err(err) => warn!(file = %file.display(), "copy failed: {err}"),
        }
    }
    Ok(total)
}

fn collect_all(conf: &CaptureConf, logs_dir: &Path, queries_dir: &Path) -> Result<()> {
    let log_dir = Path::new(&conf.dremio_log_dir);
    let log_cutoff = cutoff(conf.dremio_logs_num_days);

    let prefixes = enabled_prefixes(conf);
    if !prefixes.is_empty() {
        let files = select_with_archive(log_dir, |name| prefixes.iter().any(|p| name.starts_with(p)), log_cutoff);
        let bytes = copy_into(&files, logs_dir)?;
        info!(files = files.len(), bytes, "server logs copied");
    }

    if conf.collect_queries_json {
        let since = cutoff(conf.dremio_queries_json_num_days);
        let files = select_with_archive(log_dir, |name| name.starts_with("queries.json"), since);
        let bytes = copy_into(&files, queries_dir)?;
        info!(files = files.len(), bytes, "query logs copied");
    }

    if conf.collect_gc_logs && !conf.dremio_gclogs_dir.is_empty() {
        let pattern = glob_to_regex(&conf.dremio_gc_file_pattern)?;
        let files = select_files(Path::new(&conf.dremio_gclogs_dir), |name| pattern.is_match(name), log_cutoff);
        let bytes = copy_into(&files, logs_dir)?;
        info!(files = files.len(), bytes, "gc logs copied");
    }

    if conf.collect_hs_err_files {
        let hs_err = glob_to_regex("hs_err_pid*.log")?;
        let mut files = select_files(log_dir, |name| hs_err.is_match(name), SystemTime::UNIX_EPOCH);
        if !conf.dremio_home.is_empty() {
            files.extend(select_files(Path::new(&conf.dremio_home), |name| hs_err.is_match(name), SystemTime::UNIX_EPOCH));
        }
        files.dedup();
        copy_into(&files, logs_dir)?;
        if !files.is_empty() {
            warn!(count = files.len(), "JVM crash files found");
        }
    }
    Ok(())
}

pub struct LogsJob;

impl Job for LogsJob {
    fn name(&self) -> &'static str {
        "logs"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.filesystem_enabled() && !ctx.conf.dremio_log_dir.is_empty()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let conf = ctx.conf.clone();
            let logs_dir = ctx.layout.logs_dir();
            let queries_dir = ctx.layout.queries_dir();
            tokio::task::spawn_blocking(move || collect_all(&conf, &logs_dir, &queries_dir)).await?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn glob_patterns() {
        let re = glob_to_regex("gc*.log*").unwrap();
        assert!(re.is_match("gc.log"));
        assert!(re.is_match("gc-2024.log.3.current"));
        assert!(!re.is_match("server.log"));
        let re = glob_to_regex("a.b?").unwrap();
        assert!(re.is_match("a.bc"));
        assert!(!re.is_match("axbc"));
    }

    #[test]
    fn prefixes_follow_toggles() {
        let mut conf = CaptureConf::default();
        conf.disable_log_captures();
        assert!(enabled_prefixes(&conf).is_empty());
        conf.collect_audit_log = true;
        assert_eq!(enabled_prefixes(&conf), vec!["audit.json"]);
    }

    #[test]
    fn selects_by_name_and_age() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["server.log", "server.log.2024-01-01.gz", "access.log", "other.txt"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        fs::create_dir(dir.path().join("archive")).unwrap();
        fs::write(dir.path().join("archive").join("server.log.1"), "old").unwrap();

        let files = select_with_archive(dir.path(), |n| n.starts_with("server.log"), cutoff(7));
        assert_eq!(names(&files), vec!["server.log", "server.log.2024-01-01.gz", "server.log.1"]);

        let future = SystemTime::now() + Duration::from_secs(3600);
        assert!(select_files(dir.path(), |_| true, future).is_empty());
    }

    #[test]
    fn collects_into_node_dirs() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(src.path().join("server.log"), "s").unwrap();
        fs::write(src.path().join("queries.json"), "{}").unwrap();
        fs::write(src.path().join("gc.log.0"), "gc").unwrap();
        fs::write(src.path().join("hs_err_pid42.log"), "crash").unwrap();

        let conf = CaptureConf {
            dremio_log_dir: src.path().to_string_lossy().into_owned(),
            dremio_gclogs_dir: src.path().to_string_lossy().into_owned(),
            collect_hs_err_files: true,
            ..CaptureConf::default()
        };
        let logs = out.path().join("logs");
        let queries = out.path().join("queries");
        collect_all(&conf, &logs, &queries).unwrap();

        assert!(logs.join("server.log").is_file());
        assert!(logs.join("gc.log.0").is_file());
        assert!(logs.join("hs_err_pid42.log").is_file());
        assert!(queries.join("queries.json").is_file());
        assert!(!logs.join("queries.json").exists());
    }
}
