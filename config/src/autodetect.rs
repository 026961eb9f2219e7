//! Locates the running server JVM and the directories it uses.

use regex::Regex;
use std::{
    collections::HashMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

const DAEMON_CLASS: &str = "DremioDaemon";

lazy_static::lazy_static! {
    static ref HOCON_LOCAL: Regex = Regex::new(r#"^\s*(?:paths\.)?local\s*[:=]\s*(.+?)\s*,?\s*$"#).expect("local regex");
    static ref HOCON_DB: Regex = Regex::new(r#"^\s*(?:paths\.)?db\s*[:=]\s*(.+?)\s*,?\s*$"#).expect("db regex");
}

/// Server process facts read from procfs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JvmProcess {
    pub pid: i32,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Paths derived from the server process and its configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detected {
    pub pid: i32,
    pub home: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub conf_dir: Option<PathBuf>,
    pub gc_log_dir: Option<PathBuf>,
    pub gc_file_pattern: Option<String>,
    pub db_dir: Option<PathBuf>,
}

/// Procfs reader rooted at `root` so tests can fake a process table.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// First process whose command line names the server daemon class.
    pub fn find_server(&self) -> Option<JvmProcess> {
        let entries = fs::read_dir(&self.root).ok()?;
        let mut pids = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<i32>().ok()))
            .collect::<Vec<_>>();
        pids.sort_unstable();
        pids.into_iter().find_map(|pid| {
            let dir = self.root.join(pid.to_string());
            let args = split_nul(&fs::read(dir.join("cmdline")).ok()?);
            if !args.iter().any(|a| a.ends_with(DAEMON_CLASS)) {
                return None;
            }
            let env = fs::read(dir.join("environ"))
                .map(|raw| {
                    split_nul(&raw)
                        .into_iter()
                        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            Some(JvmProcess { pid, args, env })
        })
    }
}

fn split_nul(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

impl JvmProcess {
    /// Value of a `KEY=` style token, searching arguments before the environment.
    fn lookup(&self, prefix: &str) -> Option<String> {
        self.args
            .iter()
            .find_map(|a| a.strip_prefix(prefix).map(str::to_string))
            .or_else(|| {
                self.env
                    .get(prefix.trim_end_matches('='))
                    .cloned()
            })
            .filter(|v| !v.is_empty())
    }

    pub fn home(&self) -> Option<PathBuf> {
        self.lookup("DREMIO_HOME=")
            .or_else(|| self.lookup("-Ddremio.home="))
            .map(PathBuf::from)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.lookup("-Ddremio.log.path=")
            .or_else(|| self.lookup("DREMIO_LOG_DIR="))
            .map(PathBuf::from)
    }

    pub fn conf_dir(&self) -> Option<PathBuf> {
        self.lookup("DREMIO_CONF_DIR=")
            .map(PathBuf::from)
            .or_else(|| self.home().map(|h| h.join("conf")))
    }

    /// GC log directory and file glob from `-Xloggc:` or unified `-Xlog:gc...:file=`.
    pub fn gc_log(&self) -> Option<(PathBuf, String)> {
        let file = self.args.iter().find_map(|a| {
            if let Some(path) = a.strip_prefix("-Xloggc:") {
                return Some(path.to_string());
            }
            if a.starts_with("-Xlog:") {
                let start = a.find("file=")? + "file=".len();
                let rest = &a[start..];
                let end = rest.find(':').unwrap_or(rest.len());
                return Some(rest[..end].trim_matches('"').to_string());
            }
            None
        })?;
        let path = PathBuf::from(&file);
        let dir = path.parent()?.to_path_buf();
        let name = path.file_name()?.to_str()?;
        // %p/%t placeholders and rotation suffixes vary per run.
        let stem = name.split('%').next().unwrap_or(name).trim_end_matches(['.', '-', '_']);
        let stem = stem.split('.').next().unwrap_or(stem);
        Some((dir, format!("{stem}*.log*")))
    }
}

/// Reads `paths.db` out of a HOCON body, resolving `${DREMIO_HOME}` and
/// `${paths.local}`. Falls back to `<home>/data/db`.
pub fn parse_db_dir(conf: &str, home: &Path) -> PathBuf {
    let home_str = home.to_string_lossy();
    let substitute = |raw: &str, local: Option<&str>| {
        let mut value = raw.replace('"', "").replace("${DREMIO_HOME}", &home_str);
        if let Some(local) = local {
            value = value.replace("${paths.local}", local);
        }
        value
    };

    let mut local = None;
    let mut db = None;
    for line in conf.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.starts_with("//") {
            continue;
        }
        if let Some(c) = HOCON_LOCAL.captures(line) {
            local = Some(substitute(&c[1], None));
        } else if let Some(c) = HOCON_DB.captures(line) {
            db = Some(c[1].to_string());
        }
    }

    let default_local = format!("{home_str}/data");
    match (db, local) {
        (Some(db), local) => PathBuf::from(substitute(&db, Some(local.as_deref().unwrap_or(&default_local)))),
        (None, Some(local)) => PathBuf::from(local).join("db"),
        (None, None) => home.join("data").join("db"),
    }
}

/// Runs every detector against the live process table.
pub fn detect(procfs: &ProcFs) -> Detected {
    let Some(process) = procfs.find_server() else {
        debug!("no server process found");
        return Detected::default();
    };
    detect_from(&process)
}

pub fn detect_from(process: &JvmProcess) -> Detected {
    let home = process.home();
    let conf_dir = process.conf_dir();
    let (gc_log_dir, gc_file_pattern) = match process.gc_log() {
        Some((dir, pattern)) => (Some(dir), Some(pattern)),
        None => (None, None),
    };
    let db_dir = match (&home, &conf_dir) {
        (Some(home), Some(conf)) => match fs::read_to_string(conf.join("dremio.conf")) {
            Ok(body) => Some(parse_db_dir(&body, home)),
            Err(_) => Some(home.join("data").join("db")),
        },
        (Some(home), None) => Some(home.join("data").join("db")),
        _ => None,
    };
    let detected = Detected {
        pid: process.pid,
        log_dir: process.log_dir(),
        home,
        conf_dir,
        gc_log_dir,
        gc_file_pattern,
        db_dir,
    };
    debug!(?detected, "autodetected server paths");
    detected
}
