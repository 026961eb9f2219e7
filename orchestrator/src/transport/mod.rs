//! Remote execution and file copies over ssh or kubectl.

mod kubectl;
mod ssh;

pub use kubectl::{
    KubectlOptions,
    KubectlTransport,
};
pub use ssh::{
    SshOptions,
    SshTransport,
};

use crate::error::TransportError;
use ddc_config::redact;
use futures::future::join_all;
use std::{
    collections::BTreeMap,
    future::Future,
    path::Path,
    pin::Pin,
    process::Stdio,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};
use strum::Display;
use tokio::{
    io::{
        AsyncBufReadExt as _,
        AsyncRead,
        AsyncWriteExt as _,
        BufReader,
    },
    process::Command,
};
use tokio_util::sync::CancellationToken;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Receives every output line of a remote command as it arrives.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

pub const PID_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const KILL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Executor,
}

#[derive(Clone, Default, derive_more::Debug)]
pub struct ExecOptions {
    /// Keeps the command line out of the logs entirely.
    pub mask_secrets: bool,
    #[debug(skip)]
    pub stdin: Option<Vec<u8>>,
    #[debug(skip)]
    pub sink: Option<LineSink>,
    pub timeout: Option<Duration>,
    /// Not bound to the session's cancellation. Only for the cancel path itself.
    pub unbound: bool,
}

impl ExecOptions {
    pub fn with_stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn with_sink(mut self, sink: LineSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn masked(mut self) -> Self {
        self.mask_secrets = true;
        self
    }

    fn unbound(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            unbound: true,
            ..Self::default()
        }
    }
}

/// The capability set both transports provide.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn discover_coordinators(&self) -> TransportFuture<'_, Vec<String>>;

    fn discover_executors(&self) -> TransportFuture<'_, Vec<String>>;

    /// Runs `argv` on `host`; returns merged stdout and stderr once it exited.
    fn exec<'a>(&'a self, host: &'a str, argv: &'a [String], opts: ExecOptions) -> TransportFuture<'a, String>;

    fn copy_to<'a>(&'a self, host: &'a str, local: &'a Path, remote: &'a str) -> TransportFuture<'a, ()>;

    fn copy_from<'a>(&'a self, host: &'a str, remote: &'a str, local: &'a Path) -> TransportFuture<'a, ()>;

    /// Remembers where the collector on `host` writes its pid.
    fn register_remote_pid(&self, host: &str, pid_file: &str);

    /// Stops every registered remote collector.
    fn cancel_all(&self) -> TransportFuture<'_, ()>;
}

/// State shared by one transport instance for the whole run: its binding to
/// the run's cancellation and the registered remote pid files.
#[derive(Debug, Clone, Default)]
pub struct TransportSession {
    token: CancellationToken,
    pids: Arc<Mutex<BTreeMap<String, String>>>,
}

impl TransportSession {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            pids: Default::default(),
        }
    }

    pub fn token_for(&self, opts: &ExecOptions) -> CancellationToken {
        if opts.unbound {
            CancellationToken::new()
        } else {
            self.token.clone()
        }
    }

    pub fn register(&self, host: &str, pid_file: &str) {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner).insert(host.to_string(), pid_file.to_string());
    }

    pub fn registered(&self) -> Vec<(String, String)> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner).iter().map(|(h, p)| (h.clone(), p.clone())).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredNodes {
    pub coordinators: Vec<String>,
    pub executors: Vec<String>,
    /// Hosts reported in both roles; kept as coordinators.
    pub duplicates: Vec<String>,
}

impl DiscoveredNodes {
    pub fn total(&self) -> usize {
        self.coordinators.len() + self.executors.len()
    }

    pub fn with_roles(&self) -> Vec<(String, NodeRole)> {
        self.coordinators
            .iter()
            .map(|c| (c.clone(), NodeRole::Coordinator))
            .chain(self.executors.iter().map(|e| (e.clone(), NodeRole::Executor)))
            .collect()
    }
}

fn sorted_unique(nodes: Vec<String>) -> Vec<String> {
    let mut nodes: Vec<String> = nodes
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    nodes.sort();
    nodes.dedup();
    nodes
}

/// Sorts both lists, removes duplicates and drops executors that are also
/// coordinators.
pub fn dedup_nodes(coordinators: Vec<String>, executors: Vec<String>) -> DiscoveredNodes {
    let coordinators = sorted_unique(coordinators);
    let (duplicates, executors): (Vec<String>, Vec<String>) =
        sorted_unique(executors).into_iter().partition(|e| coordinators.contains(e));
    DiscoveredNodes {
        coordinators,
        executors,
        duplicates,
    }
}

pub async fn discover_nodes(transport: &dyn Transport) -> Result<DiscoveredNodes, TransportError> {
    let coordinators = transport.discover_coordinators().await?;
    let executors = transport.discover_executors().await?;
    let nodes = dedup_nodes(coordinators, executors);
    for node in &nodes.duplicates {
        warn!(node, "listed as coordinator and executor, collecting it as coordinator only");
    }
    info!(
        transport = transport.name(),
        coordinators = nodes.coordinators.len(),
        executors = nodes.executors.len(),
        "nodes discovered"
    );
    Ok(nodes)
}

/// Removes a leading `X:` so scp and kubectl do not read it as a remote host.
pub fn strip_drive_prefix(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        &path[2..]
    } else {
        path
    }
}

pub fn local_arg(path: &Path) -> String {
    strip_drive_prefix(&path.to_string_lossy()).replace('\\', "/")
}

/// Single-quotes `arg` for a POSIX shell unless it is plainly safe.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter().map(|a| shell_quote(a.as_ref())).collect::<Vec<_>>().join(" ")
}

fn describe(argv: &[String], opts: &ExecOptions) -> String {
    if opts.mask_secrets {
        "<masked command>".to_string()
    } else {
        redact::mask_args(argv).join(" ")
    }
}

async fn pump(reader: impl AsyncRead + Unpin, sink: Option<LineSink>) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = strip_ansi_escapes::strip_str(&line);
        if let Some(sink) = &sink {
            sink(&line);
        }
        out.push(line);
    }
    out
}

/// Runs a local child process (ssh, scp, kubectl) bound to `cancel`.
pub(crate) async fn run_child(
    host: &str,
    mut cmd: Command,
    argv: &[String],
    opts: &ExecOptions,
    cancel: &CancellationToken,
) -> Result<String, TransportError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(if opts.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(host, %program, command = %describe(argv, opts), "exec");
    let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
        program: program.clone(),
        source,
    })?;

    if let (Some(data), Some(mut stdin)) = (opts.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
            let _ = stdin.shutdown().await;
        });
    }
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let sink = opts.sink.clone();
    let work = async {
        let (out, err) = tokio::join!(
            async {
                match stdout {
                    Some(s) => pump(s, sink.clone()).await,
                    None => Vec::new(),
                }
            },
            async {
                match stderr {
                    Some(s) => pump(s, sink.clone()).await,
                    None => Vec::new(),
                }
            },
        );
        let status = child.wait().await;
        (out, err, status)
    };
    let timeout = async {
        match opts.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let (out, err, status) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        _ = timeout => return Err(TransportError::Timeout {
            host: host.to_string(),
            secs: opts.timeout.map(|t| t.as_secs()).unwrap_or_default(),
        }),
        done = work => done,
    };
    let mut output = out.join("\n");
    if !err.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&err.join("\n"));
    }
    let status = status.map_err(|source| TransportError::Spawn { program, source })?;
    if !status.success() {
        return Err(TransportError::Exec {
            host: host.to_string(),
            code: status.code(),
            output,
        });
    }
    Ok(output)
}

/// Reads every registered pid file and sends SIGTERM to the pid it names.
/// Each host gets at most [`PID_READ_TIMEOUT`] plus [`KILL_TIMEOUT`].
pub async fn cancel_registered(transport: &dyn Transport, registered: Vec<(String, String)>) -> usize {
    let kills = registered.iter().map(|(host, pid_file)| async move {
        let cat = vec!["cat".to_string(), pid_file.clone()];
        let pid = match transport.exec(host, &cat, ExecOptions::unbound(PID_READ_TIMEOUT)).await {
            Ok(out) => out.trim().parse::<i32>().ok(),
            Err(err) => {
                warn!(host, pid_file, "could not read the collector pid: {err}");
                None
            },
        };
        let Some(pid) = pid.filter(|p| *p > 0) else {
            return false;
        };
        let kill = vec!["kill".to_string(), "-15".to_string(), pid.to_string()];
        match transport.exec(host, &kill, ExecOptions::unbound(KILL_TIMEOUT)).await {
            Ok(_) => {
                info!(host, pid, "stopped remote collector");
                true
            },
            Err(err) => {
                warn!(host, pid, "could not stop remote collector: {err}");
                false
            },
        }
    });
    join_all(kills).await.into_iter().filter(|killed| *killed).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn coordinators_win_over_executors() {
        let nodes = dedup_nodes(strings(&["c2", "c1", "c1"]), strings(&["e2", "c1", "e1", " ", "e2"]));
        assert_eq!(nodes.coordinators, strings(&["c1", "c2"]));
        assert_eq!(nodes.executors, strings(&["e1", "e2"]));
        assert_eq!(nodes.duplicates, strings(&["c1"]));
        assert_eq!(nodes.total(), 4);
    }

    #[test]
    fn drive_prefix_is_stripped() {
        assert_eq!(strip_drive_prefix("C:/Users/me/ddc.yaml"), "/Users/me/ddc.yaml");
        assert_eq!(strip_drive_prefix("/tmp/ddc"), "/tmp/ddc");
        assert_eq!(strip_drive_prefix("host:/tmp"), "host:/tmp");
        assert_eq!(local_arg(Path::new("D:\\out\\n1.tar.gz")), "/out/n1.tar.gz");
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/tmp/ddc/ddc.yaml"), "/tmp/ddc/ddc.yaml");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_join(&["cat", "a b"]), "cat 'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn child_output_is_line_oriented() {
        let Ok(sh) = which::which("sh") else {
            return;
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: LineSink = Arc::new(move |line: &str| sink_seen.lock().unwrap().push(line.to_string()));
        let argv = strings(&["-c", "echo one; echo two; echo err >&2"]);
        let mut cmd = Command::new(&sh);
        cmd.args(&argv);
        let out = run_child("local", cmd, &argv, &ExecOptions::default().with_sink(sink), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "one\ntwo\nerr");
        let seen = seen.lock().unwrap().clone();
        let stdout_order: Vec<_> = seen.iter().filter(|l| *l != "err").cloned().collect();
        assert_eq!(stdout_order, strings(&["one", "two"]));
    }

    #[tokio::test]
    async fn child_failure_and_cancel() {
        let Ok(sh) = which::which("sh") else {
            return;
        };
        let argv = strings(&["-c", "echo nope; exit 3"]);
        let mut cmd = Command::new(&sh);
        cmd.args(&argv);
        let err = run_child("h", cmd, &argv, &ExecOptions::default(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Exec { code: Some(3), .. }));

        let argv = strings(&["-c", "sleep 30"]);
        let mut cmd = Command::new(&sh);
        cmd.args(&argv);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_child("h", cmd, &argv, &ExecOptions::default(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let Ok(cat) = which::which("cat") else {
            return;
        };
        let argv: Vec<String> = Vec::new();
        let out = run_child(
            "h",
            Command::new(cat),
            &argv,
            &ExecOptions::default().with_stdin("secret-line\n").masked(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out, "secret-line");
    }
}
