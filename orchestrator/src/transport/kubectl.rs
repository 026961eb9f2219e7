use super::{
    cancel_registered,
    local_arg,
    run_child,
    ExecOptions,
    NodeRole,
    Transport,
    TransportFuture,
    TransportSession,
};
use crate::error::TransportError;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{
        Path,
        PathBuf,
    },
    process::Stdio,
    sync::{
        Mutex,
        PoisonError,
    },
};
use tokio::{
    io::{
        AsyncReadExt as _,
        AsyncWriteExt as _,
    },
    process::Command,
    sync::OnceCell,
};
use tokio_util::sync::CancellationToken;

const COPY_RETRIES: u32 = 50;
/// Host label used for kubectl calls that are not bound to a pod.
pub const CLUSTER_HOST: &str = "kubectl";

#[derive(Debug, Clone)]
pub struct KubectlOptions {
    pub kubectl: PathBuf,
    pub namespace: String,
    pub label_selector: String,
    pub context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMeta,
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
}

/// Role of a pod judged by the name of its first container.
pub fn classify(container: &str) -> Option<NodeRole> {
    if container.contains("coordinator") {
        Some(NodeRole::Coordinator)
    } else if container == "dremio-executor" {
        Some(NodeRole::Executor)
    } else {
        None
    }
}

/// Pod name to first container name, for every pod `pods_json` lists.
pub fn first_containers(pods_json: &str) -> Result<Vec<(String, String)>, TransportError> {
    let list: PodList = serde_json::from_str(pods_json)
        .map_err(|err| TransportError::Discovery(format!("unreadable pod list: {err}")))?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|pod| {
            let container = pod.spec.containers.into_iter().next()?;
            Some((pod.metadata.name, container.name))
        })
        .collect())
}

/// Runs commands in the first container of every pod through `kubectl exec`.
#[derive(Debug)]
pub struct KubectlTransport {
    opts: KubectlOptions,
    session: TransportSession,
    containers: Mutex<HashMap<String, String>>,
    retries_supported: OnceCell<bool>,
}

impl KubectlTransport {
    pub fn new(opts: KubectlOptions, token: CancellationToken) -> Self {
        Self {
            opts,
            session: TransportSession::new(token),
            containers: Default::default(),
            retries_supported: OnceCell::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.opts.namespace
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.opts.kubectl);
        if let Some(context) = &self.opts.context {
            cmd.arg("--context").arg(context);
        }
        cmd.arg("-n").arg(&self.opts.namespace);
        cmd
    }

    /// Runs kubectl itself with `args`, for calls that are not bound to a pod.
    pub async fn kubectl(&self, args: &[String], opts: ExecOptions) -> Result<String, TransportError> {
        let mut cmd = self.command();
        cmd.args(args);
        run_child(CLUSTER_HOST, cmd, args, &opts, &self.session.token_for(&opts)).await
    }

    async fn pods(&self) -> Result<Vec<(String, String)>, TransportError> {
        let args = to_args(&["get", "pods", "-l", &self.opts.label_selector, "-o", "json"]);
        let out = self
            .kubectl(&args, ExecOptions::default())
            .await
            .map_err(|err| TransportError::Discovery(format!("listing pods failed: {err}")))?;
        let pods = first_containers(&out)?;
        let mut containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        for (pod, container) in &pods {
            containers.insert(pod.clone(), container.clone());
        }
        Ok(pods)
    }

    async fn by_role(&self, role: NodeRole) -> Result<Vec<String>, TransportError> {
        Ok(self
            .pods()
            .await?
            .into_iter()
            .filter(|(_, container)| classify(container) == Some(role))
            .map(|(pod, _)| pod)
            .collect())
    }

    async fn container(&self, pod: &str) -> Result<String, TransportError> {
        let cached = self.containers.lock().unwrap_or_else(PoisonError::into_inner).get(pod).cloned();
        if let Some(container) = cached {
            return Ok(container);
        }
        let args = to_args(&["get", "pod", pod, "-o", "jsonpath={.spec.containers[0].name}"]);
        let container = self.kubectl(&args, ExecOptions::default()).await?.trim().to_string();
        self.containers.lock().unwrap_or_else(PoisonError::into_inner).insert(pod.to_string(), container.clone());
        Ok(container)
    }

    fn exec_args(&self, pod: &str, container: &str, interactive: bool, argv: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".into());
        }
        args.extend(["-c".to_string(), container.to_string(), pod.to_string(), "--".to_string()]);
        args.extend(argv.iter().cloned());
        args
    }

    /// Whether `kubectl cp` accepts `--retries`.
    async fn retries_supported(&self) -> bool {
        *self
            .retries_supported
            .get_or_init(|| async {
                let help = self.kubectl(&to_args(&["cp", "--help"]), ExecOptions::default()).await;
                let supported = help.map(|out| out.contains("--retries")).unwrap_or(false);
                debug!(supported, "kubectl cp retry flag");
                supported
            })
            .await
    }

    fn copy_error(host: &str, from: &str, to: &str, reason: impl ToString) -> TransportError {
        TransportError::Copy {
            host: host.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn copy_with_cp(&self, pod: &str, container: &str, remote: &str, local: &Path) -> Result<(), TransportError> {
        let local = local_arg(local);
        let args = vec![
            "cp".to_string(),
            format!("--retries={COPY_RETRIES}"),
            "-c".to_string(),
            container.to_string(),
            format!("{pod}:{remote}"),
            local.clone(),
        ];
        self.kubectl(&args, ExecOptions::default()).await.map(|_| ()).map_err(|err| match err {
            TransportError::Cancelled => err,
            other => Self::copy_error(pod, remote, &local, other),
        })
    }

    /// `tar cf -` in the container, unpacked locally.
    async fn copy_with_tar(&self, pod: &str, container: &str, remote: &str, local: &Path) -> Result<(), TransportError> {
        let (dir, name) = split_remote(remote);
        let argv = to_args(&["tar", "cf", "-", "-C", dir, name]);
        let mut cmd = self.command();
        cmd.args(self.exec_args(pod, container, false, &argv));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let scratch = temp_dir::TempDir::with_prefix("ddc-kubectl-cp").map_err(|err| Self::copy_error(pod, remote, "", err))?;
        let tar_path = scratch.child("stream.tar");
        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: self.opts.kubectl.display().to_string(),
            source,
        })?;
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Self::copy_error(pod, remote, "", "kubectl gave no output pipes"));
        };
        let work = async {
            let mut file = tokio::fs::File::create(&tar_path).await?;
            let mut errors = String::new();
            let (copied, _) = tokio::join!(tokio::io::copy(&mut stdout, &mut file), stderr.read_to_string(&mut errors));
            copied?;
            file.flush().await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, errors))
        };
        let token = self.session.token_for(&ExecOptions::default());
        let (status, errors) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            done = work => done.map_err(|err| Self::copy_error(pod, remote, &tar_path.display().to_string(), err))?,
        };
        if !status.success() {
            return Err(Self::copy_error(pod, remote, &local.display().to_string(), errors.trim()));
        }

        let dest = local.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_single(&tar_path, &dest))
            .await
            .map_err(|err| Self::copy_error(pod, remote, &local.display().to_string(), err))?
            .map_err(|err| Self::copy_error(pod, remote, &local.display().to_string(), err))
    }
}

fn to_args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn split_remote(remote: &str) -> (&str, &str) {
    match remote.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", remote),
    }
}

/// Writes the first regular file of the tar at `tar_path` to `dest`.
fn unpack_single(tar_path: &Path, dest: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(std::fs::File::open(tar_path)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            entry.unpack(dest)?;
            return Ok(());
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::NotFound, "stream held no file"))
}

/// A tar holding `local` under `name`, with its mode kept.
fn single_file_tar(local: &Path, name: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut file = std::fs::File::open(local)?;
    builder.append_file(name, &mut file)?;
    builder.into_inner()
}

impl Transport for KubectlTransport {
    fn name(&self) -> &'static str {
        "kubectl"
    }

    fn discover_coordinators(&self) -> TransportFuture<'_, Vec<String>> {
        Box::pin(self.by_role(NodeRole::Coordinator))
    }

    fn discover_executors(&self) -> TransportFuture<'_, Vec<String>> {
        Box::pin(self.by_role(NodeRole::Executor))
    }

    fn exec<'a>(&'a self, host: &'a str, argv: &'a [String], opts: ExecOptions) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let container = self.container(host).await?;
            let mut cmd = self.command();
            cmd.args(self.exec_args(host, &container, opts.stdin.is_some(), argv));
            run_child(host, cmd, argv, &opts, &self.session.token_for(&opts)).await
        })
    }

    fn copy_to<'a>(&'a self, host: &'a str, local: &'a Path, remote: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let (dir, name) = split_remote(remote);
            let path = local.to_path_buf();
            let entry = name.to_string();
            let payload = tokio::task::spawn_blocking(move || single_file_tar(&path, &entry))
                .await
                .map_err(|err| Self::copy_error(host, &local_arg(local), remote, err))?
                .map_err(|err| Self::copy_error(host, &local_arg(local), remote, err))?;
            let argv = to_args(&["tar", "xf", "-", "-C", dir]);
            match self.exec(host, &argv, ExecOptions::default().with_stdin(payload)).await {
                Ok(_) => Ok(()),
                Err(TransportError::Cancelled) => Err(TransportError::Cancelled),
                Err(err) => Err(Self::copy_error(host, &local_arg(local), remote, err)),
            }
        })
    }

    fn copy_from<'a>(&'a self, host: &'a str, remote: &'a str, local: &'a Path) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let container = self.container(host).await?;
            if self.retries_supported().await {
                self.copy_with_cp(host, &container, remote, local).await
            } else {
                self.copy_with_tar(host, &container, remote, local).await
            }
        })
    }

    fn register_remote_pid(&self, host: &str, pid_file: &str) {
        self.session.register(host, pid_file);
    }

    fn cancel_all(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let stopped = cancel_registered(self, self.session.registered()).await;
            debug!(stopped, "kubectl cancel finished");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PODS: &str = r#"{
        "items": [
            {"metadata": {"name": "dremio-master-0"}, "spec": {"containers": [{"name": "dremio-master-coordinator"}, {"name": "sidecar"}]}},
            {"metadata": {"name": "dremio-executor-0"}, "spec": {"containers": [{"name": "dremio-executor"}]}},
            {"metadata": {"name": "zk-0"}, "spec": {"containers": [{"name": "zookeeper"}]}},
            {"metadata": {"name": "empty"}, "spec": {"containers": []}}
        ]
    }"#;

    #[test]
    fn pods_are_classified_by_first_container() {
        let pods = first_containers(PODS).unwrap();
        assert_eq!(pods.len(), 3);
        let roles: Vec<_> = pods.iter().map(|(pod, c)| (pod.as_str(), classify(c))).collect();
        assert_eq!(
            roles,
            vec![
                ("dremio-master-0", Some(NodeRole::Coordinator)),
                ("dremio-executor-0", Some(NodeRole::Executor)),
                ("zk-0", None),
            ]
        );
        assert_eq!(classify("dremio-executor-extra"), None);
    }

    #[test]
    fn bad_pod_list_is_a_discovery_error() {
        assert!(matches!(first_containers("not json"), Err(TransportError::Discovery(_))));
    }

    #[test]
    fn remote_split() {
        assert_eq!(split_remote("/tmp/ddc/node.tar.gz"), ("/tmp/ddc", "node.tar.gz"));
        assert_eq!(split_remote("/ddc"), ("/", "ddc"));
        assert_eq!(split_remote("ddc"), (".", "ddc"));
    }

    #[test]
    fn exec_argv_layout() {
        let t = KubectlTransport::new(
            KubectlOptions {
                kubectl: "kubectl".into(),
                namespace: "default".into(),
                label_selector: "role=dremio-cluster-pod".into(),
                context: None,
            },
            CancellationToken::new(),
        );
        let args = t.exec_args("pod-0", "dremio-executor", true, &to_args(&["ls", "/"]));
        assert_eq!(args, to_args(&["exec", "-i", "-c", "dremio-executor", "pod-0", "--", "ls", "/"]));
    }

    #[test]
    fn tar_stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("ddc");
        std::fs::write(&src, b"binary").unwrap();
        let tar = single_file_tar(&src, "ddc-bin").unwrap();
        let tar_path = dir.path().join("s.tar");
        std::fs::write(&tar_path, tar).unwrap();
        let dest = dir.path().join("out");
        unpack_single(&tar_path, &dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"binary");
    }
}
