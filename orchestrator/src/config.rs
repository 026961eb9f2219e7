use crate::transport::{
    KubectlOptions,
    NodeRole,
    SshOptions,
};
use chrono::{
    DateTime,
    Utc,
};
use ddc_config::{
    CaptureConf,
    CollectArgs,
};
use eyre::{
    bail,
    eyre,
    Context as _,
    Result,
};
use sha1::{
    Digest as _,
    Sha1,
};
use std::path::{
    Path,
    PathBuf,
};

pub const REMOTE_BINARY: &str = "ddc";
pub const REMOTE_YAML: &str = "ddc.yaml";
pub const REMOTE_PID_FILE: &str = "ddc.pid";

#[derive(Debug, Clone)]
pub enum TransportKind {
    Ssh(SshOptions),
    Kubectl(KubectlOptions),
}

/// Everything one driver run needs, settled before any node is contacted.
#[derive(Clone, derive_more::Debug)]
pub struct RunPlan {
    pub conf: CaptureConf,
    pub transport: TransportKind,
    #[debug(skip)]
    pub pat: Option<String>,
    pub transfer_dir: String,
    pub collector_binary: PathBuf,
    pub output_file: PathBuf,
    pub transfer_threads: usize,
    pub split_bytes: Option<u64>,
    pub disable_kubectl: bool,
}

impl RunPlan {
    /// Validates the transport flags and settles the run's paths.
    /// `namespace` is the explicit or detected Kubernetes namespace.
    pub fn from_args(args: &CollectArgs, conf: CaptureConf, pat: Option<String>, namespace: Option<String>) -> Result<Self> {
        let has_hosts = !args.coordinator.is_empty() || !args.executors.is_empty();
        let transport = match (namespace, has_hosts) {
            (Some(_), true) => bail!("pass either ssh hosts (--coordinator/--executors) or --namespace, not both"),
            (Some(namespace), false) => {
                let kubectl = which::which("kubectl").wrap_err("kubectl is required with --namespace but was not found on PATH")?;
                TransportKind::Kubectl(KubectlOptions {
                    kubectl,
                    namespace,
                    label_selector: args.label_selector.clone(),
                    context: args.kube_context.clone(),
                })
            },
            (None, true) => {
                let user = args
                    .ssh_user
                    .clone()
                    .ok_or_else(|| eyre!("--ssh-user is required when collecting over ssh"))?;
                let key = args
                    .ssh_key
                    .clone()
                    .ok_or_else(|| eyre!("--ssh-key is required when collecting over ssh"))?;
                if !key.is_file() {
                    bail!("ssh key {} does not exist", key.display());
                }
                if args.coordinator.is_empty() {
                    bail!("at least one --coordinator is required");
                }
                TransportKind::Ssh(SshOptions {
                    user,
                    key,
                    sudo_user: args.sudo_user.clone().filter(|u| !u.trim().is_empty()),
                    coordinators: args.coordinator.clone(),
                    executors: args.executors.clone(),
                })
            },
            (None, false) => bail!(
                "no nodes to collect from: use --coordinator/--executors with --ssh-user and --ssh-key, \
                 or --namespace (or --detect-namespace) for Kubernetes"
            ),
        };

        if args.transfer_threads == 0 {
            bail!("--transfer-threads must be at least 1");
        }
        let transfer_dir = args.transfer_dir.trim_end_matches('/').to_string();
        if !transfer_dir.starts_with('/') {
            bail!("--transfer-dir must be an absolute path on the nodes, got '{}'", args.transfer_dir);
        }
        let collector_binary = match &args.collector_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().wrap_err("failed to locate the running executable")?,
        };
        if !collector_binary.is_file() {
            bail!("collector binary {} does not exist", collector_binary.display());
        }

        Ok(Self {
            split_bytes: conf.archive_split_bytes(),
            conf,
            transport,
            pat,
            transfer_dir,
            collector_binary,
            output_file: args.output_file.clone(),
            transfer_threads: args.transfer_threads,
            disable_kubectl: args.disable_kubectl,
        })
    }

    pub fn is_kubernetes(&self) -> bool {
        matches!(self.transport, TransportKind::Kubectl(_))
    }

    fn remote(&self, name: &str) -> String {
        format!("{}/{name}", self.transfer_dir)
    }

    pub fn remote_binary(&self) -> String {
        self.remote(REMOTE_BINARY)
    }

    pub fn remote_yaml(&self) -> String {
        self.remote(REMOTE_YAML)
    }

    pub fn remote_pid_file(&self) -> String {
        self.remote(REMOTE_PID_FILE)
    }

    pub fn remote_tarball(&self, hostname: &str) -> String {
        self.remote(&format!("{hostname}.tar.gz"))
    }

    /// Command line of the collector on a node. The token never appears in
    /// it: coordinators read it from stdin, executors skip REST captures.
    pub fn collector_argv(&self, role: NodeRole) -> Vec<String> {
        let mut argv = vec![
            self.remote_binary(),
            "local-collect".to_string(),
            "--ddc-yaml".to_string(),
            self.remote_yaml(),
            "--tarball-out-dir".to_string(),
            self.transfer_dir.clone(),
            "--pid-file".to_string(),
            self.remote_pid_file(),
        ];
        match role {
            NodeRole::Coordinator if self.pat.is_some() => argv.push("--pat-stdin".to_string()),
            NodeRole::Coordinator => {},
            NodeRole::Executor => argv.push("--disable-rest-api".to_string()),
        }
        argv
    }

    /// Directory that holds the output file, the run log and the pid lock.
    pub fn output_dir(&self) -> PathBuf {
        match self.output_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Name of the directory inside the archive that holds every node's files.
pub fn staging_name(at: DateTime<Utc>) -> String {
    format!("{}-DDC", at.format("%Y%m%dT%H%M%S"))
}

pub fn file_sha1(path: &Path) -> Result<String> {
    let content = std::fs::read(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha1::new();
    hasher.update(content);
    Ok(hasher.finalize().iter().fold(String::new(), |mut acc, b| {
        acc.push_str(&format!("{b:02x}"));
        acc
    }))
}
