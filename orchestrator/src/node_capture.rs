//! One worker per node: push the collector, run it, pull its tarball back.

use crate::{
    config::RunPlan,
    error::NodeError,
    status::{
        Phase,
        StatusModel,
    },
    summary::FailedFile,
    transport::{
        ExecOptions,
        LineSink,
        NodeRole,
        Transport,
    },
};
use ddc_collector::{
    archive,
    ShutdownHook,
};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};
use tokio::sync::Semaphore;

/// Local copies of what gets pushed to every node.
#[derive(Debug, Clone)]
pub struct InstallBundle {
    pub binary: PathBuf,
    pub binary_sha1: String,
    pub yaml: PathBuf,
}

/// State shared by all node workers of a run.
#[derive(Clone, derive_more::Debug)]
pub struct NodeCapture {
    #[debug(skip)]
    pub transport: Arc<dyn Transport>,
    pub plan: Arc<RunPlan>,
    pub status: StatusModel,
    pub hook: ShutdownHook,
    pub install: InstallBundle,
    /// Where pulled tarballs land before extraction.
    pub downloads: PathBuf,
    /// Extraction target; every node's tree merges here.
    pub staging: PathBuf,
    pub transfers: Arc<Semaphore>,
    pub extract_lock: Arc<tokio::sync::Mutex<()>>,
    pub failed_files: Arc<Mutex<Vec<FailedFile>>>,
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl NodeCapture {
    fn phase(&self, node: &str, phase: Phase) {
        if let Err(err) = self.status.update_node(node, phase, None) {
            debug!("{err}");
        }
    }

    fn check_cancelled(&self) -> Result<(), NodeError> {
        if self.hook.is_cancelled() {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs the whole lifecycle for `node`, recording the outcome in the status.
    pub async fn run(&self, node: String, role: NodeRole) {
        match self.capture(&node, role).await {
            Ok(()) => info!(node, "node collection transferred"),
            Err(err) if err.is_cancelled() || self.hook.is_cancelled() => {
                info!(node, "node collection cancelled");
                self.phase(&node, Phase::Cancelled);
            },
            Err(err) => {
                let message = err.to_string();
                warn!(node, "node collection failed: {message}");
                if let Err(err) = self.status.update_node(&node, Phase::Failed, Some(message.clone())) {
                    debug!("{err}");
                }
                self.status.warn(format!("{node}: {message}"));
                self.failed_files.lock().unwrap_or_else(PoisonError::into_inner).push(FailedFile {
                    path: node.clone(),
                    err: message,
                });
            },
        }
    }

    async fn capture(&self, node: &str, role: NodeRole) -> Result<(), NodeError> {
        let plan = &self.plan;
        let t = self.transport.as_ref();

        self.phase(node, Phase::PreparingRemoteDir);
        t.exec(node, &argv(&["mkdir", "-p", &plan.transfer_dir]), ExecOptions::default()).await?;

        self.phase(node, Phase::PushingBinary);
        let remote_binary = plan.remote_binary();
        if self.binary_is_current(node, &remote_binary).await {
            debug!(node, "collector binary already present");
        } else {
            t.copy_to(node, &self.install.binary, &remote_binary).await?;
        }

        self.phase(node, Phase::PushingConfig);
        t.copy_to(node, &self.install.yaml, &plan.remote_yaml()).await?;
        t.exec(node, &argv(&["chmod", "+x", &remote_binary]), ExecOptions::default()).await?;

        let pid_file = plan.remote_pid_file();
        t.register_remote_pid(node, &pid_file);
        self.status.set_remote_pid_file(node, &pid_file);

        self.phase(node, Phase::Collecting);
        let collector = plan.collector_argv(role);
        let label = node.to_string();
        let sink: LineSink = Arc::new(move |line: &str| debug!(node = %label, "{line}"));
        let mut opts = ExecOptions::default().with_sink(sink);
        if role == NodeRole::Coordinator {
            if let Some(pat) = &plan.pat {
                opts = opts.with_stdin(format!("{pat}\n"));
            }
        }
        t.exec(node, &collector, opts).await?;
        self.check_cancelled()?;

        let hostname = t
            .exec(node, &argv(&["cat", "/proc/sys/kernel/hostname"]), ExecOptions::default())
            .await?
            .trim()
            .to_string();
        if hostname.is_empty() {
            return Err(NodeError::Local(format!("{node} reported an empty hostname")));
        }

        self.phase(node, Phase::AwaitingTransfer);
        let _permit = tokio::select! {
            biased;
            _ = self.hook.cancelled() => return Err(NodeError::Cancelled),
            permit = self.transfers.clone().acquire_owned() => {
                permit.map_err(|_| NodeError::Local("transfer pool closed".to_string()))?
            },
        };

        self.phase(node, Phase::Transferring);
        let remote_tarball = plan.remote_tarball(&hostname);
        let local = self.downloads.join(format!("{node}-{hostname}.tar.gz"));
        let cleanup = local.clone();
        self.hook.add_priority_cancel(format!("remove {node} tarball"), move || async move {
            if let Err(err) = tokio::fs::remove_file(&cleanup).await {
                debug!(path = %cleanup.display(), "partial tarball not removed: {err}");
            }
        });
        t.copy_from(node, &remote_tarball, &local).await?;
        self.check_cancelled()?;

        let bytes = {
            let _serial = self.extract_lock.lock().await;
            let (tarball, staging) = (local.clone(), self.staging.clone());
            tokio::task::spawn_blocking(move || archive::extract(&tarball, &staging, None))
                .await
                .map_err(|err| NodeError::Local(format!("extraction task failed: {err}")))?
                .map_err(|source| NodeError::Extract {
                    path: local.clone(),
                    source,
                })?
        };
        debug!(node, bytes, "tarball extracted");
        if let Err(err) = tokio::fs::remove_file(&local).await {
            debug!(node, "tarball not removed: {err}");
        }
        if let Err(err) = t.exec(node, &argv(&["rm", "-f", &remote_tarball]), ExecOptions::default()).await {
            debug!(node, "remote tarball not removed: {err}");
        }

        self.check_cancelled()?;
        self.phase(node, Phase::Completed);
        Ok(())
    }

    /// Whether the node already holds this exact collector binary.
    async fn binary_is_current(&self, node: &str, remote_binary: &str) -> bool {
        match self
            .transport
            .exec(node, &argv(&["sha1sum", remote_binary]), ExecOptions::default())
            .await
        {
            Ok(out) => out.split_whitespace().next() == Some(self.install.binary_sha1.as_str()),
            Err(_) => false,
        }
    }
}
