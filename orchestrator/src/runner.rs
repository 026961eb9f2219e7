use crate::{
    config::{
        file_sha1,
        staging_name,
        RunPlan,
        TransportKind,
        REMOTE_BINARY,
        REMOTE_YAML,
    },
    k8s_resources,
    node_capture::{
        InstallBundle,
        NodeCapture,
    },
    preflight,
    status::{
        NodeResult,
        StatusModel,
    },
    summary::SummaryBundle,
    transport::{
        discover_nodes,
        KubectlTransport,
        SshTransport,
        Transport,
    },
};
use chrono::Utc;
use ddc_collector::{
    archive,
    pidfile::PidLock,
    ShutdownHook,
};
use eyre::{
    bail,
    Context as _,
    Result,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        PoisonError,
    },
};
use tokio::{
    sync::Semaphore,
    task::JoinSet,
};

pub const LOCK_FILE: &str = "ddc.pid";
pub const DRIVER_LOG_IN_BUNDLE: &str = "ddc-driver.log";

/// Drives one collection across the cluster.
#[derive(derive_more::Debug)]
pub struct Orchestrator {
    plan: Arc<RunPlan>,
    #[debug(skip)]
    transport: Arc<dyn Transport>,
    kubectl: Option<Arc<KubectlTransport>>,
    status: StatusModel,
    hook: ShutdownHook,
    driver_log: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(plan: RunPlan, status: StatusModel, hook: ShutdownHook, driver_log: Option<PathBuf>) -> Self {
        let (transport, kubectl) = match &plan.transport {
            TransportKind::Ssh(opts) => {
                let ssh: Arc<dyn Transport> = Arc::new(SshTransport::new(opts.clone(), hook.token()));
                (ssh, None)
            },
            TransportKind::Kubectl(opts) => {
                let kubectl = Arc::new(KubectlTransport::new(opts.clone(), hook.token()));
                let transport: Arc<dyn Transport> = kubectl.clone();
                (transport, Some(kubectl))
            },
        };
        Self {
            plan: Arc::new(plan),
            transport,
            kubectl,
            status,
            hook,
            driver_log,
        }
    }

    /// Uses `transport` instead of the one the plan names.
    pub fn with_transport(plan: RunPlan, transport: Arc<dyn Transport>, status: StatusModel, hook: ShutdownHook) -> Self {
        Self {
            plan: Arc::new(plan),
            transport,
            kubectl: None,
            status,
            hook,
            driver_log: None,
        }
    }

    pub fn status(&self) -> &StatusModel {
        &self.status
    }

    /// Free space and the run lock. The lock is released as a final step.
    fn preflight(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir).wrap_err_with(|| format!("failed to create {}", output_dir.display()))?;
        preflight::check_free_space(output_dir, self.plan.conf.min_free_space_gb, self.plan.conf.disable_free_space_check)?;
        let lock = PidLock::acquire(output_dir.join(LOCK_FILE))?;
        self.hook.add_final_steps("release run lock", move || async move { lock.release() });
        Ok(())
    }

    /// Binary and YAML copied into `dir`, ready to push.
    fn stage_install(&self, dir: &Path) -> Result<InstallBundle> {
        std::fs::create_dir_all(dir)?;
        let binary = dir.join(REMOTE_BINARY);
        std::fs::copy(&self.plan.collector_binary, &binary)
            .wrap_err_with(|| format!("failed to stage {}", self.plan.collector_binary.display()))?;
        let yaml = dir.join(REMOTE_YAML);
        self.plan.conf.save(&yaml)?;
        Ok(InstallBundle {
            binary_sha1: file_sha1(&binary)?,
            binary,
            yaml,
        })
    }

    /// Runs the collection and returns the archive file(s) written.
    pub async fn run(&self) -> Result<Vec<PathBuf>> {
        let started = Utc::now();
        self.status.start();
        let output_dir = self.plan.output_dir();
        self.preflight(&output_dir)?;

        let work = output_dir.join(format!(".ddc-work-{}", started.format("%Y%m%dT%H%M%S")));
        let bundle = work.join("bundle");
        let ddc_dir = bundle.join(staging_name(started));
        let downloads = work.join("downloads");
        for dir in [&ddc_dir, &downloads] {
            std::fs::create_dir_all(dir).wrap_err_with(|| format!("failed to create {}", dir.display()))?;
        }
        let cleanup = work.clone();
        self.hook.add_final_steps("remove work directory", move || async move {
            if let Err(err) = tokio::fs::remove_dir_all(&cleanup).await {
                debug!(path = %cleanup.display(), "work directory not removed: {err}");
            }
        });
        let install = self.stage_install(&work.join("install"))?;

        let nodes = discover_nodes(self.transport.as_ref()).await?;
        for duplicate in &nodes.duplicates {
            self.status.warn(format!("{duplicate} is both coordinator and executor, collected once as coordinator"));
        }
        if nodes.total() == 0 {
            bail!(
                "no coordinators or executors found; check the host lists, or the namespace and --label-selector for Kubernetes"
            );
        }

        let transport = self.transport.clone();
        self.hook.add_priority_cancel("stop remote collectors", move || async move {
            if let Err(err) = transport.cancel_all().await {
                warn!("remote collectors not stopped: {err}");
            }
        });

        let capture = NodeCapture {
            transport: self.transport.clone(),
            plan: self.plan.clone(),
            status: self.status.clone(),
            hook: self.hook.clone(),
            install,
            downloads,
            staging: ddc_dir.clone(),
            transfers: Arc::new(Semaphore::new(self.plan.transfer_threads.max(1))),
            extract_lock: Default::default(),
            failed_files: Default::default(),
        };
        let nodes = nodes.with_roles();
        for (node, role) in &nodes {
            self.status.add_node(node, *role);
        }
        info!(nodes = nodes.len(), transport = self.transport.name(), "starting node collections");
        let mut workers = JoinSet::new();
        for (node, role) in nodes {
            let capture = capture.clone();
            workers.spawn(async move { capture.run(node, role).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("node worker crashed: {err}");
            }
        }

        if self.hook.is_cancelled() {
            bail!("collection cancelled, no archive written");
        }

        if let (Some(kubectl), false) = (&self.kubectl, self.plan.disable_kubectl) {
            if let Err(err) = k8s_resources::collect(kubectl, &ddc_dir.join("kubernetes")).await {
                self.status.warn(format!("kubernetes resources not captured: {err}"));
            }
        }
        if self.hook.is_cancelled() {
            bail!("collection cancelled, no archive written");
        }

        let snapshot = self.status.snapshot();
        let succeeded = snapshot.nodes.values().filter(|n| n.result == NodeResult::Success).count();
        if succeeded == 0 {
            bail!("no node collection succeeded, see the log for details");
        }

        if let Some(log) = self.driver_log.as_ref().filter(|l| l.is_file()) {
            if let Err(err) = std::fs::copy(log, ddc_dir.join(DRIVER_LOG_IN_BUNDLE)) {
                warn!("driver log not bundled: {err}");
            }
        }
        let failed_files = capture.failed_files.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let summary = SummaryBundle::build(
            &ddc_dir,
            &snapshot,
            failed_files,
            self.plan.conf.collections_enabled(),
            self.plan.conf.collections_disabled(),
        );
        summary.write(&bundle)?;
        info!(
            bytes = summary.total_bytes_collected,
            files = summary.collected_files.len(),
            succeeded,
            "collection summary written"
        );

        let outputs = self.write_archive(bundle).await?;
        self.status.update_runtime();
        self.status.update_tarball_dir(&output_dir.display().to_string());
        self.status.update_result(
            "success",
            outputs.iter().map(|p| p.display().to_string()).collect(),
        );
        Ok(outputs)
    }

    async fn write_archive(&self, bundle: PathBuf) -> Result<Vec<PathBuf>> {
        let output = self.plan.output_file.clone();
        let split = self.plan.split_bytes;
        tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            match split {
                None => {
                    archive::compact(&bundle, &output, |_| true)?;
                    Ok(vec![output])
                },
                Some(max) => {
                    let max = i64::try_from(max).unwrap_or(i64::MAX);
                    let parts = archive::compact_split(&bundle, &split_prefix(&output), max, |_| true)?;
                    if let [single] = parts.as_slice() {
                        std::fs::rename(single, &output)?;
                        return Ok(vec![output]);
                    }
                    Ok(parts)
                },
            }
        })
        .await?
        .wrap_err("failed to write the final archive")
    }
}

/// `diag.tgz` and `diag.tar.gz` both split into `diag.partNNN.tar.gz`.
pub fn split_prefix(output: &Path) -> PathBuf {
    let name = output.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name
        .strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))
        .unwrap_or(&name)
        .to_string();
    output.with_file_name(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_prefix_strips_archive_suffix() {
        assert_eq!(split_prefix(Path::new("out/diag.tgz")), PathBuf::from("out/diag"));
        assert_eq!(split_prefix(Path::new("diag.tar.gz")), PathBuf::from("diag"));
        assert_eq!(split_prefix(Path::new("bundle")), PathBuf::from("bundle"));
    }
}
