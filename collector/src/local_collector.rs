use crate::{
    archive,
    context::CaptureContext,
    jobs,
    layout::OutputLayout,
    pidfile,
    pipeline::PipelineReport,
    rest::RestClient,
    shutdown::ShutdownHook,
};
use ddc_config::{
    redact,
    CaptureConf,
    ConfigResolver,
    LocalCollectArgs,
    ProcFs,
};
use eyre::{
    bail,
    Context as _,
    Result,
};
use std::{
    io::BufRead as _,
    path::PathBuf,
    sync::Arc,
};

/// Token from stdin when `from_stdin` is set, else the explicit value.
pub fn read_pat(from_stdin: bool, explicit: Option<&str>) -> Result<Option<String>> {
    if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).wrap_err("failed to read the token from stdin")?;
        let token = line.trim().to_string();
        return Ok((!token.is_empty()).then_some(token));
    }
    Ok(explicit.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string))
}

/// Resolves the node configuration from the side-loaded YAML, the CLI and
/// what can be detected about the local server.
pub fn resolve_conf(args: &LocalCollectArgs, pat: Option<&str>) -> Result<CaptureConf> {
    let mut overrides = args.overrides()?;
    if let Some(pat) = pat {
        overrides.set_str(redact::PAT_KEY, pat);
    }
    let yaml = args.ddc_yaml.is_file().then(|| args.ddc_yaml.clone());
    if yaml.is_none() {
        warn!(path = %args.ddc_yaml.display(), "configuration file not found, using defaults");
    }
    let conf = ConfigResolver::new(yaml, overrides).resolve_for_node(&ProcFs::default())?;
    Ok(conf)
}

/// Runs the node pipeline and packs its output into `<node>.tar.gz`.
#[derive(Debug)]
pub struct LocalCollector {
    conf: Arc<CaptureConf>,
    layout: OutputLayout,
    hook: ShutdownHook,
    pid_file: Option<PathBuf>,
}

impl LocalCollector {
    pub fn new(conf: CaptureConf, hook: ShutdownHook, pid_file: Option<PathBuf>) -> Self {
        let layout = OutputLayout::new(conf.output_dir(), conf.node_name.clone());
        Self {
            conf: Arc::new(conf),
            layout,
            hook,
            pid_file,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn tarball(&self) -> PathBuf {
        self.conf.tarball_out_dir().join(format!("{}.tar.gz", self.layout.node()))
    }

    /// Creates the output tree. Called before logging so the node log file can
    /// live inside it.
    pub fn prepare(&self) -> Result<()> {
        let root = self.layout.root().to_path_buf();
        if root.exists() {
            std::fs::remove_dir_all(&root).wrap_err_with(|| format!("failed to clear {}", root.display()))?;
        }
        self.layout
            .create_all()
            .wrap_err_with(|| format!("failed to create output tree under {}", root.display()))?;
        self.hook.add_final_steps("remove node output tree", move || async move {
            if let Err(err) = tokio::fs::remove_dir_all(&root).await {
                debug!(path = %root.display(), "output tree not removed: {err}");
            }
        });
        Ok(())
    }

    pub async fn run(&self) -> Result<PathBuf> {
        self.conf.log_resolved();
        info!(node = %self.layout.node(), enabled = ?self.conf.collections_enabled(), "starting node collection");
        debug!(disabled = ?self.conf.collections_disabled(), "skipped collections");

        if let Some(pid_file) = &self.pid_file {
            pidfile::write_pid(pid_file, std::process::id() as i32)?;
            let pid_file = pid_file.clone();
            self.hook.add_final_steps("remove collector pid file", move || async move {
                let _ = tokio::fs::remove_file(&pid_file).await;
            });
        }

        let rest = if self.conf.rest_enabled() {
            Some(RestClient::init(self.conf.allow_insecure_ssl, self.conf.rest_http_timeout)?.clone())
        } else {
            None
        };
        let mut ctx = CaptureContext::new(self.conf.clone(), self.layout.clone(), self.hook.clone(), rest);
        let report = jobs::node_pipeline().run(&mut ctx).await;
        log_report(&report);
        if report.cancelled || self.hook.is_cancelled() {
            bail!("collection cancelled on {}", self.layout.node());
        }

        self.pack().await
    }

    async fn pack(&self) -> Result<PathBuf> {
        let src = self.layout.root().to_path_buf();
        let dest = self.tarball();
        tokio::fs::create_dir_all(self.conf.tarball_out_dir()).await?;
        let out = dest.clone();
        tokio::task::spawn_blocking(move || archive::compact(&src, &out, |_| true))
            .await?
            .wrap_err("failed to pack the node tarball")?;
        info!(tarball = %dest.display(), "node collection packed");
        Ok(dest)
    }
}

fn log_report(report: &PipelineReport) {
    info!(
        completed = report.completed.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "pipeline finished"
    );
    for (job, err) in &report.failed {
        warn!(job, "{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn quiet_conf(out: &std::path::Path) -> CaptureConf {
        let mut conf = CaptureConf {
            tarball_out_dir: out.to_string_lossy().into_owned(),
            node_name: "node-1".into(),
            collect_os_config: false,
            collect_disk_usage: false,
            collect_dremio_configuration: false,
            collect_gc_logs: false,
            ..CaptureConf::default()
        };
        conf.disable_rest_captures();
        conf.disable_jvm_captures();
        conf.disable_log_captures();
        conf
    }

    #[tokio::test]
    async fn produces_node_tarball() {
        let out = tempfile::tempdir().unwrap();
        let hook = ShutdownHook::new();
        let pid_file = out.path().join("collector.pid");
        let collector = LocalCollector::new(quiet_conf(out.path()), hook.clone(), Some(pid_file.clone()));
        collector.prepare().unwrap();
        let tarball = collector.run().await.unwrap();
        assert_eq!(tarball, out.path().join("node-1.tar.gz"));
        assert!(pid_file.exists());

        let file = std::fs::File::open(&tarball).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n == "cluster-stats/node-1/cluster-stats.json"), "{names:?}");

        hook.cleanup().await;
        assert!(!pid_file.exists());
        assert!(!collector.layout().root().exists());
    }

    #[tokio::test]
    async fn cancelled_run_produces_nothing() {
        let out = tempfile::tempdir().unwrap();
        let hook = ShutdownHook::new();
        let collector = LocalCollector::new(quiet_conf(out.path()), hook.clone(), None);
        collector.prepare().unwrap();
        hook.cancel();
        assert!(collector.run().await.is_err());
        assert!(!collector.tarball().exists());
    }

    #[test]
    fn explicit_token_is_trimmed() {
        assert_eq!(read_pat(false, Some("  abc \n")).unwrap().as_deref(), Some("abc"));
        assert_eq!(read_pat(false, Some("   ")).unwrap(), None);
        assert_eq!(read_pat(false, None).unwrap(), None);
    }
}
