use crate::{
    layout::OutputLayout,
    process,
    rest::{
        ApiPaths,
        RestClient,
    },
    shutdown::ShutdownHook,
};
use ddc_config::CaptureConf;
use eyre::{
    OptionExt as _,
    Result,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};
use tokio_util::sync::CancellationToken;

/// Everything a capture job needs: the resolved configuration, where to write,
/// the REST client and the run's cancellation.
#[derive(derive_more::Debug)]
pub struct CaptureContext {
    pub conf: Arc<CaptureConf>,
    pub layout: OutputLayout,
    pub hook: ShutdownHook,
    pub paths: ApiPaths,
    #[debug(skip)]
    rest: Option<RestClient>,
    /// Set by the JFR start job, read by the stop job.
    pub jfr_started: Option<Instant>,
}

impl CaptureContext {
    pub fn new(conf: Arc<CaptureConf>, layout: OutputLayout, hook: ShutdownHook, rest: Option<RestClient>) -> Self {
        let project = conf.is_dremio_cloud.then_some(conf.dremio_cloud_project_id.as_str());
        let paths = ApiPaths::new(&conf.dremio_endpoint, project);
        Self {
            conf,
            layout,
            hook,
            paths,
            rest,
            jfr_started: None,
        }
    }

    pub fn node(&self) -> &str {
        self.layout.node()
    }

    pub fn pat(&self) -> &str {
        &self.conf.dremio_pat_token
    }

    pub fn rest(&self) -> Result<&RestClient> {
        self.rest.as_ref().ok_or_eyre("REST client is not available")
    }

    pub fn token(&self) -> CancellationToken {
        self.hook.child_token()
    }

    /// Child token that also fires after `duration`.
    pub fn deadline(&self, duration: Duration) -> CancellationToken {
        let token = self.hook.child_token();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {},
                _ = tokio::time::sleep(duration) => timer.cancel(),
            }
        });
        token
    }

    pub fn java_home(&self) -> Option<PathBuf> {
        std::env::var_os("JAVA_HOME").map(PathBuf::from)
    }

    /// `jcmd` for the server JVM, if both the pid and the tool are known.
    pub fn jcmd(&self) -> Result<(PathBuf, String)> {
        if !self.conf.pid_known() {
            eyre::bail!("server pid is unknown");
        }
        let jcmd = process::locate("jcmd", self.java_home().as_deref()).ok_or_eyre("jcmd not found on PATH or JAVA_HOME")?;
        Ok((jcmd, self.conf.dremio_pid.to_string()))
    }

    pub fn log_dir(&self) -> &Path {
        Path::new(&self.conf.dremio_log_dir)
    }
}
