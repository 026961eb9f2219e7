use super::{
    cancel_registered,
    local_arg,
    run_child,
    shell_join,
    ExecOptions,
    Transport,
    TransportFuture,
    TransportSession,
};
use crate::error::TransportError;
use rand::{
    distr::Alphanumeric,
    Rng as _,
};
use std::path::{
    Path,
    PathBuf,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    pub user: String,
    pub key: PathBuf,
    pub sudo_user: Option<String>,
    pub coordinators: Vec<String>,
    pub executors: Vec<String>,
}

/// Runs commands with `ssh` and copies files with `scp`.
#[derive(Debug, Clone)]
pub struct SshTransport {
    opts: SshOptions,
    session: TransportSession,
}

impl SshTransport {
    pub fn new(opts: SshOptions, token: CancellationToken) -> Self {
        Self {
            opts,
            session: TransportSession::new(token),
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["-i".to_string(), local_arg(&self.opts.key)];
        for opt in [
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=error",
            "BatchMode=yes",
        ] {
            args.push("-o".into());
            args.push(opt.into());
        }
        args
    }

    fn login(&self, host: &str) -> String {
        if self.opts.user.is_empty() {
            host.to_string()
        } else {
            format!("{}@{host}", self.opts.user)
        }
    }

    fn with_sudo(&self, argv: &[String]) -> Vec<String> {
        match &self.opts.sudo_user {
            Some(user) => ["sudo".to_string(), "-u".to_string(), user.clone()]
                .into_iter()
                .chain(argv.iter().cloned())
                .collect(),
            None => argv.to_vec(),
        }
    }

    async fn ssh(&self, host: &str, argv: &[String], opts: &ExecOptions) -> Result<String, TransportError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.common_args()).arg(self.login(host)).arg(shell_join(argv));
        run_child(host, cmd, argv, opts, &self.session.token_for(opts)).await
    }

    async fn scp(&self, host: &str, from: String, to: String) -> Result<(), TransportError> {
        let mut cmd = Command::new("scp");
        cmd.args(self.common_args()).arg(&from).arg(&to);
        let argv = vec![from.clone(), to.clone()];
        run_child(host, cmd, &argv, &ExecOptions::default(), &self.session.token_for(&ExecOptions::default()))
            .await
            .map(|_| ())
            .map_err(|err| match err {
                TransportError::Cancelled => TransportError::Cancelled,
                other => TransportError::Copy {
                    host: host.to_string(),
                    from,
                    to,
                    reason: other.to_string(),
                },
            })
    }

    /// Creates a world-writable scratch directory owned by the login user.
    async fn scratch_dir(&self, host: &str) -> Result<String, TransportError> {
        let name: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        let dir = format!("/tmp/ddc-{name}");
        let opts = ExecOptions::default();
        self.ssh(host, &argv(&["mkdir", "-p", &dir]), &opts).await?;
        self.ssh(host, &argv(&["chmod", "777", &dir]), &opts).await?;
        Ok(dir)
    }

    async fn remove_scratch(&self, host: &str, dir: &str) {
        if let Err(err) = self.ssh(host, &argv(&["rm", "-rf", dir]), &ExecOptions::default()).await {
            debug!(host, dir, "scratch directory not removed: {err}");
        }
    }

    async fn sudo_copy_to(&self, host: &str, local: &Path, remote: &str) -> Result<(), TransportError> {
        let dir = self.scratch_dir(host).await?;
        let staged = format!("{dir}/{}", file_name(local));
        let result = async {
            self.scp(host, local_arg(local), format!("{}:{staged}", self.login(host))).await?;
            let opts = ExecOptions::default();
            self.ssh(host, &self.with_sudo(&argv(&["cp", &staged, remote])), &opts).await?;
            Ok::<_, TransportError>(())
        }
        .await;
        self.remove_scratch(host, &dir).await;
        result
    }

    async fn sudo_copy_from(&self, host: &str, remote: &str, local: &Path) -> Result<(), TransportError> {
        let dir = self.scratch_dir(host).await?;
        let staged = format!("{dir}/{}", file_name(Path::new(remote)));
        let result = async {
            let opts = ExecOptions::default();
            self.ssh(host, &self.with_sudo(&argv(&["cp", remote, &staged])), &opts).await?;
            self.ssh(host, &self.with_sudo(&argv(&["chmod", "644", &staged])), &opts).await?;
            self.scp(host, format!("{}:{staged}", self.login(host)), local_arg(local)).await
        }
        .await;
        self.remove_scratch(host, &dir).await;
        result
    }
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string())
}

impl Transport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn discover_coordinators(&self) -> TransportFuture<'_, Vec<String>> {
        Box::pin(async move {
            if self.opts.coordinators.iter().all(|c| c.trim().is_empty()) {
                return Err(TransportError::Discovery(
                    "no coordinator given, pass at least one host with --coordinator".to_string(),
                ));
            }
            Ok(self.opts.coordinators.clone())
        })
    }

    fn discover_executors(&self) -> TransportFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.opts.executors.clone()) })
    }

    fn exec<'a>(&'a self, host: &'a str, argv: &'a [String], opts: ExecOptions) -> TransportFuture<'a, String> {
        Box::pin(async move { self.ssh(host, &self.with_sudo(argv), &opts).await })
    }

    fn copy_to<'a>(&'a self, host: &'a str, local: &'a Path, remote: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.opts.sudo_user.is_some() {
                self.sudo_copy_to(host, local, remote).await
            } else {
                self.scp(host, local_arg(local), format!("{}:{remote}", self.login(host))).await
            }
        })
    }

    fn copy_from<'a>(&'a self, host: &'a str, remote: &'a str, local: &'a Path) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.opts.sudo_user.is_some() {
                self.sudo_copy_from(host, remote, local).await
            } else {
                self.scp(host, format!("{}:{remote}", self.login(host)), local_arg(local)).await
            }
        })
    }

    fn register_remote_pid(&self, host: &str, pid_file: &str) {
        self.session.register(host, pid_file);
    }

    fn cancel_all(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let stopped = cancel_registered(self, self.session.registered()).await;
            debug!(stopped, "ssh cancel finished");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transport(sudo: Option<&str>) -> SshTransport {
        SshTransport::new(
            SshOptions {
                user: "dremio".into(),
                key: PathBuf::from("/home/me/.ssh/id_rsa"),
                sudo_user: sudo.map(str::to_string),
                coordinators: vec!["c1".into()],
                executors: vec!["e1".into(), "e2".into()],
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn sudo_prefix() {
        let cmd = argv(&["ls", "/opt"]);
        assert_eq!(transport(None).with_sudo(&cmd), cmd);
        assert_eq!(transport(Some("dremio")).with_sudo(&cmd), argv(&["sudo", "-u", "dremio", "ls", "/opt"]));
    }

    #[test]
    fn host_key_checking_is_off() {
        let args = transport(None).common_args();
        assert_eq!(&args[..2], &["-i".to_string(), "/home/me/.ssh/id_rsa".to_string()]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(transport(None).login("c1"), "dremio@c1");
    }

    #[tokio::test]
    async fn discovery_uses_the_given_hosts() {
        let t = transport(None);
        assert_eq!(t.discover_coordinators().await.unwrap(), vec!["c1".to_string()]);
        assert_eq!(t.discover_executors().await.unwrap().len(), 2);

        let mut opts = t.opts.clone();
        opts.coordinators.clear();
        let empty = SshTransport::new(opts, CancellationToken::new());
        assert!(matches!(empty.discover_coordinators().await, Err(TransportError::Discovery(_))));
    }
}
