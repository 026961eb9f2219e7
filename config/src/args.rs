use crate::{
    profile::CollectionProfile,
    ConfigError,
};
use clap::{
    Parser,
    Subcommand,
};
use std::{
    collections::BTreeMap,
    path::PathBuf,
};

/// Dremio diagnostic collector
#[derive(Parser, Debug, Clone)]
#[command(author, version = version(), about, long_about = None, args_conflicts_with_subcommands = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub collect: CollectArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Runs the collection on the current host only. Invoked by the driver on every node.
    LocalCollect(LocalCollectArgs),
    /// Prints the version and exits.
    Version,
}

#[derive(clap::Args, derive_more::Debug, Clone, Default)]
pub struct CollectArgs {
    /// User to log in as over ssh.
    #[clap(long = "ssh-user", short = 'u', value_name = "USER")]
    pub ssh_user: Option<String>,

    /// Private key used for ssh and scp.
    #[clap(long = "ssh-key", short = 's', value_name = "FILE")]
    pub ssh_key: Option<PathBuf>,

    /// Coordinator hosts, comma separated.
    #[clap(long, short = 'c', value_name = "HOSTS", value_delimiter = ',')]
    pub coordinator: Vec<String>,

    /// Executor hosts, comma separated.
    #[clap(long, short = 'e', value_name = "HOSTS", value_delimiter = ',')]
    pub executors: Vec<String>,

    /// Runs remote commands through `sudo -u <USER>`.
    #[clap(long = "sudo-user", short = 'b', value_name = "USER")]
    pub sudo_user: Option<String>,

    /// Kubernetes namespace of the cluster; selects the kubectl transport.
    #[clap(long, short = 'n', value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Label selector used to find the cluster pods.
    #[clap(long = "label-selector", short = 'l', value_name = "SELECTOR", default_value = "role=dremio-cluster-pod")]
    pub label_selector: String,

    /// kubectl context to use.
    #[clap(long = "context", short = 'x', value_name = "CONTEXT")]
    pub kube_context: Option<String>,

    /// Collection profile.
    #[clap(long, value_name = "PROFILE")]
    pub collect: Option<CollectionProfile>,

    /// Final archive.
    #[clap(long = "output-file", short = 'o', value_name = "FILE", default_value = "diag.tgz")]
    pub output_file: PathBuf,

    /// Directory on every node where its tarball is staged before transfer.
    #[clap(long = "transfer-dir", value_name = "DIR", default_value = "/tmp/ddc")]
    pub transfer_dir: String,

    /// Configuration file shipped to every node.
    #[clap(long = "ddc-yaml", value_name = "FILE")]
    pub ddc_yaml: Option<PathBuf>,

    /// Prompt for the personal access token without echo.
    #[clap(long = "pat-prompt", short = 't', action)]
    pub pat_prompt: bool,

    /// Read the personal access token from stdin.
    #[clap(long = "pat-stdin", action)]
    pub pat_stdin: bool,

    /// Personal access token.
    #[debug(skip)]
    #[clap(long = "dremio-pat-token", env = "DREMIO_PAT_TOKEN", hide_env_values = true, value_name = "PAT")]
    pub dremio_pat_token: Option<String>,

    /// Skips the cluster-wide Kubernetes resource and container log capture.
    #[clap(long = "disable-kubectl", action)]
    pub disable_kubectl: bool,

    /// Uses the namespace of the current kubectl context.
    #[clap(long = "detect-namespace", action)]
    pub detect_namespace: bool,

    /// Number of tarballs pulled back concurrently.
    #[clap(long = "transfer-threads", value_name = "N", default_value_t = 2)]
    pub transfer_threads: usize,

    #[clap(long = "archive-size-limit-mb", value_name = "MB")]
    pub archive_size_limit_mb: Option<u64>,

    #[clap(long = "disable-archive-splitting", action)]
    pub disable_archive_splitting: bool,

    #[clap(long = "min-free-space-gb", value_name = "GB")]
    pub min_free_space_gb: Option<u64>,

    #[clap(long = "disable-free-space-check", action)]
    pub disable_free_space_check: bool,

    /// Proceeds even when no usable log directory is found.
    #[clap(long = "no-log-dir", action)]
    pub no_log_dir: bool,

    /// Never prompt; emit JSON status lines instead of the dashboard.
    #[clap(long = "disable-prompt", action)]
    pub disable_prompt: bool,

    /// Collector binary pushed to the nodes. Defaults to this executable.
    #[clap(long = "collector-binary", value_name = "FILE")]
    pub collector_binary: Option<PathBuf>,

    /// Arbitrary configuration override, repeatable. `KEY=""` sets an empty value.
    #[clap(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(clap::Args, derive_more::Debug, Clone, Default)]
pub struct LocalCollectArgs {
    /// Resolved configuration written by the driver.
    #[clap(long = "ddc-yaml", value_name = "FILE", default_value = "ddc.yaml")]
    pub ddc_yaml: PathBuf,

    /// Read the personal access token from stdin.
    #[clap(long = "pat-stdin", action)]
    pub pat_stdin: bool,

    #[debug(skip)]
    #[clap(long = "dremio-pat-token", env = "DREMIO_PAT_TOKEN", hide_env_values = true, value_name = "PAT")]
    pub dremio_pat_token: Option<String>,

    /// Skips every REST capture on this node.
    #[clap(long = "disable-rest-api", action)]
    pub disable_rest_api: bool,

    /// Writes the collector pid here so the driver can stop it.
    #[clap(long = "pid-file", value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    #[clap(long = "node-name", value_name = "NAME")]
    pub node_name: Option<String>,

    #[clap(long = "tarball-out-dir", value_name = "DIR")]
    pub tarball_out_dir: Option<String>,

    #[clap(long = "collect", value_name = "PROFILE")]
    pub collect: Option<CollectionProfile>,

    #[clap(long = "no-log-dir", action)]
    pub no_log_dir: bool,

    #[clap(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// CLI overrides, the top layer of the configuration.
#[derive(Clone, Default)]
pub struct Overrides(BTreeMap<String, config::Value>);

impl std::fmt::Debug for Overrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| (k, crate::redact::mask_value(k, &v.to_string()).into_owned())))
            .finish()
    }
}

impl Overrides {
    pub fn set(&mut self, key: &str, value: impl Into<config::Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Sets a string value; the literal `""` stands for an explicit empty string.
    pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
        let value = if value == "\"\"" { "" } else { value };
        self.set(key, value.to_string())
    }

    /// Parses `KEY=VALUE`.
    pub fn set_pair(&mut self, pair: &str) -> Result<&mut Self, ConfigError> {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::InvalidOverride(pair.to_string()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidOverride(pair.to_string()));
        }
        Ok(self.set_str(key, value.trim()))
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| v.clone().into_string().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

impl CollectArgs {
    pub fn overrides(&self) -> Result<Overrides, ConfigError> {
        let mut overrides = Overrides::default();
        if let Some(profile) = self.collect {
            overrides.set("collect", profile.to_string());
        }
        overrides.set_str("tarball-out-dir", &self.transfer_dir);
        if let Some(mb) = self.archive_size_limit_mb {
            overrides.set("archive-size-limit-mb", mb);
        }
        if self.disable_archive_splitting {
            overrides.set("disable-archive-splitting", true);
        }
        if let Some(gb) = self.min_free_space_gb {
            overrides.set("min-free-space-gb", gb);
        }
        if self.disable_free_space_check {
            overrides.set("disable-free-space-check", true);
        }
        if self.no_log_dir {
            overrides.set("no-log-dir", true);
        }
        if self.verbose > 0 {
            overrides.set("verbose", "v".repeat(self.verbose as usize));
        }
        for pair in &self.set {
            overrides.set_pair(pair)?;
        }
        Ok(overrides)
    }
}

impl LocalCollectArgs {
    pub fn overrides(&self) -> Result<Overrides, ConfigError> {
        let mut overrides = Overrides::default();
        if let Some(profile) = self.collect {
            overrides.set("collect", profile.to_string());
        }
        if let Some(node) = &self.node_name {
            overrides.set_str("node-name", node);
        }
        if let Some(dir) = &self.tarball_out_dir {
            overrides.set_str("tarball-out-dir", dir);
        }
        if self.disable_rest_api {
            overrides.set("disable-rest-api", true);
        }
        if self.no_log_dir {
            overrides.set("no-log-dir", true);
        }
        if self.verbose > 0 {
            overrides.set("verbose", "v".repeat(self.verbose as usize));
        }
        for pair in &self.set {
            overrides.set_pair(pair)?;
        }
        Ok(overrides)
    }
}

mod config_ext {
    use super::*;
    use config::{
        Map,
        Source,
        Value,
    };

    impl Source for Overrides {
        fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
            Box::new((*self).clone())
        }

        fn collect(&self) -> Result<Map<String, Value>, config::ConfigError> {
            Ok(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
    }
}

pub fn version() -> String {
    let author = clap::crate_authors!();
    let data_dir_path = crate::get_data_dir().display().to_string();

    format!(
        "{}\n\nAuthors: {author}\n\nData directory: {data_dir_path}",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_ssh_invocation() {
        let args = Args::try_parse_from([
            "ddc",
            "--ssh-user",
            "dremio",
            "--ssh-key",
            "/home/me/.ssh/id_rsa",
            "--coordinator",
            "10.0.0.1,10.0.0.2",
            "--executors",
            "10.0.0.3",
            "--collect",
            "health-check",
            "-vv",
        ])
        .unwrap();
        assert!(args.command.is_none());
        let collect = args.collect;
        assert_eq!(collect.coordinator, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(collect.executors, vec!["10.0.0.3"]);
        assert_eq!(collect.collect, Some(CollectionProfile::HealthCheck));
        assert_eq!(collect.verbose, 2);
        assert_eq!(collect.transfer_threads, 2);
    }

    #[test]
    fn parses_local_collect() {
        let args = Args::try_parse_from([
            "ddc",
            "local-collect",
            "--ddc-yaml",
            "/tmp/ddc/ddc.yaml",
            "--disable-rest-api",
            "--pid-file",
            "/tmp/ddc/ddc.pid",
        ])
        .unwrap();
        let Some(Command::LocalCollect(local)) = args.command else {
            panic!("expected local-collect");
        };
        assert!(local.disable_rest_api);
        assert_eq!(local.pid_file, Some(PathBuf::from("/tmp/ddc/ddc.pid")));
    }

    #[test]
    fn rejects_unknown_profile() {
        assert!(Args::try_parse_from(["ddc", "--collect", "everything"]).is_err());
    }

    #[test]
    fn empty_quotes_mean_empty() {
        let mut overrides = Overrides::default();
        overrides.set_pair("dremio-log-dir=\"\"").unwrap();
        overrides.set_pair("dremio-conf-dir=/opt/dremio/conf").unwrap();
        assert_eq!(overrides.get_str("dremio-log-dir"), Some(String::new()));
        assert_eq!(overrides.get_str("dremio-conf-dir"), Some("/opt/dremio/conf".into()));
        assert!(overrides.set_pair("nonsense").is_err());
    }

    #[test]
    fn debug_output_masks_token() {
        let mut overrides = Overrides::default();
        overrides.set_str("dremio-pat-token", "pat-value-123");
        overrides.set_str("node-name", "n1");
        let printed = format!("{overrides:?}");
        assert!(printed.contains("REDACTED"));
        assert!(printed.contains("n1"));
        assert!(!printed.contains("pat-value-123"));
    }
}
