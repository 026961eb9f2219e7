use crate::{
    args::Overrides,
    autodetect::{
        self,
        ProcFs,
    },
    profile::CollectionProfile,
    validate,
    CaptureConf,
    ConfigError,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    str::FromStr as _,
};

/// Layers absolute defaults, profile defaults, the user's YAML and CLI overrides
/// into a [`CaptureConf`].
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    yaml: Option<PathBuf>,
    overrides: Overrides,
}

impl ConfigResolver {
    pub fn new(yaml: Option<PathBuf>, overrides: Overrides) -> Self {
        Self { yaml, overrides }
    }

    fn user_sources(&self, builder: config::ConfigBuilder<config::builder::DefaultState>) -> config::ConfigBuilder<config::builder::DefaultState> {
        let mut builder = builder;
        if let Some(yaml) = &self.yaml {
            builder = builder.add_source(config::File::from(yaml.as_path()).format(config::FileFormat::Yaml).required(true));
        }
        builder.add_source(self.overrides.clone())
    }

    /// Profile named by the overrides, then the YAML, then the default.
    pub fn profile(&self) -> Result<CollectionProfile, ConfigError> {
        let layered = self.user_sources(config::Config::builder()).build()?;
        match layered.get_string("collect") {
            Ok(name) if !name.trim().is_empty() => {
                CollectionProfile::from_str(name.trim()).map_err(|_| ConfigError::InvalidProfile(name))
            },
            _ => Ok(CollectionProfile::default()),
        }
    }

    /// Layering only. Used by the driver, which cannot see node paths.
    pub fn resolve(&self) -> Result<CaptureConf, ConfigError> {
        let profile = self.profile()?;
        let builder = config::Config::builder()
            .add_source(config::File::from_str(CaptureConf::defaults_yaml(), config::FileFormat::Yaml))
            .add_source(profile);
        let conf: CaptureConf = self.user_sources(builder).build()?.try_deserialize()?;
        debug!(profile = %conf.collect, yaml = ?self.yaml, "resolved configuration");
        Ok(conf)
    }

    /// Layering plus autodetection and directory validation. Used on the node.
    pub fn resolve_for_node(&self, procfs: &ProcFs) -> Result<CaptureConf, ConfigError> {
        let mut conf = self.resolve()?;
        let detected = if conf.filesystem_enabled() {
            autodetect::detect(procfs)
        } else {
            autodetect::Detected::default()
        };
        validate::finalize(&mut conf, &detected)?;
        if conf.node_name.trim().is_empty() {
            conf.node_name = local_hostname();
        }
        Ok(conf)
    }
}

/// Host name from procfs, falling back to the environment.
pub fn local_hostname() -> String {
    std::fs::read_to_string(Path::new("/proc/sys/kernel/hostname"))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
