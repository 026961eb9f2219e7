use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown collection profile '{0}', expected one of light, standard, standard+jstack, health-check, waf")]
    InvalidProfile(String),

    #[error("{key} '{}' is not usable: {reason}", path.display())]
    InvalidDirectory {
        key: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("a personal access token is required when {mode}")]
    MissingPat { mode: &'static str },

    #[error("invalid override '{0}', expected KEY=VALUE")]
    InvalidOverride(String),

    #[error("another ddc run holds {} (pid {pid})", path.display())]
    LockHeld { path: PathBuf, pid: i32 },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to write configuration: {0}")]
    Serialize(#[from] serde_yml::Error),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}
