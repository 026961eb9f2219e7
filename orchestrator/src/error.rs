use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("node discovery failed: {0}")]
    Discovery(String),

    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command on {host} exited with {code:?}: {output}")]
    Exec { host: String, code: Option<i32>, output: String },

    #[error("copy {from} -> {to} on {host} failed: {reason}")]
    Copy {
        host: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("command on {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Why one node's capture stopped.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("extracting {path} failed: {source}")]
    Extract {
        path: std::path::PathBuf,
        #[source]
        source: ddc_collector::archive::ArchiveError,
    },

    #[error("{0}")]
    Local(String),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            NodeError::Cancelled => true,
            NodeError::Transport(err) => err.is_cancelled(),
            _ => false,
        }
    }
}
