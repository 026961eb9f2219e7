#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod k8s_resources;
pub mod node_capture;
pub mod preflight;
pub mod runner;
pub mod status;
pub mod summary;
pub mod transport;

pub use config::{
    RunPlan,
    TransportKind,
};
pub use error::{
    NodeError,
    TransportError,
};
pub use runner::Orchestrator;
pub use status::{
    NodeResult,
    NodeState,
    Phase,
    StatusModel,
    StatusSnapshot,
};
pub use summary::SummaryBundle;
