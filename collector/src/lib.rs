#[macro_use]
extern crate tracing;

pub mod archive;
pub mod context;
pub mod jobs;
pub mod layout;
mod local_collector;
pub mod pidfile;
pub mod pipeline;
pub mod process;
pub mod rest;
mod shutdown;

pub use context::CaptureContext;
pub use layout::OutputLayout;
pub use local_collector::{
    read_pat,
    resolve_conf,
    LocalCollector,
};
pub use shutdown::{
    CleanupFuture,
    ShutdownHook,
};
