#[macro_use]
extern crate tracing;

mod app_config;
mod args;
pub mod autodetect;
mod capture_conf;
mod error;
mod profile;
pub mod redact;
mod resolver;
pub mod validate;

pub use app_config::{
    get_data_dir,
    PROJECT_NAME,
};
pub use args::{
    version,
    Args,
    CollectArgs,
    Command,
    LocalCollectArgs,
    Overrides,
};
pub use autodetect::ProcFs;
pub use capture_conf::CaptureConf;
pub use error::ConfigError;
pub use profile::{
    CollectionProfile,
    CollectionProfileIter,
    ProfileDefaults,
};
pub use resolver::{
    local_hostname,
    ConfigResolver,
};
