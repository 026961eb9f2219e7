use eyre::{
    Context as _,
    Result,
};
use std::{
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    prelude::*,
    EnvFilter,
};

pub const DRIVER_LOG: &str = "ddc.log";

/// `verbose` count to console level: none is warn, then info, debug, trace.
pub fn console_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Debug-level log file at `path`, plus stderr at `console` when given.
/// `DDC_LOG` overrides the file filter.
pub fn log_init(path: &Path, console: Option<LevelFilter>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).context("Failed to create log directory")?;
    }
    let file = std::fs::File::create(path).wrap_err_with(|| format!("Failed to create {}", path.display()))?;
    let file_filter = EnvFilter::try_from_env("DDC_LOG").unwrap_or_else(|_| EnvFilter::new("debug"));

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(file_filter);
    let console_layer = console.map(|level| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(level)
    });

    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_console_level() {
        assert_eq!(console_level(0), LevelFilter::WARN);
        assert_eq!(console_level(1), LevelFilter::INFO);
        assert_eq!(console_level(2), LevelFilter::DEBUG);
        assert_eq!(console_level(7), LevelFilter::TRACE);
    }
}
