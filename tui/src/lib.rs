#[macro_use]
extern crate tracing;

mod dashboard;
mod layout;
mod prompt;
mod terminal;
mod theme;

pub use dashboard::{
    final_report,
    format_elapsed,
    Dashboard,
};
pub use prompt::prompt_secret;
pub use terminal::{
    run_dashboard,
    REDRAW_INTERVAL,
};
