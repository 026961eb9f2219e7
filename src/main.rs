#[macro_use]
extern crate tracing;

mod commands;
mod logging;
mod signals;

use clap::Parser;
use color_eyre::Result;
use ddc_config::{
    Args,
    Command,
};

fn init_errors() -> Result<()> {
    let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .into_hooks();
    eyre_hook.install()?;
    std::panic::set_hook(Box::new(move |panic_info| {
        #[cfg(not(debug_assertions))]
        {
            use human_panic::{
                handle_dump,
                metadata,
                print_msg,
            };
            let metadata = metadata!();
            let file_path = handle_dump(&metadata, panic_info);
            let _ = print_msg(file_path, &metadata);
        }
        error!("Error: {}", panic_hook.panic_report(panic_info));
        #[cfg(debug_assertions)]
        {
            better_panic::Settings::auto()
                .most_recent_first(false)
                .lineno_suffix(true)
                .verbosity(better_panic::Verbosity::Full)
                .create_panic_handler()(panic_info);
        }
        std::process::exit(1);
    }));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_errors()?;
    let args = Args::parse();
    let machine = args.command.is_none() && args.collect.disable_prompt;

    let result = match args.command {
        None => commands::collect(args.collect).await,
        Some(Command::LocalCollect(local)) => commands::local_collect(local).await,
        Some(Command::Version) => {
            println!("ddc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        },
    };

    if let Err(err) = result {
        error!("{err:?}");
        if machine {
            println!("{}", serde_json::json!({ "error": format!("{err:#}") }));
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
    Ok(())
}
