use ddc_collector::ShutdownHook;
use eyre::{
    Context as _,
    Result,
};
use signal_hook::{
    consts::TERM_SIGNALS,
    flag,
};
use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// First SIGINT/SIGTERM cancels `hook`, a second one exits at once.
pub fn forward_signals(hook: ShutdownHook) -> Result<()> {
    let term = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        // Registered first so it sees the flag before the second handler sets it.
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term)).context("Failed to register signal handler")?;
        flag::register(*sig, Arc::clone(&term)).context("Failed to register signal handler")?;
    }

    tokio::spawn(async move {
        loop {
            if term.load(Ordering::Relaxed) {
                warn!("interrupted, cancelling the collection");
                hook.cancel();
                break;
            }
            tokio::select! {
                biased;
                _ = hook.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {},
            }
        }
    });
    Ok(())
}
