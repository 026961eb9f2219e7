use crate::dashboard::Dashboard;
use crossterm::{
    event::{
        Event,
        EventStream,
        KeyCode,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
        EnterAlternateScreen,
        LeaveAlternateScreen,
    },
    ExecutableCommand,
};
use ddc_collector::ShutdownHook;
use ddc_orchestrator::{
    StatusModel,
    StatusSnapshot,
};
use eyre::Result;
use futures::StreamExt as _;
use ratatui::{
    backend::CrosstermBackend,
    Terminal,
};
use std::{
    io::{
        stdout,
        Stdout,
    },
    panic,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub const REDRAW_INTERVAL: Duration = Duration::from_secs(2);

/// Alternate screen in raw mode, restored on drop.
struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Tui {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        stdout().execute(EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
        Ok(Self { terminal })
    }

    fn draw(&mut self, dashboard: &Dashboard, snapshot: &StatusSnapshot) -> Result<()> {
        self.terminal.draw(|frame| {
            if let Err(err) = dashboard.draw(frame, snapshot) {
                error!("Failed to draw: {err:?}");
            }
        })?;
        Ok(())
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        if let Err(err) = restore_terminal() {
            error!("Error restoring terminal: {err}");
        }
    }
}

fn restore_terminal() -> Result<()> {
    stdout().execute(LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}

fn install_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_terminal();
        original_hook(panic_info);
    }));
}

/// Raw mode swallows SIGINT, so ctrl-c arrives as a key.
fn is_interrupt(event: &Event) -> bool {
    matches!(
        event,
        Event::Key(key) if key.kind == KeyEventKind::Press
            && key.code == KeyCode::Char('c')
            && key.modifiers.contains(KeyModifiers::CONTROL)
    )
}

/// Redraws the dashboard every [`REDRAW_INTERVAL`] until `finished` fires.
pub async fn run_dashboard(status: StatusModel, hook: ShutdownHook, finished: CancellationToken) -> Result<()> {
    install_panic_hook();
    let mut tui = Tui::enter()?;
    let dashboard = Dashboard::default();
    let mut events = EventStream::new();
    let mut tick = tokio::time::interval(REDRAW_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = finished.cancelled() => break,
            _ = tick.tick() => {
                status.update_runtime();
                tui.draw(&dashboard, &status.snapshot())?;
            },
            Some(Ok(event)) = events.next() => {
                if is_interrupt(&event) {
                    if !hook.is_cancelled() {
                        warn!("cancel requested from the keyboard");
                        status.warn("cancelling, stopping remote collectors");
                        hook.cancel();
                    }
                    tui.draw(&dashboard, &status.snapshot())?;
                } else if let Event::Resize(..) = event {
                    tui.draw(&dashboard, &status.snapshot())?;
                }
            },
        }
    }

    status.update_runtime();
    tui.draw(&dashboard, &status.snapshot())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEvent;

    #[test]
    fn only_ctrl_c_interrupts() {
        let ctrl_c = Event::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        let plain_c = Event::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE));
        assert!(is_interrupt(&ctrl_c));
        assert!(!is_interrupt(&plain_c));
        assert!(!is_interrupt(&Event::FocusLost));
    }
}
