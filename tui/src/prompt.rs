use crossterm::{
    event::{
        self,
        Event,
        KeyCode,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use eyre::{
    bail,
    Context as _,
    Result,
};
use std::io::{
    IsTerminal as _,
    Write as _,
};

fn read_secret(events: impl IntoIterator<Item = Event>) -> Result<String> {
    let mut secret = String::new();
    for event in events {
        let Event::Key(key) = event else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(secret),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => bail!("input cancelled"),
            KeyCode::Backspace => {
                secret.pop();
            },
            KeyCode::Char(c) => secret.push(c),
            _ => {},
        }
    }
    bail!("input closed before enter")
}

/// Reads a secret without echoing it. Falls back to one line of stdin when
/// stdin is not a terminal.
pub fn prompt_secret(prompt: &str) -> Result<String> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        let mut line = String::new();
        stdin.read_line(&mut line).wrap_err("failed to read stdin")?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }

    let mut stderr = std::io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;
    enable_raw_mode()?;
    let secret = read_secret(std::iter::from_fn(|| event::read().ok()));
    disable_raw_mode()?;
    writeln!(stderr)?;
    secret
}
