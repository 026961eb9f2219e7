//! Short-lived external commands used by the captures.

use eyre::{
    bail,
    eyre,
    Context as _,
    Result,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Locates `program` on PATH, falling back to `<java_home>/bin` for JDK tools.
pub fn locate(program: &str, java_home: Option<&Path>) -> Option<PathBuf> {
    which::which(program).ok().or_else(|| {
        let candidate = java_home?.join("bin").join(program);
        candidate.is_file().then_some(candidate)
    })
}

/// Runs a command and returns stdout followed by stderr. Non-zero exit is an error.
pub async fn capture(program: &Path, args: &[&str], timeout: Duration, cancel: &CancellationToken) -> Result<String> {
    let command_line = format!("{} {}", program.display(), args.join(" "));
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .wrap_err_with(|| format!("failed to start {command_line}"))?;

    debug!(command = %command_line, "running");
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => bail!("{command_line} cancelled"),
        _ = tokio::time::sleep(timeout) => bail!("{command_line} timed out after {}s", timeout.as_secs()),
        output = child.wait_with_output() => output.wrap_err_with(|| format!("failed waiting for {command_line}"))?,
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(eyre!("{command_line} exited with {}: {}", output.status, text.trim()));
    }
    Ok(text)
}

/// Runs a command and writes its output to `out`.
pub async fn capture_to_file(
    program: &Path,
    args: &[&str],
    out: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let text = capture(program, args, timeout, cancel).await?;
    tokio::fs::write(out, text)
        .await
        .wrap_err_with(|| format!("failed to write {}", out.display()))
}

/// Sleeps unless cancelled first. Returns false when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output() {
        let Some(echo) = locate("echo", None) else {
            return;
        };
        let out = capture(&echo, &["hello"], Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn cancellation_stops_command() {
        let Some(sleep) = locate("sleep", None) else {
            return;
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = capture(&sleep, &["30"], Duration::from_secs(60), &cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
