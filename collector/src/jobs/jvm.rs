//! Captures that talk to the server JVM through `jcmd` and `top`.

use crate::{
    archive,
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
    process,
};
use eyre::{
    bail,
    OptionExt as _,
};
use std::time::{
    Duration,
    Instant,
};
use tokio_util::sync::CancellationToken;

const RECORDING: &str = "name=DDC";
const JCMD_TIMEOUT: Duration = Duration::from_secs(120);
const HEAP_DUMP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn jvm_ready(ctx: &CaptureContext) -> bool {
    ctx.conf.filesystem_enabled() && ctx.conf.pid_known()
}

/// Number of samples that fit in `total` at one per `freq`, at least one.
pub fn iterations(total_secs: u64, freq_secs: u64) -> u64 {
    (total_secs / freq_secs.max(1)).max(1)
}

pub struct JfrStartJob;

impl Job for JfrStartJob {
    fn name(&self) -> &'static str {
        "jfr-start"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_jfr && jvm_ready(ctx)
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let (jcmd, pid) = ctx.jcmd()?;
            let out = process::capture(&jcmd, &[&pid, "JFR.start", RECORDING, "settings=profile"], JCMD_TIMEOUT, &ctx.token()).await?;
            debug!("JFR.start: {}", out.trim());
            ctx.jfr_started = Some(Instant::now());

            ctx.hook.add_priority_cancel("stop jfr recording", move || async move {
                let never = CancellationToken::new();
                let stop = process::capture(&jcmd, &[&pid, "JFR.stop", RECORDING], Duration::from_secs(30), &never).await;
                if let Err(err) = stop {
                    warn!("could not stop the JFR recording: {err:#}");
                }
            });
            Ok(())
        })
    }
}

pub struct JfrStopJob;

impl Job for JfrStopJob {
    fn name(&self) -> &'static str {
        "jfr-stop"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.jfr_started.is_some()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let started = ctx.jfr_started.take().ok_or_eyre("recording was never started")?;
            let wanted = Duration::from_secs(ctx.conf.dremio_jfr_time_seconds);
            let remaining = wanted.saturating_sub(started.elapsed());
            let cancel = ctx.token();
            if !remaining.is_zero() {
                info!(seconds = remaining.as_secs(), "waiting for the JFR recording");
                if !process::sleep_or_cancel(remaining, &cancel).await {
                    bail!("cancelled while recording");
                }
            }

            let (jcmd, pid) = ctx.jcmd()?;
            let file = ctx.layout.jfr_file();
            tokio::fs::create_dir_all(ctx.layout.jfr_dir()).await?;
            let filename = format!("filename={}", file.display());
            process::capture(&jcmd, &[&pid, "JFR.dump", RECORDING, &filename], JCMD_TIMEOUT, &cancel).await?;
            process::capture(&jcmd, &[&pid, "JFR.stop", RECORDING], JCMD_TIMEOUT, &cancel).await?;
            info!(file = %file.display(), "JFR recording saved");
            Ok(())
        })
    }
}

pub struct ThreadDumpsJob;

impl Job for ThreadDumpsJob {
    fn name(&self) -> &'static str {
        "thread-dumps"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_jstack && jvm_ready(ctx)
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let (jcmd, pid) = ctx.jcmd()?;
            let dir = ctx.layout.thread_dumps_dir();
            tokio::fs::create_dir_all(&dir).await?;
            let freq = Duration::from_secs(ctx.conf.dremio_jstack_freq_seconds.max(1));
            let count = iterations(ctx.conf.dremio_jstack_time_seconds, ctx.conf.dremio_jstack_freq_seconds);
            let cancel = ctx.token();

            let mut taken = 0;
            for i in 0..count {
                let stamp = chrono::Utc::now().format("%Y-%m-%d_%H_%M_%S");
                let out = dir.join(format!("threadDump-{stamp}-{i:03}.txt"));
                match process::capture_to_file(&jcmd, &[&pid, "Thread.print", "-l"], &out, JCMD_TIMEOUT, &cancel).await {
                    Ok(()) => taken += 1,
                    Err(err) => warn!("thread dump {} failed: {err:#}", i + 1),
                }
                if i + 1 < count && !process::sleep_or_cancel(freq, &cancel).await {
                    break;
                }
            }
            info!(taken, requested = count, "thread dumps captured");
            if taken == 0 {
                bail!("no thread dump could be taken");
            }
            Ok(())
        })
    }
}

pub struct TtopJob;

impl Job for TtopJob {
    fn name(&self) -> &'static str {
        "ttop"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_ttop && jvm_ready(ctx)
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            if !cfg!(target_os = "linux") {
                debug!("per-thread cpu sampling is only available on linux");
                return Ok(());
            }
            let top = process::locate("top", None).ok_or_eyre("top not found")?;
            let freq = ctx.conf.dremio_ttop_freq_seconds.max(1);
            let count = iterations(ctx.conf.dremio_ttop_time_seconds, freq);
            let pid = ctx.conf.dremio_pid.to_string();
            let (freq, count) = (freq.to_string(), count.to_string());
            let timeout = Duration::from_secs(ctx.conf.dremio_ttop_time_seconds + 60);
            let out = ctx.layout.ttop_dir().join("ttop.txt");
            tokio::fs::create_dir_all(ctx.layout.ttop_dir()).await?;
            process::capture_to_file(&top, &["-H", "-b", "-d", &freq, "-n", &count, "-p", &pid], &out, timeout, &ctx.token()).await
        })
    }
}

pub struct HeapDumpJob;

impl Job for HeapDumpJob {
    fn name(&self) -> &'static str {
        "heap-dump"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.capture_heap_dump && jvm_ready(ctx)
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let (jcmd, pid) = ctx.jcmd()?;
            let dir = ctx.layout.heap_dumps_dir();
            tokio::fs::create_dir_all(&dir).await?;
            let raw = dir.join(format!("{}.hprof", ctx.node()));
            let raw_arg = raw.display().to_string();
            process::capture(&jcmd, &[&pid, "GC.heap_dump", &raw_arg], HEAP_DUMP_TIMEOUT, &ctx.token()).await?;

            let gz = dir.join(format!("{}.hprof.gz", ctx.node()));
            let src = raw.clone();
            let bytes = tokio::task::spawn_blocking(move || archive::gzip_file(&src, &gz)).await??;
            tokio::fs::remove_file(&raw).await?;
            info!(bytes, "heap dump compressed");
            Ok(())
        })
    }
}
