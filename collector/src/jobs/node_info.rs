//! OS, disk and JVM snapshots of the node.

use super::write_bytes;
use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
    process,
};
use eyre::{
    Context as _,
    Result,
};
use std::{
    fmt::Write as _,
    fs,
    path::Path,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const OS_FILES: [(&str, &str); 5] = [
    ("release", "/etc/os-release"),
    ("hostname", "/proc/sys/kernel/hostname"),
    ("meminfo", "/proc/meminfo"),
    ("loadavg", "/proc/loadavg"),
    ("cgroup", "/proc/self/cgroup"),
];

const CGROUP_COUNTERS: [&str; 6] = [
    "/sys/fs/cgroup/cpu.max",
    "/sys/fs/cgroup/cpu.stat",
    "/sys/fs/cgroup/memory.max",
    "/sys/fs/cgroup/memory.current",
    "/sys/fs/cgroup/cpu/cpu.cfs_quota_us",
    "/sys/fs/cgroup/memory/memory.limit_in_bytes",
];

fn section(out: &mut String, title: &str, body: &str) {
    let _ = writeln!(out, "___\n>>> {title}\n{}", body.trim_end());
}

async fn run_section(out: &mut String, title: &str, program: &str, args: &[&str], cancel: &CancellationToken) {
    let body = match process::locate(program, None) {
        Some(path) => process::capture(&path, args, COMMAND_TIMEOUT, cancel)
            .await
            .unwrap_or_else(|err| format!("failed: {err:#}")),
        None => format!("{program} not available"),
    };
    section(out, title, &body);
}

/// `mode size path` for every entry below `dir`. Contents are never read.
pub fn dir_listing(dir: &Path) -> String {
    let mut out = String::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let kind = if meta.is_dir() { 'd' } else { '-' };
        let _ = writeln!(out, "{kind}{:o} {:>14} {}", mode(&meta), meta.len(), rel.display());
    }
    out
}

#[cfg(unix)]
fn mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

pub struct NodeInfoJob;

impl NodeInfoJob {
    async fn os_info(ctx: &CaptureContext, cancel: &CancellationToken) -> Result<()> {
        let mut out = String::new();
        for (title, path) in OS_FILES {
            let body = fs::read_to_string(path).unwrap_or_else(|err| format!("unreadable: {err}"));
            section(&mut out, title, &body);
        }
        for counter in CGROUP_COUNTERS {
            if let Ok(body) = fs::read_to_string(counter) {
                section(&mut out, counter, &body);
            }
        }
        run_section(&mut out, "uname", "uname", &["-a"], cancel).await;
        run_section(&mut out, "lscpu", "lscpu", &[], cancel).await;
        run_section(&mut out, "mount", "mount", &[], cancel).await;
        run_section(&mut out, "lsblk", "lsblk", &[], cancel).await;
        if ctx.conf.pid_known() {
            let pid = ctx.conf.dremio_pid.to_string();
            let body = match process::locate("ps", None) {
                Some(ps) => {
                    process::capture(&ps, &["eww", &pid], COMMAND_TIMEOUT, cancel)
                        .await
                        .map(|text| ddc_config::redact::scrub(&text, ctx.pat()))
                        .unwrap_or_else(|err| format!("failed: {err:#}"))
                },
                None => "ps not available".to_string(),
            };
            section(&mut out, "process environment", &body);
        }
        write_bytes(&ctx.layout.node_info_dir().join("os_info.txt"), out.as_bytes()).await
    }

    async fn disk_usage(ctx: &CaptureContext, cancel: &CancellationToken) -> Result<()> {
        let mut out = String::new();
        run_section(&mut out, "df -h", "df", &["-h"], cancel).await;
        if !ctx.conf.dremio_rocksdb_dir.is_empty() {
            let db = ctx.conf.dremio_rocksdb_dir.as_str();
            run_section(&mut out, &format!("df -h {db}"), "df", &["-h", db], cancel).await;
        }
        write_bytes(&ctx.layout.node_info_dir().join("diskusage.txt"), out.as_bytes()).await
    }

    async fn jvm_flags(ctx: &CaptureContext, cancel: &CancellationToken) -> Result<()> {
        let (jcmd, pid) = ctx.jcmd()?;
        let mut out = process::capture(&jcmd, &[&pid, "VM.flags"], COMMAND_TIMEOUT, cancel).await?;
        let cmdline = format!("/proc/{pid}/cmdline");
        if let Ok(raw) = fs::read(&cmdline) {
            let args: Vec<String> = raw
                .split(|b| *b == 0)
                .filter(|a| !a.is_empty())
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect();
            section(&mut out, "command line", &ddc_config::redact::mask_args(&args).join(" "));
        }
        write_bytes(&ctx.layout.node_info_dir().join("jvm_settings.txt"), out.as_bytes()).await
    }

    async fn db_listing(ctx: &CaptureContext) -> Result<()> {
        let db = Path::new(&ctx.conf.dremio_rocksdb_dir).to_path_buf();
        let listing = tokio::task::spawn_blocking(move || dir_listing(&db))
            .await
            .wrap_err("db listing task failed")?;
        write_bytes(&ctx.layout.node_info_dir().join("rocksdb_dir_listing.txt"), listing.as_bytes()).await
    }
}

impl Job for NodeInfoJob {
    fn name(&self) -> &'static str {
        "node-info"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        let conf = &ctx.conf;
        conf.filesystem_enabled() && (conf.collect_os_config || conf.collect_disk_usage || conf.collect_jvm_flags)
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let ctx: &CaptureContext = ctx;
            if !cfg!(target_os = "linux") {
                debug!("node snapshots are only taken on linux");
                return Ok(());
            }
            let cancel = ctx.token();
            if ctx.conf.collect_os_config {
                if let Err(err) = Self::os_info(ctx, &cancel).await {
                    warn!("os info capture failed: {err:#}");
                }
            }
            if ctx.conf.collect_disk_usage {
                if let Err(err) = Self::disk_usage(ctx, &cancel).await {
                    warn!("disk usage capture failed: {err:#}");
                }
            }
            if ctx.conf.collect_jvm_flags {
                if let Err(err) = Self::jvm_flags(ctx, &cancel).await {
                    warn!("jvm flags capture failed: {err:#}");
                }
            }
            if !ctx.conf.dremio_rocksdb_dir.is_empty() {
                Self::db_listing(ctx).await?;
            }
            Ok(())
        })
    }
}
