use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
};
use ddc_config::redact;
use eyre::{
    Context as _,
    Result,
};
use std::{
    fs,
    path::Path,
};

const BINARY_EXTENSIONS: [&str; 7] = ["jks", "p12", "pfx", "keystore", "truststore", "key", "pem"];

fn is_key_material(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Copies text configuration files from `src` into `dest` with secret values
/// replaced. Key stores and non-UTF-8 files are skipped. Returns the number
/// of files written.
pub fn copy_redacted(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(src).min_depth(1).max_depth(2).sort_by_file_name() {
        let entry = entry.wrap_err_with(|| format!("failed to walk {}", src.display()))?;
        if !entry.file_type().is_file() || is_key_material(entry.path()) {
            continue;
        }
        let Ok(body) = fs::read_to_string(entry.path()) else {
            debug!(file = %entry.path().display(), "skipping non-text configuration file");
            continue;
        };
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let out = dest.join(rel);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&out, redact::redact_config(&body)).wrap_err_with(|| format!("failed to write {}", out.display()))?;
        copied += 1;
    }
    Ok(copied)
}

pub struct ConfigurationJob;

impl Job for ConfigurationJob {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_dremio_configuration && ctx.conf.filesystem_enabled() && !ctx.conf.dremio_conf_dir.is_empty()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let src = Path::new(&ctx.conf.dremio_conf_dir).to_path_buf();
            let dest = ctx.layout.configuration_dir();
            let copied = tokio::task::spawn_blocking(move || copy_redacted(&src, &dest)).await??;
            info!(files = copied, "configuration copied");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_removed_and_keystores_skipped() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(
            src.path().join("dremio.conf"),
            "paths.local: \"/var/lib/dremio\"\nservices.coordinator.web.ssl.keyStorePassword: \"hunter2\"\n",
        )
        .unwrap();
        fs::write(src.path().join("server.jks"), [0u8, 1, 2]).unwrap();
        fs::create_dir(src.path().join("hadoop")).unwrap();
        fs::write(
            src.path().join("hadoop").join("core-site.xml"),
            "<property>\n<name>fs.s3a.secret.key</name>\n<value>abc123</value>\n</property>\n",
        )
        .unwrap();

        assert_eq!(copy_redacted(src.path(), dest.path()).unwrap(), 2);
        let conf = fs::read_to_string(dest.path().join("dremio.conf")).unwrap();
        assert!(conf.contains("/var/lib/dremio"));
        assert!(!conf.contains("hunter2"));
        assert!(conf.contains(redact::REMOVED_SECRET));
        assert!(!dest.path().join("server.jks").exists());
        let xml = fs::read_to_string(dest.path().join("hadoop").join("core-site.xml")).unwrap();
        assert!(!xml.contains("abc123"));
    }
}
