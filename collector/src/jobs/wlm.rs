use super::write_bytes;
use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
    rest::cancellable,
};
use eyre::bail;
use reqwest::Method;

/// Workload-management queues and rules, cloud engines and the cluster usage
/// stats later consulted by the system-tables export.
pub struct WlmJob;

impl WlmJob {
    fn endpoints(ctx: &CaptureContext) -> Vec<(&'static str, String)> {
        let mut endpoints = vec![
            ("queues.json", ctx.paths.wlm_queues()),
            ("rules.json", ctx.paths.wlm_rules()),
        ];
        if ctx.paths.is_cloud() {
            endpoints.push(("engines.json", ctx.paths.engines()));
        }
        endpoints.push(("cluster_usage.json", ctx.paths.cluster_usage()));
        endpoints
    }
}

impl Job for WlmJob {
    fn name(&self) -> &'static str {
        "wlm"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_wlm && ctx.conf.rest_enabled()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let ctx: &CaptureContext = ctx;
            let client = ctx.rest()?;
            let cancel = ctx.token();
            let dir = ctx.layout.wlm_dir();
            let endpoints = Self::endpoints(ctx);
            let mut failures = Vec::new();
            for (file, url) in &endpoints {
                match cancellable(&cancel, client.api_request(url, ctx.pat(), Method::GET, &[], None)).await {
                    Ok(body) => write_bytes(&dir.join(file), &body).await?,
                    Err(err) => {
                        warn!(file, "wlm capture failed: {err}");
                        failures.push(*file);
                    },
                }
            }
            if failures.len() == endpoints.len() {
                bail!("no wlm endpoint answered");
            }
            Ok(())
        })
    }
}
