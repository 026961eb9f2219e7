use super::write_bytes;
use crate::{
    context::CaptureContext,
    pipeline::{
        Job,
        JobFuture,
    },
    rest::cancellable,
};
use reqwest::Method;

pub struct KvStoreJob;

impl Job for KvStoreJob {
    fn name(&self) -> &'static str {
        "kvstore-report"
    }

    fn enabled(&self, ctx: &CaptureContext) -> bool {
        ctx.conf.collect_kvstore_report && ctx.conf.rest_enabled() && !ctx.conf.is_dremio_cloud
    }

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
        Box::pin(async move {
            let ctx: &CaptureContext = ctx;
            let url = ctx.paths.kvstore_report();
            let headers = [("Accept", "application/octet-stream")];
            let report = cancellable(
                &ctx.token(),
                ctx.rest()?.api_request(&url, ctx.pat(), Method::GET, &headers, None),
            )
            .await?;
            let out = ctx.layout.kvstore_dir().join("kvstore-report.zip");
            write_bytes(&out, &report).await?;
            info!(bytes = report.len(), "kv store report saved");
            Ok(())
        })
    }
}
