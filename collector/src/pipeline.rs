use crate::context::CaptureContext;
use eyre::Result;
use std::{
    future::Future,
    pin::Pin,
    time::Instant,
};

pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// One capture step of the node pipeline.
pub trait Job: Send {
    fn name(&self) -> &'static str;

    /// Whether the configuration asks for this capture at all.
    fn enabled(&self, ctx: &CaptureContext) -> bool;

    fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PipelineReport {
    pub completed: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
    pub cancelled: bool,
}

/// Runs jobs one after another. A failing job is logged and the queue moves on.
#[derive(Default)]
pub struct JobQueue {
    jobs: Vec<Box<dyn Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: impl Job + 'static) -> &mut Self {
        self.jobs.push(Box::new(job));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    pub async fn run(&mut self, ctx: &mut CaptureContext) -> PipelineReport {
        let mut report = PipelineReport::default();
        for job in self.jobs.iter_mut() {
            let name = job.name();
            if ctx.hook.is_cancelled() {
                report.cancelled = true;
                info!(job = name, "pipeline cancelled, skipping remaining jobs");
                break;
            }
            if !job.enabled(ctx) {
                debug!(job = name, "disabled");
                report.skipped.push(name);
                continue;
            }
            let started = Instant::now();
            info!(job = name, "starting");
            match job.run(ctx).await {
                Ok(()) => {
                    info!(job = name, elapsed_ms = started.elapsed().as_millis() as u64, "finished");
                    report.completed.push(name);
                },
                Err(err) => {
                    warn!(job = name, "failed: {err:#}");
                    report.failed.push((name, format!("{err:#}")));
                },
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::OutputLayout,
        shutdown::ShutdownHook,
    };
    use ddc_config::CaptureConf;
    use pretty_assertions::assert_eq;
    use std::sync::{
        Arc,
        Mutex,
    };

    struct Step {
        name: &'static str,
        enabled: bool,
        fail: bool,
        cancel: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Job for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enabled(&self, _ctx: &CaptureContext) -> bool {
            self.enabled
        }

        fn run<'a>(&'a mut self, ctx: &'a mut CaptureContext) -> JobFuture<'a> {
            Box::pin(async move {
                self.log.lock().unwrap().push(self.name);
                if self.cancel {
                    ctx.hook.cancel();
                }
                if self.fail {
                    eyre::bail!("boom");
                }
                Ok(())
            })
        }
    }

    fn ctx() -> CaptureContext {
        CaptureContext::new(
            Arc::new(CaptureConf::default()),
            OutputLayout::new("/tmp/unused", "n1"),
            ShutdownHook::new(),
            None,
        )
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = |name, enabled, fail| Step {
            name,
            enabled,
            fail,
            cancel: false,
            log: log.clone(),
        };
        let mut queue = JobQueue::new();
        queue.push(step("a", true, false)).push(step("b", true, true)).push(step("c", false, false)).push(step("d", true, false));

        let report = queue.run(&mut ctx()).await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "d"]);
        assert_eq!(report.completed, vec!["a", "d"]);
        assert_eq!(report.skipped, vec!["c"]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_job() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = JobQueue::new();
        queue
            .push(Step {
                name: "first",
                enabled: true,
                fail: false,
                cancel: true,
                log: log.clone(),
            })
            .push(Step {
                name: "second",
                enabled: true,
                fail: false,
                cancel: false,
                log: log.clone(),
            });
        let report = queue.run(&mut ctx()).await;
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert!(report.cancelled);
    }
}
