use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};
use tokio_util::sync::CancellationToken;

pub type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type Task = (String, Box<dyn FnOnce() -> CleanupFuture + Send>);

/// Ordered cleanup registry shared by everything that spawns work.
///
/// Holds the run's cancellation token. `cleanup` runs the cancel-only tasks
/// (newest first) when the token was cancelled, then the final steps (newest
/// first). Both lists are emptied by every `cleanup`, so it can be called again.
#[derive(Clone, Default, derive_more::Debug)]
pub struct ShutdownHook {
    token: CancellationToken,
    #[debug(skip)]
    cancel_tasks: Arc<Mutex<Vec<Task>>>,
    #[debug(skip)]
    final_steps: Arc<Mutex<Vec<Task>>>,
}

impl ShutdownHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("cancellation requested");
        }
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Registers a task that only runs when the run was cancelled.
    pub fn add_priority_cancel<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: Box<dyn FnOnce() -> CleanupFuture + Send> = Box::new(move || Box::pin(task()));
        self.cancel_tasks.lock().unwrap_or_else(PoisonError::into_inner).push((name.into(), task));
    }

    /// Registers a task that runs on normal completion and on cancellation.
    pub fn add_final_steps<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: Box<dyn FnOnce() -> CleanupFuture + Send> = Box::new(move || Box::pin(task()));
        self.final_steps.lock().unwrap_or_else(PoisonError::into_inner).push((name.into(), task));
    }

    pub async fn cleanup(&self) {
        let cancel_tasks = std::mem::take(&mut *self.cancel_tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if self.is_cancelled() {
            for (name, task) in cancel_tasks.into_iter().rev() {
                debug!(task = %name, "running cancel task");
                task().await;
            }
        } else if !cancel_tasks.is_empty() {
            debug!(count = cancel_tasks.len(), "discarding cancel tasks");
        }

        let final_steps = std::mem::take(&mut *self.final_steps.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, task) in final_steps.into_iter().rev() {
            debug!(task = %name, "running final step");
            task().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recorder(hook: &ShutdownHook, log: &Arc<Mutex<Vec<String>>>, name: &'static str, cancel: bool) {
        let log = log.clone();
        let task = move || async move { log.lock().unwrap().push(name.to_string()) };
        if cancel {
            hook.add_priority_cancel(name, task);
        } else {
            hook.add_final_steps(name, task);
        }
    }

    #[tokio::test]
    async fn cancel_tasks_run_first_and_newest_first() {
        let hook = ShutdownHook::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&hook, &log, "final-a", false);
        recorder(&hook, &log, "cancel-a", true);
        recorder(&hook, &log, "final-b", false);
        recorder(&hook, &log, "cancel-b", true);

        hook.cancel();
        hook.cleanup().await;
        assert_eq!(*log.lock().unwrap(), vec!["cancel-b", "cancel-a", "final-b", "final-a"]);
    }

    #[tokio::test]
    async fn cancel_tasks_skipped_on_normal_completion() {
        let hook = ShutdownHook::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&hook, &log, "cancel", true);
        recorder(&hook, &log, "final", false);
        hook.cleanup().await;
        assert_eq!(*log.lock().unwrap(), vec!["final"]);
    }

    #[tokio::test]
    async fn cleanup_is_reentrant() {
        let hook = ShutdownHook::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&hook, &log, "first", false);
        hook.cleanup().await;
        hook.cleanup().await;
        recorder(&hook, &log, "second", false);
        hook.cleanup().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }
}
