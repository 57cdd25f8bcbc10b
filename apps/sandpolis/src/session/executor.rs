use std::fmt;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where deferred stream callbacks run.
///
/// Consumers registered with [`register`](super::StreamHandle::register) run
/// on the session reader and must return quickly. Consumers registered with
/// [`register_deferred`](super::StreamHandle::register_deferred) are handed
/// to this executor instead.
pub trait CallbackExecutor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

/// Runs the task on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Runs the task on tokio's blocking pool of the current runtime.
///
/// Order between deferred tasks is not preserved.
#[derive(Default, Clone)]
pub struct TokioExecutor {
    handle: Option<tokio::runtime::Handle>,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl CallbackExecutor for TokioExecutor {
    fn execute(&self, task: Task) {
        let handle = self
            .handle
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn_blocking(task);
            }
            None => {
                tracing::debug!(
                    target = "sandpolis::executor",
                    "no tokio runtime available; running callback inline"
                );
                task();
            }
        }
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("pinned", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test_timeout::timeout]
    fn inline_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        InlineExecutor.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn tokio_executor_hops_off_the_caller() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let caller = std::thread::current().id();
        TokioExecutor::default().execute(Box::new(move || {
            let _ = tx.send(std::thread::current().id());
        }));
        let worker = rx.await.unwrap();
        assert_ne!(worker, caller);
    }
}
