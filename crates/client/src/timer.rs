//! Single-shot cancellable timers backed by tokio tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A scheduled callback. Cancelling is idempotent; a timer that already fired
/// or was cancelled reports `false`.
#[derive(Debug, Default)]
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Run `fut` after `delay` on the current tokio runtime. The delay counts
    /// from this call, not from when the task is first polled.
    pub fn after<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::at(Instant::now() + delay, fut)
    }

    /// Run `fut` once `deadline` is reached.
    pub fn at<F>(deadline: Instant, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fut.await;
        });
        Self { task: Some(task) }
    }

    /// Abort the timer if it has not fired yet.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                let pending = !task.is_finished();
                task.abort();
                pending
            }
            None => false,
        }
    }

    /// Forget the task without aborting it. The firing callback calls this on
    /// its own slot so it does not abort itself.
    pub fn disarm(&mut self) {
        self.task.take();
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}
