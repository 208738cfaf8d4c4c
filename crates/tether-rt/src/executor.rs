//! Loop-local task executor.
//!
//! Spawned futures are polled on the loop thread between close callbacks and
//! wake callbacks. Their wakers may fire from any thread: scheduling pushes
//! the runnable onto the loop's ready queue and notifies the poller.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::error;

use crate::reactor::Loop;

impl Loop {
    /// Spawn a future onto this loop. It first runs on the next loop pass.
    ///
    /// A pending task keeps the loop alive. If the loop is dropped, tasks
    /// still queued are dropped with it.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guarded = Guarded {
            future,
            _live: LiveTask::new(self.live_tasks.clone()),
        };

        let lp = self.weak();
        let schedule = move |runnable| {
            if let Some(lp) = lp.upgrade() {
                // Unbounded and never closed, so push cannot fail.
                let _ = lp.tasks.push(runnable);
                lp.notify();
            }
        };

        let (runnable, task) = async_task::spawn(guarded, schedule);
        task.detach();
        runnable.schedule();
    }

    /// Poll up to `task_budget` ready tasks. Returns whether any ran.
    pub(crate) fn run_tasks(&self) -> bool {
        let mut ran = false;
        for _ in 0..self.config().task_budget {
            match self.tasks.pop() {
                Ok(runnable) => {
                    runnable.run();
                    ran = true;
                }
                Err(_) => break,
            }
        }
        ran
    }
}

/// Counts a task as live until its future is dropped.
struct LiveTask(Arc<AtomicUsize>);

impl LiveTask {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps a panicking task from unwinding through the loop.
struct Guarded<F> {
    future: F,
    _live: LiveTask,
}

impl<F: Future<Output = ()>> Future for Guarded<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: `future` is structurally pinned and never moved out.
        let future = unsafe { self.map_unchecked_mut(|g| &mut g.future) };
        match panic::catch_unwind(AssertUnwindSafe(|| future.poll(cx))) {
            Ok(poll) => poll,
            Err(_) => {
                error!("spawned task panicked; task dropped");
                Poll::Ready(())
            }
        }
    }
}
