//! # Runtime Event Loop
//!
//! Purpose: An `IoContext` backed by a tokio current-thread runtime. Work is
//! spawned from any thread but only makes progress while some thread is
//! inside `run`, the same contract an asio-style `io_context` offers.
//!
//! ## Design Principles
//! 1. **One Driver**: The current-thread runtime is driven by whichever thread
//!    calls `run`; spawned tasks queue up while nobody drives it.
//! 2. **Watch-Based Stop**: A `watch` channel holds the stop flag, so a `stop`
//!    that races with entering `run` is never lost.
//! 3. **Fork Child Abandons**: In the child process the inherited runtime
//!    (epoll descriptor, timers, queued tasks) is leaked and replaced.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;

use csm_common::ForkEvent;

use crate::core::IoContext;

/// `IoContext` implementation driven by a tokio current-thread runtime.
pub struct RuntimeIoContext {
    runtime: Mutex<Arc<Runtime>>,
    stopped: watch::Sender<bool>,
    fork_events: Mutex<Vec<ForkEvent>>,
}

impl RuntimeIoContext {
    /// Builds a context with a fresh runtime.
    pub fn new() -> std::io::Result<Self> {
        let (stopped, _) = watch::channel(false);
        Ok(RuntimeIoContext {
            runtime: Mutex::new(Arc::new(build_runtime()?)),
            stopped,
            fork_events: Mutex::new(Vec::new()),
        })
    }

    /// Queues a task on the loop.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = Arc::clone(&self.runtime.lock());
        // The join handle is not needed; results travel through completions.
        drop(runtime.spawn(task));
    }

    /// Fork phases observed so far, oldest first.
    pub fn fork_events(&self) -> Vec<ForkEvent> {
        self.fork_events.lock().clone()
    }
}

impl IoContext for RuntimeIoContext {
    fn run(&self) {
        let runtime = Arc::clone(&self.runtime.lock());
        let mut stopped = self.stopped.subscribe();
        runtime.block_on(async move {
            // An error means the sender is gone, which also ends the loop.
            let _ = stopped.wait_for(|stopped| *stopped).await;
        });
    }

    fn stop(&self) {
        self.stopped.send_replace(true);
    }

    fn restart(&self) {
        self.stopped.send_replace(false);
    }

    fn notify_fork(&self, event: ForkEvent) {
        self.fork_events.lock().push(event);
        if event != ForkEvent::Child {
            tracing::debug!(%event, "io context notified of fork");
            return;
        }

        match build_runtime() {
            Ok(fresh) => {
                let inherited = std::mem::replace(&mut *self.runtime.lock(), Arc::new(fresh));
                // Dropping would shut down state shared with the parent.
                std::mem::forget(inherited);
                tracing::debug!("io context replaced inherited runtime in fork child");
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to rebuild runtime in fork child");
            }
        }
    }
}

fn build_runtime() -> std::io::Result<Runtime> {
    Builder::new_current_thread().enable_all().build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn tasks_run_only_while_driven() {
        let io = Arc::new(RuntimeIoContext::new().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        io.spawn(async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let driver = {
            let io = Arc::clone(&io);
            std::thread::spawn(move || io.run())
        };
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        io.stop();
        driver.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_run_returns_immediately() {
        let io = RuntimeIoContext::new().unwrap();
        io.stop();
        io.run();
        io.restart();
        io.stop();
        io.run();
    }

    #[test]
    fn fork_events_are_recorded() {
        let io = RuntimeIoContext::new().unwrap();
        io.notify_fork(ForkEvent::Prepare);
        io.notify_fork(ForkEvent::Child);
        assert_eq!(io.fork_events(), vec![ForkEvent::Prepare, ForkEvent::Child]);
    }
}
