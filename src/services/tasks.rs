//! In-process task backend.
//!
//! Fire-and-forget scheduling of consolidation and opinion retention after
//! retain and reflect. Two implementations: a worker-pool backend whose
//! submit returns immediately, and an inline backend that runs the task on
//! the calling thread (tests, synchronous callers).
//!
//! Both guarantee at-least-once execution within the process lifetime.
//! There is no durable queue: tasks lost to a crash are recovered by the
//! consolidation watermark scan on the next retain for that bank.

use crate::config::{TaskConfig, TaskMode};
use crate::{Error, Result};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Trait for task backends.
pub trait TaskBackend: Send + Sync {
    /// Submits a job.
    ///
    /// Jobs never propagate failures to the submitter; they record errors
    /// on their owning operation rows instead.
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend can no longer accept work
    /// (shut down).
    fn submit(&self, name: &'static str, job: Job) -> Result<()>;
}

/// Builds the backend selected by the configuration.
#[must_use]
pub fn build_task_backend(config: &TaskConfig) -> Arc<dyn TaskBackend> {
    match config.mode {
        TaskMode::Background => Arc::new(BackgroundTaskBackend::new(
            config.workers.max(1),
            config.queue_depth.max(1),
        )),
        TaskMode::Inline => Arc::new(InlineTaskBackend),
    }
}

/// Runs each job on the calling thread before returning.
pub struct InlineTaskBackend;

impl TaskBackend for InlineTaskBackend {
    fn submit(&self, name: &'static str, job: Job) -> Result<()> {
        let span = tracing::debug_span!("task", name, mode = "inline");
        let _enter = span.enter();
        job();
        Ok(())
    }
}

/// Bounded queue drained by a small worker pool.
pub struct BackgroundTaskBackend {
    sender: Mutex<Option<mpsc::SyncSender<(&'static str, Job)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTaskBackend {
    /// Creates a backend with the given worker count and queue depth.
    #[must_use]
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<(&'static str, Job)>(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("engram-task-{worker}"))
                    .spawn(move || loop {
                        let next = {
                            let receiver = receiver
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            receiver.recv()
                        };
                        let Ok((name, job)) = next else {
                            break;
                        };
                        let span = tracing::debug_span!("task", name, mode = "background");
                        let _enter = span.enter();
                        metrics::counter!("tasks_executed_total", "task" => name).increment(1);
                        job();
                    })
                    .expect("spawn task worker")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Stops accepting work and joins the workers after the queue drains.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        drop(sender);
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl TaskBackend for BackgroundTaskBackend {
    fn submit(&self, name: &'static str, job: Job) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::op("task_submit", "task backend shut down"));
        };
        // A full queue briefly blocks the submitter rather than dropping
        // the task; at-least-once beats fire-and-forget here.
        sender
            .send((name, job))
            .map_err(|_| Error::op("task_submit", "task workers gone"))
    }
}

impl Drop for BackgroundTaskBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_inline_runs_before_returning() {
        let counter = Arc::new(AtomicUsize::new(0));
        let backend = InlineTaskBackend;
        let captured = Arc::clone(&counter);
        backend
            .submit("test", Box::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_executes_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let backend = BackgroundTaskBackend::new(2, 16);
        for _ in 0..10 {
            let captured = Arc::clone(&counter);
            backend
                .submit("test", Box::new(move || {
                    captured.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        backend.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let backend = BackgroundTaskBackend::new(1, 4);
        backend.shutdown();
        let result = backend.submit("test", Box::new(|| {}));
        assert!(result.is_err());
    }

    #[test]
    fn test_build_backend_respects_mode() {
        let inline = build_task_backend(&TaskConfig {
            mode: TaskMode::Inline,
            workers: 1,
            queue_depth: 1,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&counter);
        inline
            .submit("test", Box::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
