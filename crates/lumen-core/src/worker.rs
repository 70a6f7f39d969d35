//! Bounded worker pool running requests as cancellable tasks.
//!
//! Tasks are queued FIFO so that no request starves behind later ones.
//! Cancelling a queued task makes the worker skip it; cancelling a running
//! task lets the decode finish (pool and cache state stay consistent) and
//! then drops its result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::decode::DecodeResult;
use crate::error::PipelineError;

type TaskResult = Result<DecodeResult, PipelineError>;

/// Fixed-size pool of decode threads.
pub struct WorkerPool {
    pool: ThreadPool,
    threads: usize,
    accepting: AtomicBool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("lumen-decode-{index}"))
            .build()?;
        tracing::debug!(threads, "Worker pool started");
        Ok(Self {
            pool,
            threads,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Queue `job`, returning a handle to its eventual result.
    ///
    /// After [`shutdown`](WorkerPool::shutdown) the task is returned already
    /// aborted and `job` never runs.
    pub fn spawn<F>(&self, job: F) -> RequestTask
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        if !self.is_accepting() {
            tracing::debug!("Worker pool shut down, rejecting task");
            let _ = tx.send(Err(PipelineError::Aborted));
            return RequestTask { cancelled, rx };
        }

        let flag = Arc::clone(&cancelled);
        self.pool.spawn_fifo(move || {
            if flag.load(Ordering::Acquire) {
                tracing::trace!("Skipping cancelled task");
                let _ = tx.send(Err(PipelineError::Aborted));
                return;
            }
            let result = job();
            let outcome = if flag.load(Ordering::Acquire) {
                if let Ok(result) = result {
                    tracing::trace!("Dropping result of task cancelled mid-decode");
                    result.release();
                }
                Err(PipelineError::Aborted)
            } else {
                result
            };
            // The receiver may be gone; the result is then dropped here.
            let _ = tx.send(outcome);
        });
        RequestTask { cancelled, rx }
    }

    /// Stop accepting new tasks. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::debug!("Worker pool stopped accepting tasks");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// A queued or running request.
#[derive(Debug)]
pub struct RequestTask {
    cancelled: Arc<AtomicBool>,
    rx: Receiver<TaskResult>,
}

impl RequestTask {
    /// Block until the task finishes.
    pub fn wait(self) -> TaskResult {
        if self.is_cancelled() {
            // Still wait: a running decode must release its result first.
            let _ = self.rx.recv();
            return Err(PipelineError::Aborted);
        }
        self.rx.recv().unwrap_or(Err(PipelineError::Aborted))
    }

    /// Request cancellation. Has no effect once the result was delivered.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ResourceHandle;
    use crate::raster::{DataFrom, ImageInfo, PixelFormat, RawBuffer};
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;

    fn ok_result() -> TaskResult {
        let handle = ResourceHandle::new(RawBuffer::allocate(2, 2, PixelFormat::L8), None);
        Ok(DecodeResult::new(handle, ImageInfo::new(2, 2, "image/png"), DataFrom::Local))
    }

    #[test]
    fn test_task_delivers_result() {
        let workers = WorkerPool::new(2).unwrap();
        let result = workers.spawn(ok_result).wait().unwrap();
        assert_eq!(result.buffer.width(), 2);
    }

    #[test]
    fn test_cancel_before_start_skips_job() {
        let workers = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker until released.
        let (release_tx, release_rx) = unbounded::<()>();
        let blocker = workers.spawn(move || {
            let _ = release_rx.recv();
            ok_result()
        });

        let counter = Arc::clone(&ran);
        let queued = workers.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ok_result()
        });
        queued.cancel();
        release_tx.send(()).unwrap();

        assert!(matches!(queued.wait(), Err(PipelineError::Aborted)));
        assert!(blocker.wait().is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_while_running_drops_result() {
        let workers = WorkerPool::new(1).unwrap();
        let (started_tx, started_rx) = unbounded::<()>();
        let (release_tx, release_rx) = unbounded::<()>();
        let task = workers.spawn(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            ok_result()
        });

        started_rx.recv().unwrap();
        task.cancel();
        release_tx.send(()).unwrap();
        assert!(matches!(task.wait(), Err(PipelineError::Aborted)));
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let workers = WorkerPool::new(1).unwrap();
        workers.shutdown();
        assert!(!workers.is_accepting());
        let task = workers.spawn(|| panic!("must not run"));
        assert!(matches!(task.wait(), Err(PipelineError::Aborted)));
    }
}
