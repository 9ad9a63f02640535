//! Serial task executor — a single worker thread draining a FIFO queue
//!
//! The cache requires one of these for journal appends (host-provided, so the
//! embedder decides which thread pays for journal I/O) and owns a second one
//! for background trims. A single worker consuming an ordered queue is what
//! gives the journal its write-ordering guarantee: lines reach disk in the
//! order the operations that produced them returned to their callers.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded FIFO task queue.
///
/// Jobs run strictly in submission order on one named worker thread.
/// Dropping the executor stops the queue and joins the worker.
pub struct SerialExecutor {
    /// Queue handle; `None` once the executor has shut down
    sender: Mutex<Option<Sender<Job>>>,
    /// Worker join handle, taken exactly once on shutdown
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Used to avoid self-joining when the last owner drops on the worker itself
    worker_id: ThreadId,
}

impl SerialExecutor {
    /// Spawn a named worker thread with an empty queue.
    pub fn new(name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;

        let worker_id = worker.thread().id();

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Enqueue a job. Jobs submitted after `shutdown` are silently dropped.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Block until every job enqueued before this call has finished.
    pub fn drain(&self) {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        {
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else { return };
            if sender
                .send(Box::new(move || {
                    let _ = done_tx.send(());
                }))
                .is_err()
            {
                return;
            }
        }
        let _ = done_rx.recv();
    }

    /// Stop accepting jobs, finish the queue, and join the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // never join the worker from the worker itself
            if self.worker_id != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let executor = SerialExecutor::new("test-serial").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            executor.execute(move || log.lock().push(i));
        }
        executor.drain();

        let log = log.lock();
        assert_eq!(log.len(), 100);
        assert!(log.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_drain_waits_for_prior_jobs() {
        let executor = SerialExecutor::new("test-drain").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            executor.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_worker_thread_is_named() {
        let executor = SerialExecutor::new("cellar-test-worker").unwrap();
        let name = Arc::new(Mutex::new(String::new()));
        let name_clone = Arc::clone(&name);
        executor.execute(move || {
            *name_clone.lock() = thread::current().name().unwrap_or("").to_string();
        });
        executor.drain();
        assert_eq!(*name.lock(), "cellar-test-worker");
    }

    #[test]
    fn test_execute_after_shutdown_is_noop() {
        let executor = SerialExecutor::new("test-shutdown").unwrap();
        executor.shutdown();
        executor.execute(|| panic!("job must not run"));
        executor.drain(); // returns immediately, nothing to wait for
    }
}
