//! A single background worker for transfer continuations.
//!
//! Streaming file bytes after the peer accepts must not occupy the request
//! pump, or the pump could never frame a `FileTransferStalled` arriving
//! mid-stream. One worker keeps transfers strictly sequential.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TransferWorker {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl TransferWorker {
    pub fn new() -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = mpsc::channel();

        let thread: JoinHandle<()> = thread::spawn(move || {
            let span = tracing::info_span!("transfer_worker");
            let _guard = span.enter();

            while let Ok(job) = rx.recv() {
                if let Err(err) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    let panic_msg: &str = err
                        .downcast_ref()
                        .copied()
                        .or_else(|| err.downcast_ref::<String>().map(|s| &**s))
                        .unwrap_or("Any { .. }");

                    tracing::error!("Transfer job panicked: {:?}", panic_msg);
                }
            }
            tracing::debug!("Channel closed. Shutting down transfer worker.");
        });

        Self {
            sender: Some(tx),
            thread: Some(thread),
        }
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(f);
        if let Some(sender) = self.sender.as_ref() {
            // The worker thread only exits on drop, so the send can only
            // fail during teardown; the job is dropped in that case.
            let _ = sender.send(job);
        }
    }
}

impl Default for TransferWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransferWorker {
    fn drop(&mut self) {
        drop(self.sender.take());

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let worker = TransferWorker::new();
        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        for expected in 0..4 {
            let counter = Arc::clone(&counter);
            worker.execute(move || {
                let seen: usize = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, expected);
            });
        }

        drop(worker); // joins the thread, so every job has run
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_worker_survives_a_panicking_job() {
        let worker = TransferWorker::new();
        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        worker.execute(|| panic!("boom"));
        let after = Arc::clone(&counter);
        worker.execute(move || {
            after.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
