//! A fixed set of worker threads for the wait phase of spawns
//!
//! Forking never happens here; workers only block on report pipes.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool that runs `SpawnOperation::run` off the calling thread
pub struct WaitPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WaitPool {
    /// Start `size` workers (at least one)
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("mochi-spawn-wait-{}", id))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }

        tracing::debug!("Started spawn wait pool with {} workers", size);
        Ok(WaitPool {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job`; runs it inline if every worker is gone
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let job = match &self.sender {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };
        tracing::warn!("Spawn wait pool has no workers left, running job inline");
        job();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

impl Drop for WaitPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue drains
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("Spawn wait worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_all_run_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WaitPool::new(3).expect("Failed to start pool");
            assert_eq!(pool.size(), 3);
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_zero_size_still_has_a_worker() {
        let pool = WaitPool::new(0).expect("Failed to start pool");
        assert_eq!(pool.size(), 1);
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(42).unwrap());
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
