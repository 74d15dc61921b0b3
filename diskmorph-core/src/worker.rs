//! Bounded worker pool used to fan a large EWF `Read` out across chunk
//! boundaries. One job queue with bounded capacity; each worker consumes
//! one job, runs it to completion (there is no cancellation), and reports
//! a result code back to the dispatcher. The dispatcher starts a batch,
//! waits for every job in it to finish, and returns the worst code.

use std::sync::mpsc::{sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() -> i32 + Send + 'static>;

struct Envelope {
    job: Job,
    done: Sender<i32>,
}

pub struct WorkerPool {
    queue: SyncSender<Envelope>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n_workers` threads (minimum 1) pulling from a shared,
    /// bounded job queue.
    pub fn new(n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let (tx, rx) = sync_channel::<Envelope>(n_workers * 4);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..n_workers)
            .map(|_| {
                let rx: Arc<Mutex<Receiver<Envelope>>> = Arc::clone(&rx);
                std::thread::spawn(move || loop {
                    let envelope = {
                        let rx = rx.lock().unwrap();
                        rx.recv()
                    };
                    match envelope {
                        Ok(Envelope { job, done }) => {
                            let code = job();
                            let _ = done.send(code);
                        }
                        Err(_) => break,
                    }
                })
            })
            .collect();

        WorkerPool { queue: tx, handles }
    }

    /// Run `jobs` to completion and return the worst (first non-zero, or
    /// zero if all succeeded) result code. Blocks until every job in this
    /// batch has reported back.
    pub fn run_batch(&self, jobs: Vec<Job>) -> i32 {
        let mut receivers = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            self.queue
                .send(Envelope { job, done: done_tx })
                .expect("worker pool queue closed while jobs are still outstanding");
            receivers.push(done_rx);
        }

        let mut worst = 0;
        for rx in receivers {
            let code = rx.recv().unwrap_or(libc::EIO);
            if code != 0 && worst == 0 {
                worst = code;
            }
        }
        worst
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping `queue` closes the channel; workers see `recv()` fail
        // and exit their loop.
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_jobs_and_reports_worst_code() {
        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<Job> = (0..10)
            .map(|i| {
                let counter = Arc::clone(&counter);
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i == 5 { libc::EIO } else { 0 }
                }) as Job
            })
            .collect();
        let code = pool.run_batch(jobs);
        assert_eq!(code, libc::EIO);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
