use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, trace, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Resident worker threads fed from one job queue.
///
/// A job is queued only when a resident worker is idle to take it; when all
/// of them are busy the job gets an overflow thread of its own. Every job
/// therefore starts as soon as it is submitted, which discovery needs to
/// probe a whole tier within one budget.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    idle: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let idle = Arc::new(AtomicUsize::new(size));

        for id in 0..size {
            workers.push(Worker::new(id, Arc::clone(&receiver), Arc::clone(&idle)));
        }

        Self {
            workers,
            sender: Some(sender),
            idle,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Resident workers not running a job.
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Starts a job. Returns false when the pool is shutting down.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };

        let reserved = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if reserved {
            return sender.send(Box::new(f)).is_ok();
        }

        trace!("all {} workers busy; starting an overflow thread", self.size());
        thread::Builder::new()
            .name("probe-overflow".to_string())
            .spawn(f)
            .is_ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            if worker.thread.join().is_err() {
                warn!("probe worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, idle: Arc<AtomicUsize>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = match receiver.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => break,
                };
                match msg {
                    Ok(job) => {
                        job();
                        idle.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(_) => {
                        debug!("worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    #[test]
    fn runs_jobs_concurrently() {
        let pool = WorkerPool::new(4);
        assert_eq!(pool.idle(), 4);
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            assert!(pool.execute(move || {
                std::thread::sleep(Duration::from_millis(100));
                tx.send(i).unwrap();
            }));
        }

        let mut got: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_millis(350)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn busy_pool_still_starts_every_job() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();

        for i in 0..8 {
            let tx = tx.clone();
            assert!(pool.execute(move || {
                std::thread::sleep(Duration::from_millis(100));
                tx.send(i).unwrap();
            }));
        }

        let mut got: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_millis(350)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn zero_size_still_has_a_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }
}
