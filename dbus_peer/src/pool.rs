//! Worker threads running handler dispatch off the reader thread.

use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;

use tracing::warn;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Terminate,
}

pub(crate) struct ThreadPool {
    max_workers: usize,
    workers: Vec<Worker>,
    num_busy: Arc<RwLock<usize>>,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl ThreadPool {
    /// Starts `initial_workers` threads (at least one), growing on demand up to `max_workers`.
    pub fn new(initial_workers: usize, max_workers: usize) -> ThreadPool {
        let initial_workers = initial_workers.max(1);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let num_busy = Arc::new(RwLock::new(0_usize));

        let workers = (0..initial_workers)
            .filter_map(|_| Worker::new(Arc::clone(&receiver), Arc::clone(&num_busy)))
            .collect();

        ThreadPool {
            max_workers: max_workers.max(initial_workers),
            workers,
            num_busy,
            sender,
            receiver,
        }
    }

    pub fn execute<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Job::Run(Box::new(f))).is_err() {
            warn!("dispatch pool is gone, dropping job");
            return;
        }
        if self.num_busy() + 1 >= self.workers.len() && self.workers.len() < self.max_workers {
            if let Some(worker) =
                Worker::new(Arc::clone(&self.receiver), Arc::clone(&self.num_busy))
            {
                self.workers.push(worker);
            }
        }
    }

    pub fn num_busy(&self) -> usize {
        self.num_busy.read().map(|n| *n).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Job::Terminate);
        }

        let current = thread::current().id();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                // the last channel handle may be dropped by a handler job
                if thread.thread().id() != current {
                    let _ = thread.join();
                }
            }
        }
    }
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(receiver: Arc<Mutex<mpsc::Receiver<Job>>>, num_busy: Arc<RwLock<usize>>) -> Option<Worker> {
        let spawned = thread::Builder::new()
            .name("dbus-dispatch".into())
            .spawn(move || loop {
                let job = match receiver.lock() {
                    Ok(receiver) => receiver.recv(),
                    Err(_) => break,
                };

                match job {
                    Ok(Job::Run(job)) => {
                        if let Ok(mut n) = num_busy.write() {
                            *n += 1;
                        }
                        job();
                        if let Ok(mut n) = num_busy.write() {
                            *n -= 1;
                        }
                    }
                    Ok(Job::Terminate) | Err(_) => break,
                }
            });

        match spawned {
            Ok(thread) => Some(Worker {
                thread: Some(thread),
            }),
            Err(e) => {
                warn!("cannot spawn dispatch worker: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_runs_jobs_and_grows() {
        let mut pool = ThreadPool::new(1, 4);
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..8 {
            let done = Arc::clone(&done);
            let tx = tx.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(pool.num_workers() <= 4);
        assert!(pool.num_workers() >= 1);
    }

    #[test]
    fn test_drop_waits_for_workers() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let mut pool = ThreadPool::new(2, 2);
            let done = Arc::clone(&done);
            pool.execute(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
