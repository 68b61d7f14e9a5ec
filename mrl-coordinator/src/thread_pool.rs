//! Fixed-size thread pool with a dedicated dispatcher thread.
//!
//! Scheduled thunks go into a FIFO queue. The dispatcher only pulls from that
//! queue once two gates are open: a thunk is waiting, and a worker is idle.
//! It then picks the first idle worker, parks the thunk in that worker's slot
//! and signals it. Workers run one thunk at a time, so no more than
//! `num_threads` thunks ever execute concurrently.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::semaphore::Semaphore;

type Thunk = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-worker hand-off point between the dispatcher and one worker thread.
#[derive(Default)]
struct WorkerSlot {
    thunk: Mutex<Option<Thunk>>,
    signal: Semaphore,
}

struct Shared {
    /// Thunks scheduled but not yet handed to a worker.
    queue: Mutex<VecDeque<Thunk>>,

    /// One permit per thunk sitting in `queue`.
    pending: Semaphore,

    /// One permit per idle worker.
    idle_workers: Semaphore,

    /// `true` at index `i` when worker `i` is free to take a thunk.
    idle: Mutex<Vec<bool>>,

    slots: Vec<WorkerSlot>,

    /// Thunks scheduled and not yet finished.
    outstanding: Mutex<usize>,
    all_done: Condvar,

    /// Cleared when the pool is being torn down.
    running: Mutex<bool>,
}

impl Shared {
    /// Claim the first idle worker, marking it busy.
    fn claim_idle_worker(&self) -> Option<usize> {
        let mut idle = lock(&self.idle);
        let id = idle.iter().position(|&free| free)?;
        idle[id] = false;
        Some(id)
    }

    fn mark_idle(&self, id: usize) {
        lock(&self.idle)[id] = true;
    }

    fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    fn finish_thunk(&self) {
        let mut outstanding = lock(&self.outstanding);
        *outstanding -= 1;
        if *outstanding == 0 {
            self.all_done.notify_all();
        }
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `num_threads` workers and the dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is zero.
    pub fn new(num_threads: usize) -> io::Result<Self> {
        assert!(num_threads > 0, "a thread pool needs at least one thread");

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            pending: Semaphore::new(0),
            idle_workers: Semaphore::new(num_threads),
            idle: Mutex::new(vec![true; num_threads]),
            slots: (0..num_threads).map(|_| WorkerSlot::default()).collect(),
            outstanding: Mutex::new(0),
            all_done: Condvar::new(),
            running: Mutex::new(true),
        });

        let dispatcher = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("mrl-dispatcher".into())
                .spawn(move || dispatch(&shared))?
        };

        let mut pool = Self {
            shared,
            dispatcher: Some(dispatcher),
            workers: Vec::with_capacity(num_threads),
        };

        for id in 0..num_threads {
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("mrl-worker-{id}"))
                .spawn(move || work(&shared, id))?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `thunk` to run on some worker once every earlier thunk has
    /// been handed out. Returns immediately.
    pub fn schedule<F>(&self, thunk: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.shared.outstanding) += 1;
        lock(&self.shared.queue).push_back(Box::new(thunk));
        self.shared.pending.signal();
    }

    /// Block until every thunk scheduled so far has finished.
    pub fn wait(&self) {
        let outstanding = lock(&self.shared.outstanding);
        let _outstanding = self
            .shared
            .all_done
            .wait_while(outstanding, |outstanding| *outstanding > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.wait();

        *lock(&self.shared.running) = false;

        // Both gates have to open for the dispatcher to notice shutdown.
        self.shared.pending.signal();
        self.shared.idle_workers.signal();

        // Empty slots tell workers to exit.
        for slot in &self.shared.slots {
            slot.signal.signal();
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("pool worker thread panicked");
            }
        }
        debug!("Thread pool shut down");
    }
}

fn dispatch(shared: &Shared) {
    loop {
        shared.pending.wait();
        shared.idle_workers.wait();
        if !shared.is_running() {
            break;
        }

        let Some(id) = shared.claim_idle_worker() else {
            error!("idle worker permit granted but no worker is idle");
            continue;
        };

        let Some(thunk) = lock(&shared.queue).pop_front() else {
            error!("pending permit granted but the queue is empty");
            shared.mark_idle(id);
            shared.idle_workers.signal();
            continue;
        };

        let slot = &shared.slots[id];
        *lock(&slot.thunk) = Some(thunk);
        slot.signal.signal();
    }
}

fn work(shared: &Shared, id: usize) {
    let slot = &shared.slots[id];
    loop {
        slot.signal.wait();
        let Some(thunk) = lock(&slot.thunk).take() else {
            break;
        };

        if panic::catch_unwind(AssertUnwindSafe(thunk)).is_err() {
            error!(worker = id, "scheduled task panicked");
        }

        shared.mark_idle(id);
        shared.idle_workers.signal();
        shared.finish_thunk();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn runs_every_scheduled_thunk() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn wait_on_idle_pool_returns_immediately() {
        let pool = ThreadPool::new(2).unwrap();
        pool.wait();
        pool.wait();
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn bounds_concurrency_to_pool_size() {
        let pool = ThreadPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        for _ in 0..5 {
            let running = running.clone();
            let peak = peak.clone();
            pool.schedule(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.wait();

        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn starts_thunks_in_fifo_order() {
        let pool = ThreadPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            pool.schedule(move || order.lock().unwrap().push(i));
        }
        pool.wait();

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn can_be_reused_after_wait() {
        let pool = ThreadPool::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for round in 1..=3 {
            for _ in 0..10 {
                let counter = counter.clone();
                pool.schedule(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.wait();
            assert_eq!(counter.load(Ordering::SeqCst), round * 10);
        }
    }

    #[test]
    fn panicking_thunk_does_not_shrink_the_pool() {
        let pool = ThreadPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.schedule(|| panic!("boom"));
        {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_waits_for_outstanding_thunks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2).unwrap();
            for _ in 0..6 {
                let counter = counter.clone();
                pool.schedule(move || {
                    thread::sleep(Duration::from_millis(20));
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn thunks_may_schedule_more_work() {
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let inner_pool = pool.clone();
            let counter = counter.clone();
            pool.schedule(move || {
                for _ in 0..4 {
                    let counter = counter.clone();
                    inner_pool.schedule(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
        pool.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
