//! Reusable worker pool with a non-blocking submit.
//!
//! Closures are handed to an idle persistent worker over a zero-capacity
//! rendezvous channel. When nobody is waiting, the pool spends one unit of
//! its budget on a new persistent worker; once the budget is gone, overflow
//! runs on transient workers that execute a single closure and exit.
//!
//! Every transient worker is its own detached OS thread, so overflow work
//! starts immediately and never waits on other closures or on any async
//! runtime. The cost is that sustained overflow creates threads without an
//! upper bound; size the pool for the steady-state load and treat overflow
//! as a burst path.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Budget value below which the counter is reset.
const BUDGET_FLOOR: isize = isize::MIN / 2;

pub struct WorkerPool {
    size: usize,
    work_tx: Sender<Job>,
    work_rx: Receiver<Job>,
    /// Dropped on close; workers observe the disconnect.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed: AtomicBool,
    budget: AtomicIsize,
    live: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::bounded(0);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);

        Self {
            size,
            work_tx,
            work_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: AtomicBool::new(false),
            budget: AtomicIsize::new(isize::try_from(size).unwrap_or(isize::MAX)),
            live: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Persistent workers currently alive.
    pub fn persistent_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` in the background. Never blocks.
    pub fn go<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(f);

        if self.is_closed() {
            self.spawn_transient(job);
            return;
        }

        let job = match self.work_tx.try_send(job) {
            Ok(()) => return,
            Err(e) => e.into_inner(),
        };

        let remaining = self.budget.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining >= 0 {
            self.spawn_persistent(job);
            return;
        }

        if remaining < BUDGET_FLOOR {
            tracing::warn!(budget = remaining, "Worker pool budget drifted, resetting");
            self.budget.store(-1, Ordering::Release);
        }
        self.spawn_transient(job);
    }

    /// Tell idle persistent workers to exit. Does not wait for running
    /// closures; later submissions run on transient workers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let shutdown = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if shutdown.is_some() {
            tracing::debug!(persistent = self.persistent_workers(), "Closing worker pool");
        }
    }

    fn spawn_persistent(&self, first: Job) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let work = self.work_rx.clone();
        let shutdown = self.shutdown_rx.clone();
        let live = LiveWorker::enter(&self.live);

        tracing::debug!(worker = id, "Spawning persistent worker");
        std::thread::Builder::new()
            .name(format!("fanout-worker-{id}"))
            .spawn(move || {
                let _live = live;
                first();
                worker_loop(&work, &shutdown);
            })
            .expect("failed to spawn persistent worker thread");
    }

    fn spawn_transient(&self, job: Job) {
        std::thread::Builder::new()
            .name("fanout-overflow".to_string())
            .spawn(job)
            .expect("failed to spawn transient worker thread");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(work: &Receiver<Job>, shutdown: &Receiver<()>) {
    loop {
        // Shutdown wins over a handoff that is ready at the same time.
        if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
            return;
        }
        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            recv(work) -> job => match job {
                Ok(job) => job(),
                Err(_) => return,
            },
        }
    }
}

/// Counts a persistent worker as alive until dropped, panics included.
struct LiveWorker {
    live: Arc<AtomicUsize>,
}

impl LiveWorker {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            live: Arc::clone(live),
        }
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn overflow_submission_does_not_block() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = mpsc::channel();

        for i in 0..3 {
            let release = release_rx.clone();
            let started = started_tx.clone();
            pool.go(move || {
                started.send(i).unwrap();
                let _ = release.recv();
            });
        }

        let mut started: Vec<i32> = (0..3)
            .map(|_| started_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        started.sort();
        assert_eq!(started, [0, 1, 2]);
        assert_eq!(pool.persistent_workers(), 2);

        drop(release_tx);
    }

    #[test]
    fn idle_workers_are_reused() {
        let pool = WorkerPool::new(1);
        let (done_tx, done_rx) = mpsc::channel();
        let mut names = Vec::new();

        for _ in 0..10 {
            let done = done_tx.clone();
            pool.go(move || {
                let name = std::thread::current().name().map(str::to_owned);
                done.send(name).unwrap();
            });
            names.push(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
            // Give the worker time to park on the rendezvous channel again.
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(pool.persistent_workers(), 1);
        assert_eq!(pool.next_id.load(Ordering::Relaxed), 1);
        let reused = names
            .iter()
            .filter(|n| n.as_deref() == Some("fanout-worker-0"))
            .count();
        assert!(reused > 1, "persistent worker ran {reused} of 10 jobs");
    }

    #[test]
    fn close_stops_idle_workers_and_falls_back_to_transient() {
        let pool = WorkerPool::new(2);
        let (done_tx, done_rx) = mpsc::channel();

        pool.go(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.persistent_workers(), 1);

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(wait_until(|| pool.persistent_workers() == 0));

        let budget_before = pool.budget.load(Ordering::Acquire);
        let (name_tx, name_rx) = mpsc::channel();
        pool.go(move || {
            let name = std::thread::current().name().map(str::to_owned);
            name_tx.send(name).unwrap();
        });
        let name = name_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("fanout-overflow"));

        assert_eq!(pool.persistent_workers(), 0);
        assert_eq!(pool.budget.load(Ordering::Acquire), budget_before);
    }

    #[test]
    fn zero_sized_pool_runs_everything_transiently() {
        let pool = WorkerPool::new(0);
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..4 {
            let done = done_tx.clone();
            pool.go(move || done.send(()).unwrap());
        }
        for _ in 0..4 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.persistent_workers(), 0);
    }

    #[test]
    fn budget_drift_is_reset() {
        let pool = WorkerPool::new(0);
        pool.budget.store(BUDGET_FLOOR, Ordering::Release);
        let (done_tx, done_rx) = mpsc::channel();

        pool.go(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.budget.load(Ordering::Acquire), -1);
    }

    #[test]
    fn pool_outlives_the_runtime_it_was_built_in() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let pool = runtime.block_on(async { WorkerPool::new(0) });
        drop(runtime);

        let (done_tx, done_rx) = mpsc::channel();
        pool.go(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn overflow_closures_start_without_waiting_on_each_other() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .build()
            .unwrap();
        let pool = runtime.block_on(async { WorkerPool::new(0) });
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        let first_done = done_tx.clone();
        pool.go(move || {
            let opened = gate_rx.recv_timeout(Duration::from_secs(3)).is_ok();
            first_done.send(("first", opened)).unwrap();
        });
        pool.go(move || {
            gate_tx.send(()).unwrap();
            done_tx.send(("second", true)).unwrap();
        });

        let mut finished: Vec<_> = (0..2)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        finished.sort();
        assert_eq!(finished, [("first", true), ("second", true)]);
        drop(runtime);
    }
}
