use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, OnceLock,
    },
    thread::{self, JoinHandle, ThreadId},
};

use crossbeam_queue::ArrayQueue;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{OverloadSignal, PoolError, PoolMetrics, WorkerPool};
use crate::{
    diagnostics::{Diagnostic, Diagnostics},
    escalation::Escalation,
    job::Job,
    strategy::{NamedThreadFactory, ThreadFactory},
};

/// Default number of jobs a fixed pool queues before signalling overload.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;
const FAILED: u8 = 4;

thread_local! {
    // Token of the fixed pool whose worker is running on this thread, or zero.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// How a fixed pool reacts when it cannot start a job immediately.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
    /// Queue the job until a worker is free, signalling overload only once the queue is full.
    #[default]
    Queue,

    /// Signal overload whenever every worker already has a job, instead of queueing.
    RejectWhenBusy,
}

struct Shared {
    name: Arc<str>,
    workers: usize,
    policy: OverloadPolicy,
    queue: ArrayQueue<Job>,
    state: AtomicU8,
    in_flight: AtomicUsize,
    park: Mutex<()>,
    wakeup: Condvar,
    diagnostics: OnceLock<Diagnostics>,
    metrics: PoolMetrics,
}

impl Shared {
    fn token(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    fn park(&self) -> MutexGuard<'_, ()> {
        self.park.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_one(&self) {
        let _park = self.park();
        self.wakeup.notify_one();
    }

    fn notify_all(&self) {
        let _park = self.park();
        self.wakeup.notify_all();
    }

    fn abort_queued(&self, reason: &str) {
        while let Some(job) = self.queue.pop() {
            job.abort(Escalation::pool_failure(&self.name, reason));
        }
        self.metrics.queue_depth.set(0.0);
    }

    /// Marks the pool as unusable, aborting every queued job.
    fn fail(&self, reason: &str) {
        if self.state.swap(FAILED, Ordering::SeqCst) == FAILED {
            return;
        }

        self.notify_all();
        self.abort_queued(reason);
        if let Some(diagnostics) = self.diagnostics.get() {
            diagnostics.emit(Diagnostic::PoolFailed {
                pool: Arc::clone(&self.name),
                reason: Arc::from(reason),
            });
        } else {
            warn!(pool = %self.name, reason, "Worker pool failed and is no longer usable.");
        }
    }

    fn try_reserve(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.workers {
                return false;
            }
            match self
                .in_flight
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

// Fails the pool if its worker unwinds.
struct WorkerGuard<'a> {
    shared: &'a Shared,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.fail("worker thread panicked");
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    CURRENT_POOL.with(|current| current.set(shared.token()));
    let _guard = WorkerGuard { shared: &shared };

    loop {
        if let Some(job) = shared.queue.pop() {
            shared.metrics.queue_depth.set(shared.queue.len() as f64);
            job.run();
            if shared.policy == OverloadPolicy::RejectWhenBusy {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            shared.metrics.completed.increment(1);
            continue;
        }

        let park = shared.park();
        if !shared.queue.is_empty() {
            continue;
        }
        match shared.state.load(Ordering::SeqCst) {
            IDLE | RUNNING => {
                drop(shared.wakeup.wait(park).unwrap_or_else(|e| e.into_inner()));
            }
            _ => break,
        }
    }

    CURRENT_POOL.with(|current| current.set(0));
}

/// A worker pool with a fixed number of dedicated threads.
///
/// Jobs are queued in a bounded queue and taken by whichever worker is free. Worker threads are named after the pool:
/// `<name>-worker-NN`.
pub struct FixedWorkerPool {
    shared: Arc<Shared>,
    thread_factory: Arc<dyn ThreadFactory>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FixedWorkerPool {
    /// Creates a new `FixedWorkerPool` with the given number of workers and queue capacity.
    ///
    /// At least one worker is always created. With [`OverloadPolicy::RejectWhenBusy`], the queue holds at least one
    /// slot per worker.
    pub fn new<N: Into<Arc<str>>>(name: N, workers: usize, queue_capacity: usize, policy: OverloadPolicy) -> Self {
        let name = name.into();
        let workers = workers.max(1);
        let queue_capacity = match policy {
            OverloadPolicy::Queue => queue_capacity.max(1),
            OverloadPolicy::RejectWhenBusy => queue_capacity.max(workers),
        };

        let thread_factory = Arc::new(NamedThreadFactory::new(format!("{}-worker", name)));
        Self {
            shared: Arc::new(Shared {
                metrics: PoolMetrics::new(&name),
                name,
                workers,
                policy,
                queue: ArrayQueue::new(queue_capacity),
                state: AtomicU8::new(IDLE),
                in_flight: AtomicUsize::new(0),
                park: Mutex::new(()),
                wakeup: Condvar::new(),
                diagnostics: OnceLock::new(),
            }),
            thread_factory,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Creates a new `FixedWorkerPool` with a single worker and the default queue capacity.
    pub fn single<N: Into<Arc<str>>>(name: N) -> Self {
        Self::new(name, 1, DEFAULT_QUEUE_CAPACITY, OverloadPolicy::Queue)
    }

    /// Sets the thread factory used to spawn worker threads.
    pub fn with_thread_factory(mut self, thread_factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = thread_factory;
        self
    }

    /// Returns the number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    fn on_own_worker(&self) -> bool {
        CURRENT_POOL.with(|current| current.get()) == self.shared.token()
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkerPool for FixedWorkerPool {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn workers(&self) -> usize {
        self.shared.workers
    }

    fn start(&self) -> Result<(), PoolError> {
        if self
            .shared
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::AlreadyStarted {
                pool: Arc::clone(&self.shared.name),
            });
        }

        let mut handles = self.handles();
        for _ in 0..self.shared.workers {
            let shared = Arc::clone(&self.shared);
            match self.thread_factory.spawn(Box::new(move || run_worker(shared))) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.shared.fail(&format!("failed to spawn worker thread: {}", e));
                    return Err(PoolError::SpawnWorker {
                        pool: Arc::clone(&self.shared.name),
                        source: e,
                    });
                }
            }
        }

        debug!(pool = %self.shared.name, workers = self.shared.workers, "Started worker pool.");
        Ok(())
    }

    fn assign(&self, job: Job) -> Result<(), OverloadSignal> {
        match self.shared.state.load(Ordering::SeqCst) {
            IDLE | RUNNING => {}
            STOPPING if self.on_own_worker() => {}
            FAILED => {
                job.abort(Escalation::pool_failure(&self.shared.name, "pool has failed"));
                return Ok(());
            }
            _ => {
                job.abort(Escalation::pool_failure(&self.shared.name, "pool is stopped"));
                return Ok(());
            }
        }

        let reserved = self.shared.policy == OverloadPolicy::RejectWhenBusy;
        if reserved && !self.shared.try_reserve() {
            self.shared.metrics.overloads.increment(1);
            return Err(OverloadSignal::new(&self.shared.name, job));
        }

        if let Err(job) = self.shared.queue.push(job) {
            if reserved {
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            self.shared.metrics.overloads.increment(1);
            return Err(OverloadSignal::new(&self.shared.name, job));
        }

        self.shared.metrics.assigned.increment(1);
        self.shared.metrics.queue_depth.set(self.shared.queue.len() as f64);
        self.shared.notify_one();
        Ok(())
    }

    fn stop(&self) {
        let previous = match self
            .shared
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) | Err(previous) => previous,
        };
        if previous == IDLE
            && self
                .shared
                .state
                .compare_exchange(IDLE, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.shared.abort_queued("pool was stopped before it started");
            return;
        }

        self.shared.notify_all();
        if self.on_own_worker() {
            warn!(pool = %self.shared.name, "Worker pool stopped from one of its own workers. Not waiting for it to drain.");
            return;
        }

        let handles = std::mem::take(&mut *self.handles());
        for handle in handles {
            let _ = handle.join();
        }

        let _ = self
            .shared
            .state
            .compare_exchange(STOPPING, STOPPED, Ordering::SeqCst, Ordering::SeqCst);
        debug!(pool = %self.shared.name, "Stopped worker pool.");
    }

    fn runs_inline(&self, _origin: ThreadId) -> bool {
        self.on_own_worker()
    }

    fn attach_diagnostics(&self, diagnostics: Diagnostics) {
        let _ = self.shared.diagnostics.set(diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{atomic::AtomicUsize, mpsc},
        time::Duration,
    };

    use super::*;
    use crate::escalation::EscalationKind;

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        Job::from_fn("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    // Returns a job that reports when it starts, then blocks until released.
    fn blocking_job() -> (Job, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let job = Job::from_fn("block", move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        (job, started_rx, release_tx)
    }

    fn aborting_job(tx: mpsc::Sender<Escalation>) -> Job {
        Job::from_fn("never", || panic!("job should have been aborted")).on_abort(move |escalation| {
            tx.send(escalation).unwrap();
        })
    }

    #[test]
    fn runs_every_assigned_job_before_stopping() {
        let pool = FixedWorkerPool::new("compute", 4, 64, OverloadPolicy::Queue);
        pool.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            pool.assign(counting_job(&counter)).unwrap();
        }
        pool.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn queue_policy_queues_until_full() {
        let pool = FixedWorkerPool::new("compute", 1, 1, OverloadPolicy::Queue);
        pool.start().unwrap();

        let (first, started, release) = blocking_job();
        pool.assign(first).unwrap();
        started.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        assert!(pool.assign(counting_job(&counter)).is_ok());

        let overload = pool.assign(counting_job(&counter)).unwrap_err();
        assert_eq!(overload.pool(), "compute");
        assert_eq!(overload.into_job().name(), "count");

        release.send(()).unwrap();
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reject_policy_signals_overload_when_busy() {
        let pool = FixedWorkerPool::new("compute", 1, 16, OverloadPolicy::RejectWhenBusy);
        pool.start().unwrap();

        let (first, started, release) = blocking_job();
        pool.assign(first).unwrap();
        started.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let overload = pool.assign(counting_job(&counter));
        assert!(overload.is_err());

        release.send(()).unwrap();
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn continuations_run_inline_only_on_own_workers() {
        let pool = Arc::new(FixedWorkerPool::single("compute"));
        pool.start().unwrap();
        assert!(!pool.runs_inline(thread::current().id()));

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&pool);
        pool.assign(Job::from_fn("report-thread", move || {
            tx.send(inner.runs_inline(thread::current().id())).unwrap();
        }))
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        pool.stop();
    }

    #[test]
    fn stopped_pool_aborts_new_jobs() {
        let pool = FixedWorkerPool::single("compute");
        pool.start().unwrap();
        pool.stop();

        let (tx, rx) = mpsc::channel();
        pool.assign(aborting_job(tx)).unwrap();
        assert_eq!(rx.recv().unwrap().kind(), EscalationKind::PoolFailure);
    }

    #[test]
    fn start_twice_is_an_error() {
        let pool = FixedWorkerPool::single("compute");
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted { .. })));
        pool.stop();
    }

    struct FailingFactory;

    impl ThreadFactory for FailingFactory {
        fn name(&self) -> &str {
            "failing"
        }

        fn spawn(&self, _task: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
            Err(io::Error::other("no threads left"))
        }
    }

    #[test]
    fn spawn_failure_makes_pool_unusable() {
        let pool = FixedWorkerPool::single("compute").with_thread_factory(Arc::new(FailingFactory));
        let diagnostics = Diagnostics::default();
        let (diag_tx, diag_rx) = mpsc::channel();
        diagnostics.subscribe(move |d| diag_tx.send(d.to_string()).unwrap());
        pool.attach_diagnostics(diagnostics);

        let (tx, rx) = mpsc::channel();
        pool.assign(aborting_job(tx.clone())).unwrap();

        assert!(matches!(pool.start(), Err(PoolError::SpawnWorker { .. })));
        assert_eq!(rx.recv().unwrap().kind(), EscalationKind::PoolFailure);
        assert!(diag_rx.recv().unwrap().contains("no threads left"));

        pool.assign(aborting_job(tx)).unwrap();
        assert_eq!(rx.recv().unwrap().kind(), EscalationKind::PoolFailure);
    }

    #[test]
    fn worker_panic_makes_pool_unusable() {
        let pool = FixedWorkerPool::single("compute");
        let diagnostics = Diagnostics::default();
        let (diag_tx, diag_rx) = mpsc::channel();
        diagnostics.subscribe(move |d| diag_tx.send(d.to_string()).unwrap());
        pool.attach_diagnostics(diagnostics);
        pool.start().unwrap();

        pool.assign(Job::from_fn("explode", || panic!("worker bug"))).unwrap();
        let diagnostic = diag_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(diagnostic, "worker pool 'compute' failed: worker thread panicked");

        let (tx, rx) = mpsc::channel();
        pool.assign(aborting_job(tx)).unwrap();
        assert_eq!(rx.recv().unwrap().kind(), EscalationKind::PoolFailure);
        pool.stop();
    }
}
