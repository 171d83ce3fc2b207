use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
    time::Instant,
};

use tracing::debug;

use super::{OverloadSignal, PoolError, PoolMetrics, WorkerPool};
use crate::{escalation::Escalation, job::Job};

#[derive(Default)]
struct Mailbox {
    jobs: Mutex<VecDeque<Job>>,
    signal: Condvar,

    // Number of pumps running on the mailbox's thread. Only changed while holding the pool's mailbox map lock.
    pumps: AtomicUsize,
}

impl Mailbox {
    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A worker pool that runs every job of a process on the thread that invoked the process.
///
/// The pool has no threads of its own. Jobs are delivered to a mailbox per host thread, and each host thread runs its
/// jobs by pumping its mailbox, either directly through [`run_pending`][Self::run_pending] or while waiting on a process
/// handle.
pub struct ThreadAffinityPool {
    name: Arc<str>,
    stopped: AtomicBool,
    mailboxes: Mutex<HashMap<ThreadId, Arc<Mailbox>>>,
    metrics: PoolMetrics,
}

impl ThreadAffinityPool {
    /// Creates a new `ThreadAffinityPool`.
    pub fn new<N: Into<Arc<str>>>(name: N) -> Self {
        let name = name.into();
        Self {
            metrics: PoolMetrics::new(&name),
            name,
            stopped: AtomicBool::new(false),
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    fn mailboxes(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<Mailbox>>> {
        self.mailboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Opens the current thread's mailbox for pumping. The mailbox is removed once the last pump on it ends with no job
    // left waiting.
    fn pump(&self) -> Pump<'_> {
        let thread = thread::current().id();
        let mut mailboxes = self.mailboxes();
        let mailbox = Arc::clone(mailboxes.entry(thread).or_default());
        mailbox.pumps.fetch_add(1, Ordering::Relaxed);
        Pump {
            pool: self,
            thread,
            mailbox,
        }
    }

    #[cfg(test)]
    fn mailbox_count(&self) -> usize {
        self.mailboxes().len()
    }

    /// Returns the number of jobs waiting for the current thread.
    pub fn pending(&self) -> usize {
        let mailbox = self.mailboxes().get(&thread::current().id()).cloned();
        mailbox.map_or(0, |mailbox| mailbox.jobs().len())
    }

    /// Runs every job waiting for the current thread, including jobs queued while doing so.
    ///
    /// Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let pump = self.pump();
        let mailbox = &pump.mailbox;
        let mut ran = 0;
        loop {
            let next = mailbox.jobs().pop_front();
            match next {
                Some(job) => {
                    job.run();
                    self.metrics.completed.increment(1);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Runs jobs waiting for the current thread until `done` returns `true` or the deadline passes.
    ///
    /// `done` is evaluated while holding the mailbox lock, so anything that makes it return `true` must call
    /// [`wake`][Self::wake] for the thread afterwards. Returns the final value of `done`.
    pub fn pump_until<F>(&self, done: F, deadline: Option<Instant>) -> bool
    where
        F: Fn() -> bool,
    {
        let pump = self.pump();
        let mailbox = &pump.mailbox;
        loop {
            let mut jobs = mailbox.jobs();
            if let Some(job) = jobs.pop_front() {
                drop(jobs);
                job.run();
                self.metrics.completed.increment(1);
                continue;
            }

            if done() {
                return true;
            }

            match deadline {
                None => drop(mailbox.signal.wait(jobs).unwrap_or_else(|e| e.into_inner())),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (jobs, _) = mailbox
                        .signal
                        .wait_timeout(jobs, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    drop(jobs);
                }
            }
        }
    }

    /// Wakes the given thread if it is pumping its mailbox.
    pub fn wake(&self, thread: ThreadId) {
        let mailbox = self.mailboxes().get(&thread).cloned();
        if let Some(mailbox) = mailbox {
            let _jobs = mailbox.jobs();
            mailbox.signal.notify_all();
        }
    }
}

struct Pump<'a> {
    pool: &'a ThreadAffinityPool,
    thread: ThreadId,
    mailbox: Arc<Mailbox>,
}

impl Drop for Pump<'_> {
    fn drop(&mut self) {
        let mut mailboxes = self.pool.mailboxes();
        let last = self.mailbox.pumps.fetch_sub(1, Ordering::Relaxed) == 1;
        let current = mailboxes
            .get(&self.thread)
            .is_some_and(|mailbox| Arc::ptr_eq(mailbox, &self.mailbox));
        if last && current && self.mailbox.jobs().is_empty() {
            mailboxes.remove(&self.thread);
        }
    }
}

impl WorkerPool for ThreadAffinityPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn workers(&self) -> usize {
        0
    }

    fn start(&self) -> Result<(), PoolError> {
        Ok(())
    }

    fn assign(&self, job: Job) -> Result<(), OverloadSignal> {
        if self.stopped.load(Ordering::SeqCst) {
            job.abort(Escalation::pool_failure(&self.name, "pool is stopped"));
            return Ok(());
        }

        // Delivered under the map lock, so that the mailbox cannot be removed in between.
        let mut mailboxes = self.mailboxes();
        let mailbox = mailboxes.entry(job.origin()).or_default();
        mailbox.jobs().push_back(job);
        mailbox.signal.notify_all();
        self.metrics.assigned.increment(1);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let mailboxes = std::mem::take(&mut *self.mailboxes());
        let mut aborted = 0;
        for mailbox in mailboxes.into_values() {
            let jobs = std::mem::take(&mut *mailbox.jobs());
            for job in jobs {
                job.abort(Escalation::pool_failure(&self.name, "pool was stopped before its host thread ran the job"));
                aborted += 1;
            }
            mailbox.signal.notify_all();
        }
        debug!(pool = %self.name, aborted, "Stopped thread affinity pool.");
    }

    fn runs_inline(&self, origin: ThreadId) -> bool {
        thread::current().id() == origin
    }
}
