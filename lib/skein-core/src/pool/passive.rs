use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::ThreadId,
};

use tracing::debug;

use super::{OverloadSignal, PoolError, PoolMetrics, WorkerPool};
use crate::{escalation::Escalation, job::Job, supervisor};

/// A worker pool without threads of its own.
///
/// Jobs run immediately on whichever thread assigns them, so a passive pool never overloads. The one exception is the
/// supervisor thread, which never runs function bodies: the runtime reroutes work a passive pool would run there to
/// its fallback pool, creating a dedicated [`RESUME_POOL`][crate::runtime::RESUME_POOL] when none is configured.
pub struct PassivePool {
    name: Arc<str>,
    stopped: AtomicBool,
    running: Mutex<usize>,
    drained: Condvar,
    metrics: PoolMetrics,
}

impl PassivePool {
    /// Creates a new `PassivePool`.
    pub fn new<N: Into<Arc<str>>>(name: N) -> Self {
        let name = name.into();
        Self {
            metrics: PoolMetrics::new(&name),
            name,
            stopped: AtomicBool::new(false),
            running: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn running(&self) -> MutexGuard<'_, usize> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkerPool for PassivePool {
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

        self.metrics.assigned.increment(1);
        *self.running() += 1;
        job.run();

        let mut running = self.running();
        *running -= 1;
        if *running == 0 {
            self.drained.notify_all();
        }
        self.metrics.completed.increment(1);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let mut running = self.running();
        while *running > 0 {
            running = self.drained.wait(running).unwrap_or_else(|e| e.into_inner());
        }
        debug!(pool = %self.name, "Stopped passive pool.");
    }

    fn runs_inline(&self, _origin: ThreadId) -> bool {
        !supervisor::on_supervisor_thread()
    }

    fn is_passive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use super::*;
    use crate::escalation::EscalationKind;

    #[test]
    fn runs_on_the_assigning_thread() {
        let pool = PassivePool::new("caller");
        pool.start().unwrap();

        let (tx, rx) = mpsc::channel();
        pool.assign(Job::from_fn("report-thread", move || tx.send(thread::current().id()).unwrap()))
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), thread::current().id());
        assert!(pool.runs_inline(thread::current().id()));
        assert!(pool.is_passive());
    }

    #[test]
    fn stopped_pool_aborts_jobs() {
        let pool = PassivePool::new("caller");
        pool.stop();

        let (tx, rx) = mpsc::channel();
        pool.assign(
            Job::from_fn("never", || panic!("job should have been aborted")).on_abort(move |e| tx.send(e).unwrap()),
        )
        .unwrap();
        assert_eq!(rx.try_recv().unwrap().kind(), EscalationKind::PoolFailure);
    }
}
