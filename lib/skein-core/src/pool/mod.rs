//! Worker pools.
//!
//! A worker pool decides which thread runs a job. Pools are pluggable: the engine only ever talks to them through
//! [`WorkerPool`], asking them to accept a job and whether a continuation may run inline on the current thread.
use std::{fmt, io, sync::Arc, thread::ThreadId};

use metrics::{counter, gauge, Counter, Gauge};
use snafu::Snafu;

use crate::{diagnostics::Diagnostics, job::Job};

mod affinity;
pub use self::affinity::ThreadAffinityPool;

mod fixed;
pub use self::fixed::{FixedWorkerPool, OverloadPolicy, DEFAULT_QUEUE_CAPACITY};

mod passive;
pub use self::passive::PassivePool;

/// Worker pool errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PoolError {
    /// The pool was already started.
    #[snafu(display("Worker pool '{}' was already started.", pool))]
    AlreadyStarted {
        /// Name of the pool.
        pool: Arc<str>,
    },

    /// A worker thread could not be spawned.
    #[snafu(display("Failed to spawn worker thread for pool '{}': {}", pool, source))]
    SpawnWorker {
        /// Name of the pool.
        pool: Arc<str>,

        /// Error source.
        source: io::Error,
    },
}

/// A signal that a pool cannot accept a job right now.
///
/// Overload is backpressure, not failure: the job is handed back so that the caller can retry the assignment later or
/// route the job elsewhere.
pub struct OverloadSignal {
    pool: Arc<str>,
    job: Job,
}

impl OverloadSignal {
    pub(crate) fn new(pool: &Arc<str>, job: Job) -> Self {
        Self {
            pool: Arc::clone(pool),
            job,
        }
    }

    /// Returns the name of the overloaded pool.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Consumes the signal, returning the job that was not accepted.
    pub fn into_job(self) -> Job {
        self.job
    }
}

impl fmt::Debug for OverloadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverloadSignal")
            .field("pool", &self.pool)
            .field("job", &self.job.name())
            .finish()
    }
}

impl fmt::Display for OverloadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker pool '{}' is overloaded", self.pool)
    }
}

/// A pool of threads that runs jobs.
pub trait WorkerPool: Send + Sync {
    /// Returns the name of the pool.
    fn name(&self) -> &str;

    /// Returns the number of worker threads the pool runs, or zero if it borrows its threads.
    fn workers(&self) -> usize;

    /// Starts the pool.
    ///
    /// # Errors
    ///
    /// If the pool was already started, or its worker threads could not be spawned, an error is returned.
    fn start(&self) -> Result<(), PoolError>;

    /// Assigns a job to the pool.
    ///
    /// A pool that has become unusable aborts the job with a `PoolFailure` escalation rather than returning it.
    ///
    /// # Errors
    ///
    /// If the pool cannot accept the job right now, the job is handed back in an `OverloadSignal`.
    fn assign(&self, job: Job) -> Result<(), OverloadSignal>;

    /// Stops the pool, blocking until every job it accepted has run.
    fn stop(&self);

    /// Returns `true` if a continuation of a process started on `origin` may run inline on the current thread.
    fn runs_inline(&self, origin: ThreadId) -> bool;

    /// Returns `true` if the pool has no threads of its own and runs jobs on the thread that assigns them.
    fn is_passive(&self) -> bool {
        false
    }

    /// Attaches the diagnostic channel that fatal pool failures are reported on.
    fn attach_diagnostics(&self, diagnostics: Diagnostics) {
        let _ = diagnostics;
    }
}

pub(crate) struct PoolMetrics {
    pub(crate) assigned: Counter,
    pub(crate) completed: Counter,
    pub(crate) overloads: Counter,
    pub(crate) queue_depth: Gauge,
}

impl PoolMetrics {
    pub(crate) fn new(pool_name: &Arc<str>) -> Self {
        let pool_name = pool_name.to_string();
        Self {
            assigned: counter!("skein_pool_jobs_assigned_total", "pool_name" => pool_name.clone()),
            completed: counter!("skein_pool_jobs_completed_total", "pool_name" => pool_name.clone()),
            overloads: counter!("skein_pool_overloads_total", "pool_name" => pool_name.clone()),
            queue_depth: gauge!("skein_pool_queue_depth", "pool_name" => pool_name),
        }
    }
}
