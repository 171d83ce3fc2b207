use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use metrics::counter;
use quanta::Instant;
use skein_error::GenericError;
use tracing::{debug, trace};

use super::{Asset, AssetKey, AssetStatus};
use crate::{
    escalation::Escalation,
    graph::PoolId,
    job::{FlowJob, Job},
    process::ProcessStatus,
    resource::{Completion, Waiter},
    runtime::Engine,
};

/// A job suspended until a resource handle settles.
///
/// The job is resumed by whichever comes first: the handle's listener settling it, or a supervisor tick noticing that
/// the handle has settled, timed out, or that the job's process has been cancelled.
pub(crate) struct PendingJob {
    engine: Arc<Engine>,
    name: Arc<str>,
    function: Arc<str>,
    job: Mutex<Option<FlowJob>>,
    completion: Arc<Completion>,
    key: OnceLock<AssetKey>,
}

impl PendingJob {
    pub(crate) fn new(engine: Arc<Engine>, job: FlowJob, completion: Arc<Completion>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            name: Arc::from(format!("pending:{}", job.name())),
            function: Arc::from(job.name()),
            job: Mutex::new(Some(job)),
            completion,
            key: OnceLock::new(),
        })
    }

    fn job(&self) -> MutexGuard<'_, Option<FlowJob>> {
        self.job.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_key(&self, key: AssetKey) {
        let _ = self.key.set(key);
    }

    fn resume(&self) -> bool {
        let Some(job) = self.job().take() else {
            return false;
        };
        if let Some(key) = self.key.get() {
            self.engine.deregister_asset(*key);
        }
        trace!(job = job.name(), resource = %self.completion.resource(), "Resuming suspended job.");
        self.engine.dispatch(job);
        true
    }
}

impl Waiter for PendingJob {
    fn wake(&self) {
        self.resume();
    }
}

impl Asset for PendingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, now: Instant) -> Result<AssetStatus, GenericError> {
        let status = match &*self.job() {
            None => return Ok(AssetStatus::Resolved),
            Some(job) => job.process().status(),
        };

        if matches!(status, ProcessStatus::Cancelling | ProcessStatus::Completed) {
            // Failing the handle wakes the job, which then drops itself on admission.
            let _ = self.completion.transition(Err(Escalation::cancelled(&self.function)));
            self.resume();
            return Ok(AssetStatus::Resolved);
        }

        if self.completion.expire(now) {
            counter!("skein_supervisor_timeouts_total").increment(1);
            debug!(resource = %self.completion.resource(), "Resource handle timed out.");
            self.resume();
            return Ok(AssetStatus::Resolved);
        }

        if self.completion.is_settled() {
            self.resume();
            return Ok(AssetStatus::Resolved);
        }

        Ok(AssetStatus::Pending)
    }

    fn abandon(&self) {
        if let Some(job) = self.job().take() {
            job.abort(Escalation::cancelled(&self.function));
        }
    }
}

/// A job whose pool signalled overload, retried on every supervisor tick until its deadline.
///
/// A retry timeout too large to be represented as a deadline retries forever.
pub(crate) struct DeferredAssignment {
    engine: Arc<Engine>,
    pool: PoolId,
    name: Arc<str>,
    job: Mutex<Option<Job>>,
    deadline: Option<Instant>,
    retry_timeout: Duration,
}

impl DeferredAssignment {
    pub(crate) fn new(engine: Arc<Engine>, pool: PoolId, job: Job, now: Instant, retry_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(format!("deferred:{}", job.name())),
            engine,
            pool,
            job: Mutex::new(Some(job)),
            deadline: now.checked_add(retry_timeout),
            retry_timeout,
        })
    }

    fn job(&self) -> MutexGuard<'_, Option<Job>> {
        self.job.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Asset for DeferredAssignment {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, now: Instant) -> Result<AssetStatus, GenericError> {
        let mut slot = self.job();
        let Some(job) = slot.take() else {
            return Ok(AssetStatus::Resolved);
        };

        let pool = self.engine.pool(self.pool);
        match pool.assign(job) {
            Ok(()) => {
                trace!(pool = pool.name(), "Deferred assignment accepted.");
                Ok(AssetStatus::Resolved)
            }
            Err(signal) => {
                let job = signal.into_job();
                if self.deadline.is_some_and(|deadline| now >= deadline) {
                    drop(slot);
                    counter!("skein_supervisor_timeouts_total").increment(1);
                    job.abort(Escalation::Timeout {
                        subject: Arc::from(pool.name()),
                        after: self.retry_timeout,
                    });
                    Ok(AssetStatus::Resolved)
                } else {
                    *slot = Some(job);
                    Ok(AssetStatus::Pending)
                }
            }
        }
    }

    fn abandon(&self) {
        if let Some(job) = self.job().take() {
            let pool: Arc<str> = Arc::from(self.engine.pool(self.pool).name());
            job.abort(Escalation::pool_failure(
                &pool,
                "runtime stopped before the job could be assigned",
            ));
        }
    }
}
