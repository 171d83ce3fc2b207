//! Processes.
//!
//! A process is one invocation of the graph: a root flow, every flow instigated from it, and the process-scope
//! resources they share. It completes once all of its flows have finished and every asynchronous process-scope
//! acquisition has settled, or as soon as an escalation goes unhandled.
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use skein_error::from_panic_payload;
use tracing::{debug, info, warn};

use crate::{
    diagnostics::Diagnostic,
    escalation::Escalation,
    resource::registry::{self, ProcessResources},
    runtime::Engine,
};

/// Identifier of a process, unique within a runtime.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProcessId(pub(crate) u64);

impl ProcessId {
    /// Returns the numeric value of the identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessStatus {
    /// Invoked, but no function has run yet.
    Created,

    /// At least one function has run.
    Running,

    /// Cancelled, and draining: jobs that have not started are dropped.
    Cancelling,

    /// Finished. The completion callback has been invoked.
    Completed,
}

impl ProcessStatus {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Cancelling => 2,
            Self::Completed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Cancelling,
            _ => Self::Completed,
        }
    }
}

/// Outcome of a completed process.
#[derive(Clone, Debug, Default)]
pub struct ProcessOutcome {
    escalation: Option<Escalation>,
}

impl ProcessOutcome {
    /// Returns `true` if the process completed without an unhandled escalation.
    pub fn is_success(&self) -> bool {
        self.escalation.is_none()
    }

    /// Returns the escalation that ended the process, if any.
    pub fn escalation(&self) -> Option<&Escalation> {
        self.escalation.as_ref()
    }

    /// Consumes the outcome, returning the escalation that ended the process, if any.
    pub fn into_escalation(self) -> Option<Escalation> {
        self.escalation
    }
}

pub(crate) type CompletionCallback = Box<dyn FnOnce(&ProcessOutcome) + Send>;

/// What a job should do with its next function, given the state of its process.
pub(crate) enum Admission {
    Run,
    Cancel,
    Discard,
}

struct Inner {
    failure: Option<Escalation>,
    outcome: Option<ProcessOutcome>,
    callback: Option<CompletionCallback>,
    released: bool,
}

pub(crate) struct ProcessState {
    id: ProcessId,
    origin: ThreadId,
    status: AtomicU8,
    inner: Mutex<Inner>,
    completed: Condvar,
    active_flows: AtomicUsize,
    outstanding: AtomicUsize,
    pub(crate) resources: ProcessResources,
}

impl ProcessState {
    pub(crate) fn new(id: ProcessId, callback: CompletionCallback, resource_count: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            origin: thread::current().id(),
            status: AtomicU8::new(ProcessStatus::Created.as_u8()),
            inner: Mutex::new(Inner {
                failure: None,
                outcome: None,
                callback: Some(callback),
                released: false,
            }),
            completed: Condvar::new(),
            active_flows: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            resources: ProcessResources::new(resource_count),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn origin(&self) -> ThreadId {
        self.origin
    }

    pub(crate) fn status(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.status(), ProcessStatus::Created | ProcessStatus::Running)
    }

    pub(crate) fn admit(&self) -> Admission {
        let _ = self.status.compare_exchange(
            ProcessStatus::Created.as_u8(),
            ProcessStatus::Running.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match self.status() {
            ProcessStatus::Created | ProcessStatus::Running => Admission::Run,
            ProcessStatus::Cancelling => Admission::Cancel,
            ProcessStatus::Completed => Admission::Discard,
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        let _inner = self.inner();
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if !matches!(
                ProcessStatus::from_u8(current),
                ProcessStatus::Created | ProcessStatus::Running
            ) {
                return false;
            }
            match self.status.compare_exchange(
                current,
                ProcessStatus::Cancelling.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(process_id = %self.id, "Process cancelled.");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn flow_started(&self) {
        self.active_flows.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn flow_finished(&self, engine: &Engine) {
        if self.active_flows.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.try_complete(engine);
        }
    }

    pub(crate) fn acquisition_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn acquisition_settled(&self, engine: &Engine) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.try_complete(engine);
        }
    }

    /// Records an escalation as the process's failure, unless one was already recorded.
    pub(crate) fn fold(&self, escalation: Escalation) {
        let mut inner = self.inner();
        if inner.failure.is_none() {
            inner.failure = Some(escalation);
        }
    }

    /// Completes the process immediately with the given escalation, unless it has already completed.
    pub(crate) fn terminate(&self, engine: &Engine, escalation: Escalation) {
        warn!(process_id = %self.id, escalation = %escalation, "Process terminated by unhandled escalation.");
        self.complete(engine, Some(escalation));
        self.try_release(engine);
    }

    fn quiescent(&self) -> bool {
        self.active_flows.load(Ordering::SeqCst) == 0 && self.outstanding.load(Ordering::SeqCst) == 0
    }

    fn try_complete(&self, engine: &Engine) {
        if !self.quiescent() {
            return;
        }
        self.try_release(engine);
        self.complete(engine, None);
    }

    fn try_release(&self, engine: &Engine) {
        if !self.quiescent() {
            return;
        }
        let cause = {
            let mut inner = self.inner();
            if inner.released {
                return;
            }
            inner.released = true;
            inner
                .outcome
                .as_ref()
                .and_then(|o| o.escalation.clone())
                .or_else(|| inner.failure.clone())
        };

        let handles = self.resources.take_all();
        debug!(process_id = %self.id, handles = handles.len(), "Releasing process-scope resources.");
        for (id, cell) in handles.into_iter().rev() {
            if let Some(value) = cell.value() {
                registry::release(engine, id, value, cell.owner(), cause.as_ref());
            }
        }
    }

    /// Completes the process, unless it has already completed.
    ///
    /// Without an escalation of its own, the process completes with the failure folded into it, if any. Waiters only
    /// see the outcome once the completion callback has returned.
    fn complete(&self, engine: &Engine, escalation: Option<Escalation>) -> bool {
        let (callback, escalation) = {
            let mut inner = self.inner();
            if self.status() == ProcessStatus::Completed {
                return false;
            }
            self.status.store(ProcessStatus::Completed.as_u8(), Ordering::SeqCst);
            let escalation = escalation.or_else(|| inner.failure.take());
            (inner.callback.take(), escalation)
        };
        let outcome = ProcessOutcome { escalation };

        match &outcome.escalation {
            None => info!(process_id = %self.id, "Process completed."),
            Some(escalation) => info!(process_id = %self.id, escalation = %escalation, "Process completed with an escalation."),
        }

        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))) {
                engine.diagnostics.emit(Diagnostic::CallbackPanicked {
                    process_id: self.id.0,
                    error: Arc::from(from_panic_payload(payload).to_string()),
                });
            }
        }

        {
            let mut inner = self.inner();
            inner.outcome = Some(outcome);
            self.completed.notify_all();
        }
        engine.wake_host(self.origin);
        true
    }

    pub(crate) fn outcome(&self) -> Option<ProcessOutcome> {
        self.inner().outcome.clone()
    }

    fn wait_for_outcome(&self, timeout: Option<Duration>) -> Option<ProcessOutcome> {
        let mut inner = self.inner();
        match timeout {
            None => loop {
                if let Some(outcome) = &inner.outcome {
                    return Some(outcome.clone());
                }
                inner = self.completed.wait(inner).unwrap_or_else(|e| e.into_inner());
            },
            Some(timeout) => {
                let (inner, _) = self
                    .completed
                    .wait_timeout_while(inner, timeout, |inner| inner.outcome.is_none())
                    .unwrap_or_else(|e| e.into_inner());
                inner.outcome.clone()
            }
        }
    }
}

/// A handle to an invoked process.
#[derive(Clone)]
pub struct ProcessHandle {
    engine: Arc<Engine>,
    process: Arc<ProcessState>,
}

impl ProcessHandle {
    pub(crate) fn new(engine: Arc<Engine>, process: Arc<ProcessState>) -> Self {
        Self { engine, process }
    }

    /// Returns the identifier of the process.
    pub fn id(&self) -> ProcessId {
        self.process.id()
    }

    /// Returns the current status of the process.
    pub fn status(&self) -> ProcessStatus {
        self.process.status()
    }

    /// Returns `true` if the process has completed.
    pub fn is_complete(&self) -> bool {
        self.status() == ProcessStatus::Completed
    }

    /// Returns the outcome of the process, if it has completed.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.process.outcome()
    }

    /// Cancels the process.
    ///
    /// Functions already running finish, but no job that has not started yet runs any further function, and the
    /// process completes with a `Cancelled` escalation once everything has drained. Cancelling a process that has
    /// already completed, or is already cancelling, does nothing and returns `false`.
    pub fn cancel(&self) -> bool {
        self.process.cancel()
    }

    /// Waits for the process to complete.
    ///
    /// When called on the thread that invoked the process, and the runtime has a thread affinity pool, jobs bound to
    /// this thread are run while waiting.
    pub fn wait(&self) -> ProcessOutcome {
        loop {
            if let Some(outcome) = self.wait_inner(None) {
                return outcome;
            }
        }
    }

    /// Waits up to `timeout` for the process to complete.
    ///
    /// Returns `None` if the process has not completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessOutcome> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> Option<ProcessOutcome> {
        match self.engine.affinity_pool() {
            Some(pool) if thread::current().id() == self.process.origin() => {
                let deadline = timeout.and_then(|timeout| std::time::Instant::now().checked_add(timeout));
                let process = &self.process;
                pool.pump_until(|| process.outcome().is_some(), deadline);
                self.process.outcome()
            }
            _ => self.process.wait_for_outcome(timeout),
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.process.id())
            .field("status", &self.process.status())
            .finish()
    }
}
