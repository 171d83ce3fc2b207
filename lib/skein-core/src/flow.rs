//! Flows and joins.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use skein_error::from_panic_payload;
use tracing::{debug, trace};

use crate::{
    context::FlowCallback,
    diagnostics::Diagnostic,
    escalation::Escalation,
    graph::FunctionId,
    job::Frame,
    process::{ProcessState, ProcessStatus},
    runtime::Engine,
};

/// One flow of a process, shared by every job that carries it.
pub(crate) struct FlowState {
    pub(crate) process: Arc<ProcessState>,
    pub(crate) group: Option<Arc<FlowGroup>>,
}

impl FlowState {
    pub(crate) fn new(process: &Arc<ProcessState>, group: Option<Arc<FlowGroup>>) -> Arc<Self> {
        Arc::new(Self {
            process: Arc::clone(process),
            group,
        })
    }

    /// Finishes the flow, with the escalation that ended it, if any.
    ///
    /// Flows instigated with a callback report to their group. Any other flow that ends with an escalation has it
    /// folded into its process's outcome.
    pub(crate) fn finish(&self, engine: &Arc<Engine>, outcome: Option<Escalation>) {
        match (&self.group, outcome) {
            (Some(group), outcome) => group.child_finished(engine, outcome),
            (None, Some(escalation)) => self.process.fold(escalation),
            (None, None) => {}
        }
        self.process.flow_finished(engine);
    }
}

/// The flows instigated together with a single callback.
pub(crate) struct FlowGroup {
    process: Arc<ProcessState>,
    instigator: Arc<str>,
    remaining: AtomicUsize,
    first_failure: Mutex<Option<Escalation>>,
    callback: Mutex<Option<FlowCallback>>,
}

impl FlowGroup {
    pub(crate) fn new(
        process: &Arc<ProcessState>, instigator: &Arc<str>, children: usize, callback: FlowCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            process: Arc::clone(process),
            instigator: Arc::clone(instigator),
            remaining: AtomicUsize::new(children),
            first_failure: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub(crate) fn child_finished(&self, engine: &Arc<Engine>, outcome: Option<Escalation>) {
        if let Some(escalation) = outcome {
            let mut first_failure = self.first_failure.lock().unwrap_or_else(|e| e.into_inner());
            if first_failure.is_none() {
                *first_failure = Some(escalation);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.complete(engine);
        }
    }

    /// Completes a group that was instigated without any flows.
    pub(crate) fn complete_empty(&self, engine: &Arc<Engine>) {
        self.complete(engine);
    }

    fn complete(&self, engine: &Arc<Engine>) {
        let Some(callback) = self.callback.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let failure = self.first_failure.lock().unwrap_or_else(|e| e.into_inner()).take();

        match self.process.status() {
            ProcessStatus::Created | ProcessStatus::Running => {}
            ProcessStatus::Cancelling => {
                trace!(process_id = %self.process.id(), instigator = %self.instigator, "Skipping callback of cancelled process.");
                if let Some(escalation) = failure {
                    self.process.fold(escalation);
                }
                return;
            }
            ProcessStatus::Completed => return,
        }

        // The caller's own flow is still active here, so the process cannot complete under the callback.
        match panic::catch_unwind(AssertUnwindSafe(|| callback(failure))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => escalate(engine, &self.process, Escalation::function(&self.instigator, e)),
            Err(payload) => {
                let error = from_panic_payload(payload);
                engine.diagnostics.emit(Diagnostic::CallbackPanicked {
                    process_id: self.process.id().as_u64(),
                    error: Arc::from(error.to_string()),
                });
                escalate(engine, &self.process, Escalation::function(&self.instigator, error));
            }
        }
    }
}

/// Returns the recovery function of the first process-level handler matching the escalation.
pub(crate) fn process_handler(engine: &Engine, escalation: &Escalation) -> Option<FunctionId> {
    engine
        .graph
        .process_handlers()
        .iter()
        .find(|handler| handler.matcher.matches(escalation))
        .map(|handler| handler.recovery)
}

/// Escalates a failure raised outside of any flow to the process-level handlers, terminating the process if none
/// matches.
pub(crate) fn escalate(engine: &Arc<Engine>, process: &Arc<ProcessState>, escalation: Escalation) {
    match process_handler(engine, &escalation) {
        Some(recovery) => {
            debug!(process_id = %process.id(), escalation = %escalation, "Recovering from escalation in a new flow.");
            engine.spawn_flow(process, None, Frame::recovery(recovery, escalation));
        }
        None => process.terminate(engine, escalation),
    }
}
