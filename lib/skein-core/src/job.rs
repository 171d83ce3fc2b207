//! Jobs.
//!
//! A job is the unit a worker pool schedules. Most jobs carry a flow: a stack of functions still to run, which the job
//! runs one after another, trampolining through each function's continuation, until the flow ends, suspends on a
//! resource, or needs to move to another pool.
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, ThreadId},
};

use skein_error::{from_panic_payload, generic_error};
use tracing::{debug, trace, warn};

use crate::{
    context::{FunctionContext, Instigation, Next},
    escalation::Escalation,
    flow::{process_handler, FlowGroup, FlowState},
    graph::{FunctionId, FunctionNode, PoolId, ResourceId},
    process::{Admission, ProcessState},
    resource::{
        registry::{self, Dependencies, LocalResources},
        Completion,
    },
    runtime::Engine,
    Parameter,
};

/// A unit of work assigned to a worker pool.
pub struct Job {
    kind: JobKind,
}

enum JobKind {
    Flow(FlowJob),
    Task(TaskJob),
}

struct TaskJob {
    name: Arc<str>,
    origin: ThreadId,
    run: Box<dyn FnOnce() + Send>,
    on_abort: Option<Box<dyn FnOnce(Escalation) + Send>>,
}

impl Job {
    /// Creates a job that runs the given closure.
    ///
    /// The job's origin is the current thread. A panic in the closure is not caught, and unwinds whatever worker runs
    /// the job.
    pub fn from_fn<N, F>(name: N, f: F) -> Self
    where
        N: Into<Arc<str>>,
        F: FnOnce() + Send + 'static,
    {
        Self {
            kind: JobKind::Task(TaskJob {
                name: name.into(),
                origin: thread::current().id(),
                run: Box::new(f),
                on_abort: None,
            }),
        }
    }

    /// Sets the closure called, instead of running the job, if the job is aborted.
    pub fn on_abort<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Escalation) + Send + 'static,
    {
        if let JobKind::Task(task) = &mut self.kind {
            task.on_abort = Some(Box::new(f));
        }
        self
    }

    pub(crate) fn flow(job: FlowJob) -> Self {
        Self {
            kind: JobKind::Flow(job),
        }
    }

    /// Returns the name of the job: the name of the next function it runs, for flow jobs.
    pub fn name(&self) -> &str {
        match &self.kind {
            JobKind::Flow(job) => job.name(),
            JobKind::Task(task) => &task.name,
        }
    }

    /// Returns the thread the job originates from: the thread that invoked its process, for flow jobs.
    pub fn origin(&self) -> ThreadId {
        match &self.kind {
            JobKind::Flow(job) => job.flow.process.origin(),
            JobKind::Task(task) => task.origin,
        }
    }

    /// Runs the job on the current thread.
    pub fn run(self) {
        match self.kind {
            JobKind::Flow(job) => job.run(),
            JobKind::Task(task) => (task.run)(),
        }
    }

    /// Aborts the job without running it.
    ///
    /// The escalation terminates the job's process, for flow jobs.
    pub fn abort(self, escalation: Escalation) {
        match self.kind {
            JobKind::Flow(job) => job.abort(escalation),
            JobKind::Task(task) => match task.on_abort {
                Some(on_abort) => on_abort(escalation),
                None => debug!(job = %task.name, escalation = %escalation, "Aborted job."),
            },
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.name()).finish()
    }
}

pub(crate) struct Frame {
    function: FunctionId,
    parameter: Parameter,
    escalation: Option<Escalation>,
}

impl Frame {
    pub(crate) fn new(function: FunctionId, parameter: Parameter) -> Self {
        Self {
            function,
            parameter,
            escalation: None,
        }
    }

    pub(crate) fn recovery(function: FunctionId, escalation: Escalation) -> Self {
        Self {
            function,
            parameter: None,
            escalation: Some(escalation),
        }
    }
}

enum Step {
    Continue,
    Suspend(Arc<Completion>, ResourceId),
    Done,
}

/// A job carrying one flow of a process.
pub(crate) struct FlowJob {
    engine: Arc<Engine>,
    flow: Arc<FlowState>,
    frames: Vec<Frame>,
    locals: LocalResources,
    finished: bool,
}

impl FlowJob {
    pub(crate) fn new(engine: Arc<Engine>, flow: Arc<FlowState>, frame: Frame) -> Self {
        Self {
            engine,
            flow,
            frames: vec![frame],
            locals: LocalResources::default(),
            finished: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self.frames.last() {
            Some(frame) => self.engine.graph.function_name(frame.function),
            None => "<finished>",
        }
    }

    /// Returns the pool the next function runs on.
    pub(crate) fn pool(&self) -> Option<PoolId> {
        self.frames
            .last()
            .map(|frame| self.engine.graph.function(frame.function).pool)
    }

    pub(crate) fn process(&self) -> &Arc<ProcessState> {
        &self.flow.process
    }

    pub(crate) fn run(mut self) {
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Done => return,
                Step::Suspend(completion, resource) => {
                    let engine = Arc::clone(&self.engine);
                    engine.suspend(self, completion, resource);
                    return;
                }
            }

            let Some(pool) = self.pool() else {
                self.finish(None);
                return;
            };
            if !self.engine.pool(pool).runs_inline(self.flow.process.origin()) {
                let engine = Arc::clone(&self.engine);
                engine.dispatch(self);
                return;
            }
        }
    }

    fn step(&mut self) -> Step {
        let Some(frame) = self.frames.pop() else {
            self.finish(None);
            return Step::Done;
        };
        let engine = Arc::clone(&self.engine);
        let node = engine.graph.function(frame.function);
        let process = Arc::clone(&self.flow.process);

        match process.admit() {
            Admission::Run => {}
            Admission::Cancel => {
                debug!(process_id = %process.id(), function = %node.name, "Dropping job of cancelled process.");
                let escalation = Escalation::cancelled(&node.name);
                self.release_locals(Some(&escalation));
                self.finish(Some(escalation));
                return Step::Done;
            }
            Admission::Discard => {
                trace!(process_id = %process.id(), function = %node.name, "Dropping job of completed process.");
                self.release_locals(None);
                self.finish(None);
                return Step::Done;
            }
        }

        let dependencies = match registry::resolve_dependencies(&engine, &process, &mut self.locals, &node.dependencies) {
            Dependencies::Ready(values) => values,
            Dependencies::Pending(resource, completion) => {
                self.frames.push(frame);
                return Step::Suspend(completion, resource);
            }
            Dependencies::Failed(escalation) => {
                self.release_locals(Some(&escalation));
                return self.escalate(node, escalation);
            }
        };

        trace!(process_id = %process.id(), function = %node.name, "Running function.");
        let mut ctx = FunctionContext::new(
            &engine,
            &process,
            node,
            frame.parameter,
            frame.escalation,
            &dependencies,
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| node.body.execute(&mut ctx)))
            .unwrap_or_else(|payload| Err(from_panic_payload(payload)));
        let instigations = ctx.into_instigations();
        drop(dependencies);

        let outcome = result
            .map_err(|e| Escalation::function(&node.name, e))
            .and_then(|next| self.push_continuation(node, next));

        match outcome {
            Ok(()) => {
                self.release_locals(None);
                self.apply_instigations(node, instigations)
            }
            Err(escalation) => {
                self.release_locals(Some(&escalation));
                self.escalate(node, escalation)
            }
        }
    }

    fn push_continuation(&mut self, node: &FunctionNode, next: Next) -> Result<(), Escalation> {
        match next {
            Next::Linked(parameter) => {
                if let Some(next) = node.next {
                    self.frames.push(Frame::new(next, parameter));
                }
                Ok(())
            }
            Next::Flow(index, parameter) => {
                let flow = flow_at(node, index)?;
                self.frames.push(Frame::new(flow, parameter));
                Ok(())
            }
            Next::Stop => Ok(()),
        }
    }

    fn apply_instigations(&mut self, node: &FunctionNode, instigations: Vec<Instigation>) -> Step {
        let process = &self.flow.process;
        let mut sequential = Vec::new();
        for instigation in instigations {
            match instigation {
                Instigation::Sequential(flow, parameter) => sequential.push(Frame::new(flow, parameter)),
                Instigation::Parallel(flow, parameter) => {
                    self.engine
                        .spawn_flow(process, None, Frame::new(flow, parameter));
                }
                Instigation::Join(children, callback) => {
                    let group = FlowGroup::new(process, &node.name, children.len(), callback);
                    if children.is_empty() {
                        group.complete_empty(&self.engine);
                        continue;
                    }
                    for (flow, parameter) in children {
                        self.engine
                            .spawn_flow(process, Some(Arc::clone(&group)), Frame::new(flow, parameter));
                    }
                }
            }
        }

        // Sequential flows run before the rest of this flow, in the order they were instigated.
        self.frames.extend(sequential.into_iter().rev());
        Step::Continue
    }

    fn escalate(&mut self, node: &FunctionNode, escalation: Escalation) -> Step {
        let process = Arc::clone(&self.flow.process);
        debug!(process_id = %process.id(), function = %node.name, escalation = %escalation, "Function escalated.");

        if let Some(handler) = node.handlers.iter().find(|h| h.matcher.matches(&escalation)) {
            self.frames.push(Frame::recovery(handler.recovery, escalation));
            return Step::Continue;
        }

        // Escalations of a flow instigated with a callback go to the callback.
        if self.flow.group.is_some() {
            self.finish(Some(escalation));
            return Step::Done;
        }

        if let Some(recovery) = process_handler(&self.engine, &escalation) {
            self.frames.clear();
            self.frames.push(Frame::recovery(recovery, escalation));
            return Step::Continue;
        }

        process.terminate(&self.engine, escalation);
        self.finish(None);
        Step::Done
    }

    pub(crate) fn abort(mut self, escalation: Escalation) {
        warn!(process_id = %self.flow.process.id(), job = self.name(), escalation = %escalation, "Job aborted.");
        self.release_locals(Some(&escalation));
        self.flow.process.terminate(&self.engine, escalation);
        self.finish(None);
    }

    fn finish(&mut self, outcome: Option<Escalation>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.frames.clear();
        self.flow.finish(&self.engine, outcome);
    }

    fn release_locals(&mut self, cause: Option<&Escalation>) {
        for (id, cell) in self.locals.take_all() {
            if let Some(value) = cell.value() {
                registry::release(&self.engine, id, value, cell.owner(), cause);
            }
        }
    }
}

impl Drop for FlowJob {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pool: Arc<str> = match self.pool() {
            Some(pool) => Arc::from(self.engine.pool(pool).name()),
            None => Arc::from("unknown"),
        };
        let escalation = Escalation::pool_failure(&pool, "job was dropped without running");
        self.release_locals(Some(&escalation));
        self.flow.process.terminate(&self.engine, escalation);
        self.finish(None);
    }
}

fn flow_at(node: &FunctionNode, index: usize) -> Result<FunctionId, Escalation> {
    node.flows.get(index).copied().ok_or_else(|| {
        Escalation::function(
            &node.name,
            generic_error!("'{}' has no flow at index {}.", node.name, index),
        )
    })
}
