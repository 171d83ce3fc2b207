//! The runtime.
//!
//! A runtime ties a built graph to the worker pools, supervisors and execution strategies that run it. Everything the
//! engine needs hangs off the runtime value: there is no process-global state, and several runtimes can coexist.
use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::ThreadId,
    time::Duration,
};

use quanta::Clock;
use skein_error::from_panic_payload;
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info, trace};

use crate::{
    config::{PoolKind, RuntimeConfiguration},
    diagnostics::{Diagnostic, Diagnostics},
    flow::{FlowGroup, FlowState},
    graph::{FunctionId, Graph, GraphBuilder, GraphError, PoolId, ResourceId},
    job::{FlowJob, Frame, Job},
    pool::{FixedWorkerPool, PassivePool, PoolError, ThreadAffinityPool, WorkerPool},
    process::{ProcessHandle, ProcessId, ProcessOutcome, ProcessState},
    resource::{Completion, Waiter as _},
    strategy::{DefaultExecutionStrategyProvider, ExecutionStrategy, ExecutionStrategyProvider, PoolDescriptor},
    supervisor::{on_supervisor_thread, Asset, AssetKey, DeferredAssignment, PendingJob, Supervisor, SupervisorError},
    Parameter, Value,
};

/// Name of the worker pool created for runtimes without a pool of their own threads to resume passive work on.
pub const RESUME_POOL: &str = "skein-resume";

/// Runtime errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RuntimeError {
    /// The graph could not be built.
    #[snafu(display("Failed to build graph: {}", source))]
    InvalidGraph {
        /// Error source.
        source: GraphError,
    },

    /// A worker pool could not be started.
    #[snafu(display("Failed to start worker pool: {}", source))]
    StartPool {
        /// Error source.
        source: PoolError,
    },

    /// A supervisor could not be started.
    #[snafu(display("Failed to start supervisor: {}", source))]
    StartSupervisor {
        /// Error source.
        source: SupervisorError,
    },

    /// Two worker pools share a name.
    #[snafu(display("Worker pool '{}' was declared more than once.", name))]
    DuplicatePool {
        /// Name of the pool.
        name: String,
    },

    /// More than one thread affinity pool was declared.
    #[snafu(display(
        "Thread affinity pool '{}' cannot be added: runtime already has thread affinity pool '{}'.",
        name,
        existing
    ))]
    DuplicateThreadAffinityPool {
        /// Name of the rejected pool.
        name: String,

        /// Name of the pool already declared.
        existing: String,
    },

    /// The configured fallback pool does not exist, or has no threads of its own.
    #[snafu(display("Fallback pool '{}' does not exist, or cannot run jobs on threads of its own.", name))]
    UnknownFallbackPool {
        /// Name of the pool.
        name: String,
    },

    /// No function has the given name.
    #[snafu(display("No function named '{}'.", name))]
    UnknownFunction {
        /// Name of the function.
        name: String,
    },
}

/// Shared state of a runtime.
pub(crate) struct Engine {
    pub(crate) graph: Graph,
    pub(crate) clock: Clock,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) strategies: Vec<ExecutionStrategy>,
    pub(crate) default_sourcing_timeout: Duration,
    pools: Vec<Arc<dyn WorkerPool>>,
    affinity: Option<Arc<ThreadAffinityPool>>,
    fallback: Option<PoolId>,
    supervisors: Vec<Supervisor>,
    overload_retry_timeout: Duration,
    next_process_id: AtomicU64,
    next_supervisor: AtomicUsize,
    stopped: AtomicBool,
}

impl Engine {
    pub(crate) fn pool(&self, id: PoolId) -> &Arc<dyn WorkerPool> {
        &self.pools[id.0]
    }

    pub(crate) fn affinity_pool(&self) -> Option<&Arc<ThreadAffinityPool>> {
        self.affinity.as_ref()
    }

    /// Wakes the given thread, if it is waiting on a process while pumping its thread affinity mailbox.
    pub(crate) fn wake_host(&self, thread: ThreadId) {
        if let Some(affinity) = &self.affinity {
            affinity.wake(thread);
        }
    }

    fn supervisor_for(&self, hint: usize) -> &Supervisor {
        &self.supervisors[hint % self.supervisors.len()]
    }

    pub(crate) fn deregister_asset(&self, key: AssetKey) -> bool {
        self.supervisors
            .get(key.supervisor())
            .is_some_and(|supervisor| supervisor.deregister_asset(key))
    }

    /// Assigns a flow job to the pool of its next function.
    ///
    /// Work for a passive pool that would otherwise run on a supervisor thread goes to the fallback pool instead, and
    /// work refused by an overloaded pool is retried from a supervisor until the overload retry timeout.
    pub(crate) fn dispatch(self: &Arc<Self>, job: FlowJob) {
        let Some(target) = job.pool() else {
            job.run();
            return;
        };

        let pool = match self.fallback {
            Some(fallback) if self.pools[target.0].is_passive() && on_supervisor_thread() => fallback,
            _ => target,
        };
        trace!(job = job.name(), pool = self.pools[pool.0].name(), "Dispatching job.");

        if let Err(signal) = self.pools[pool.0].assign(Job::flow(job)) {
            debug!(pool = signal.pool(), "Worker pool is overloaded. Deferring assignment.");
            let deferred = DeferredAssignment::new(
                Arc::clone(self),
                pool,
                signal.into_job(),
                self.clock.now(),
                self.overload_retry_timeout,
            );
            self.supervisor_for(pool.0).register_asset(deferred);
        }
    }

    /// Suspends a flow job until the given resource handle settles.
    pub(crate) fn suspend(self: &Arc<Self>, job: FlowJob, completion: Arc<Completion>, resource: ResourceId) {
        debug!(job = job.name(), resource = %completion.resource(), "Suspending job on pending resource.");
        let pending = PendingJob::new(Arc::clone(self), job, Arc::clone(&completion));
        let key = self.supervisor_for(resource.0).register_asset(pending.clone());
        pending.set_key(key);
        if !completion.add_waiter(pending.clone()) {
            pending.wake();
        }
    }

    /// Starts a new flow in the given process.
    pub(crate) fn spawn_flow(self: &Arc<Self>, process: &Arc<ProcessState>, group: Option<Arc<FlowGroup>>, frame: Frame) {
        process.flow_started();
        let flow = FlowState::new(process, group);
        self.dispatch(FlowJob::new(Arc::clone(self), flow, frame));
    }

    /// Stops supervisors, then worker pools, then drains every resource pool.
    ///
    /// Only the first call does anything.
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for supervisor in &self.supervisors {
            supervisor.stop();
        }
        for pool in &self.pools {
            pool.stop();
        }

        for (idx, resource) in self.graph.resources().enumerate() {
            let Some(pool) = &resource.pool else {
                continue;
            };
            let drained = pool.drain();
            debug!(resource = %resource.name, pool = pool.name(), drained = drained.len(), "Drained resource pool.");
            for value in drained {
                self.discard(ResourceId(idx), value);
            }
        }
        info!("Runtime stopped.");
    }

    /// Discards a resource value through its source, reporting failures as diagnostics.
    pub(crate) fn discard(&self, id: ResourceId, value: Value) {
        let node = self.graph.resource(id);
        let result = panic::catch_unwind(AssertUnwindSafe(|| node.source.discard(value)))
            .unwrap_or_else(|payload| Err(from_panic_payload(payload)));
        if let Err(e) = result {
            self.diagnostics.emit(Diagnostic::DiscardFailed {
                resource: Arc::clone(&node.name),
                error: Arc::from(format!("{:#}", e)),
            });
        }
    }
}

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfiguration,
    pools: Vec<Arc<dyn WorkerPool>>,
    affinity: Vec<Arc<ThreadAffinityPool>>,
    strategy_provider: Arc<dyn ExecutionStrategyProvider>,
    clock: Clock,
}

impl RuntimeBuilder {
    /// Creates a new `RuntimeBuilder` from the given configuration.
    ///
    /// Worker pools declared in the configuration are created when the runtime is built, ahead of any pool added
    /// through the builder.
    pub fn new(config: RuntimeConfiguration) -> Self {
        Self {
            config,
            pools: Vec::new(),
            affinity: Vec::new(),
            strategy_provider: Arc::new(DefaultExecutionStrategyProvider),
            clock: Clock::new(),
        }
    }

    /// Adds a worker pool.
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pools.push(pool);
        self
    }

    /// Adds a thread affinity pool with the given name.
    ///
    /// A runtime has at most one thread affinity pool.
    pub fn with_thread_affinity_pool<N: Into<Arc<str>>>(mut self, name: N) -> Self {
        let pool = Arc::new(ThreadAffinityPool::new(name));
        self.pools.push(pool.clone());
        self.affinity.push(pool);
        self
    }

    /// Sets the provider of the execution strategies available to functions.
    pub fn with_strategy_provider<P>(mut self, provider: P) -> Self
    where
        P: ExecutionStrategyProvider + 'static,
    {
        self.strategy_provider = Arc::new(provider);
        self
    }

    /// Sets the clock used for timeouts.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the runtime, resolving the graph against its pools and execution strategies.
    ///
    /// # Errors
    ///
    /// If the graph does not resolve, two pools share a name, more than one thread affinity pool is declared, or the
    /// fallback pool is unusable, an error is returned.
    pub fn build(mut self, graph: GraphBuilder) -> Result<Runtime, RuntimeError> {
        let mut pools = Vec::with_capacity(self.config.pools.len() + self.pools.len());
        for pool in std::mem::take(&mut self.config.pools) {
            let built: Arc<dyn WorkerPool> = match pool.kind {
                PoolKind::Fixed => Arc::new(FixedWorkerPool::new(
                    pool.name,
                    pool.workers,
                    pool.queue_capacity,
                    pool.overload_policy,
                )),
                PoolKind::Single => Arc::new(FixedWorkerPool::new(
                    pool.name,
                    1,
                    pool.queue_capacity,
                    pool.overload_policy,
                )),
                PoolKind::Passive => Arc::new(PassivePool::new(pool.name)),
                PoolKind::ThreadAffinity => {
                    let pool = Arc::new(ThreadAffinityPool::new(pool.name));
                    self.affinity.push(Arc::clone(&pool));
                    pool
                }
            };
            pools.push(built);
        }
        pools.append(&mut self.pools);

        if let [first, second, ..] = self.affinity.as_slice() {
            return Err(RuntimeError::DuplicateThreadAffinityPool {
                name: second.name().to_string(),
                existing: first.name().to_string(),
            });
        }
        let affinity = self.affinity.pop();

        let mut seen = HashSet::new();
        for pool in &pools {
            if !seen.insert(pool.name().to_string()) {
                return Err(RuntimeError::DuplicatePool {
                    name: pool.name().to_string(),
                });
            }
        }

        let own_threads = |pool: &Arc<dyn WorkerPool>| {
            !pool.is_passive() && !affinity.as_ref().is_some_and(|a| a.name() == pool.name())
        };
        let fallback = match &self.config.fallback_pool {
            Some(name) => Some(
                pools
                    .iter()
                    .position(|pool| pool.name() == name.as_str() && own_threads(pool))
                    .map(PoolId)
                    .ok_or_else(|| RuntimeError::UnknownFallbackPool { name: name.clone() })?,
            ),
            None => pools.iter().position(own_threads).map(PoolId),
        };

        let descriptors = pools
            .iter()
            .map(|pool| PoolDescriptor {
                name: Arc::from(pool.name()),
                workers: pool.workers(),
            })
            .collect::<Vec<_>>();
        let strategies = self.strategy_provider.strategies(&descriptors);

        let pool_names = descriptors.iter().map(|d| Arc::clone(&d.name)).collect::<Vec<_>>();
        let strategy_names = strategies.iter().map(|s| Arc::from(s.name())).collect::<Vec<_>>();
        let graph = graph.build(&pool_names, &strategy_names).context(InvalidGraph)?;

        // Supervisors never run functions, so passive work they resume needs threads from somewhere. Functions cannot
        // be assigned to this pool directly, since the graph was resolved without it.
        let fallback = match fallback {
            None if pools.iter().any(|pool| pool.is_passive()) => {
                debug!(
                    pool = RESUME_POOL,
                    "No worker pool has threads of its own. Adding a pool to resume passive work on."
                );
                pools.push(Arc::new(FixedWorkerPool::single(RESUME_POOL)));
                Some(PoolId(pools.len() - 1))
            }
            fallback => fallback,
        };

        let diagnostics = Diagnostics::default();
        for pool in &pools {
            pool.attach_diagnostics(diagnostics.clone());
        }

        let supervisors = (0..self.config.supervisors.max(1))
            .map(|index| {
                Supervisor::new(
                    index,
                    self.config.supervisor_tick_interval(),
                    self.config.max_asset_check_failures,
                    self.clock.clone(),
                    diagnostics.clone(),
                )
            })
            .collect();

        debug!(
            pools = pools.len(),
            functions = graph.function_count(),
            resources = graph.resource_count(),
            "Built runtime."
        );

        let engine = Arc::new(Engine {
            graph,
            clock: self.clock,
            diagnostics,
            strategies,
            default_sourcing_timeout: self.config.default_sourcing_timeout(),
            pools,
            affinity,
            fallback,
            supervisors,
            overload_retry_timeout: self.config.overload_retry_timeout(),
            next_process_id: AtomicU64::new(1),
            next_supervisor: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        Ok(Runtime {
            _guard: Arc::new(ShutdownGuard {
                engine: Arc::clone(&engine),
            }),
            engine,
        })
    }
}

// Stops the runtime once the last clone of it is dropped.
struct ShutdownGuard {
    engine: Arc<Engine>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if !self.engine.stopped.load(Ordering::SeqCst) {
            debug!("Runtime dropped without being stopped. Stopping it.");
            self.engine.shutdown();
        }
    }
}

/// A runtime.
///
/// Cloning a runtime is cheap, and all clones share the same engine. Dropping the last clone stops the runtime, if it
/// was not stopped already.
#[derive(Clone)]
pub struct Runtime {
    engine: Arc<Engine>,
    _guard: Arc<ShutdownGuard>,
}

impl Runtime {
    /// Starts every supervisor and worker pool.
    ///
    /// Processes may be invoked before the runtime is started: their jobs wait in the pools' queues until it is.
    ///
    /// # Errors
    ///
    /// If a supervisor or worker pool fails to start, an error is returned.
    pub fn start(&self) -> Result<(), RuntimeError> {
        for supervisor in &self.engine.supervisors {
            supervisor.start().context(StartSupervisor)?;
        }
        for pool in &self.engine.pools {
            pool.start().context(StartPool)?;
        }
        info!(
            pools = self.engine.pools.len(),
            supervisors = self.engine.supervisors.len(),
            "Runtime started."
        );
        Ok(())
    }

    /// Stops the runtime.
    ///
    /// Supervisors stop first, abandoning every suspended or deferred job. Worker pools then stop, blocking until the
    /// jobs they accepted have run, and finally every resource pool is drained. Stopping a runtime more than once does
    /// nothing.
    pub fn stop(&self) {
        self.engine.shutdown();
    }

    /// Invokes a process starting at the given function.
    ///
    /// `callback` is invoked exactly once, when the process completes, with its outcome.
    pub fn invoke_process<F>(&self, function: FunctionId, parameter: Parameter, callback: F) -> ProcessHandle
    where
        F: FnOnce(&ProcessOutcome) + Send + 'static,
    {
        let engine = &self.engine;
        let id = ProcessId(engine.next_process_id.fetch_add(1, Ordering::Relaxed));
        let process = ProcessState::new(id, Box::new(callback), engine.graph.resource_count());
        debug!(process_id = %id, function = engine.graph.function_name(function), "Invoking process.");

        engine.spawn_flow(&process, None, Frame::new(function, parameter));
        ProcessHandle::new(Arc::clone(engine), process)
    }

    /// Invokes a process starting at the function with the given name.
    ///
    /// # Errors
    ///
    /// If no function has the given name, an error is returned.
    pub fn invoke_process_by_name<F>(
        &self, function: &str, parameter: Parameter, callback: F,
    ) -> Result<ProcessHandle, RuntimeError>
    where
        F: FnOnce(&ProcessOutcome) + Send + 'static,
    {
        let id = self
            .engine
            .graph
            .function_id(function)
            .ok_or_else(|| RuntimeError::UnknownFunction {
                name: function.to_string(),
            })?;
        Ok(self.invoke_process(id, parameter, callback))
    }

    /// Registers an asset with one of the runtime's supervisors, chosen round-robin.
    pub fn register_asset(&self, asset: Arc<dyn Asset>) -> AssetKey {
        let supervisors = &self.engine.supervisors;
        let idx = self.engine.next_supervisor.fetch_add(1, Ordering::Relaxed) % supervisors.len();
        supervisors[idx].register_asset(asset)
    }

    /// Deregisters an asset without abandoning it.
    ///
    /// Returns `false` if the asset was no longer registered.
    pub fn deregister_asset(&self, key: AssetKey) -> bool {
        self.engine.deregister_asset(key)
    }

    /// Returns the graph the runtime runs.
    pub fn graph(&self) -> &Graph {
        &self.engine.graph
    }

    /// Returns the diagnostic channel of the runtime.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.engine.diagnostics
    }

    /// Returns the execution strategies available to functions.
    pub fn execution_strategies(&self) -> &[ExecutionStrategy] {
        &self.engine.strategies
    }

    /// Returns the runtime's thread affinity pool, if it has one.
    pub fn thread_affinity_pool(&self) -> Option<&Arc<ThreadAffinityPool>> {
        self.engine.affinity.as_ref()
    }

    /// Returns the clock used for timeouts.
    pub fn clock(&self) -> &Clock {
        &self.engine.clock
    }

    /// Returns the runtime's supervisors.
    pub fn supervisors(&self) -> &[Supervisor] {
        &self.engine.supervisors
    }
}

#[cfg(test)]
mod tests {
    use skein_error::generic_error;

    use super::*;
    use crate::{
        config::PoolConfiguration,
        context::Next,
        escalation::{Escalation, EscalationKind},
        graph::{FunctionSpec, ResourceSpec, Scope},
        pool::OverloadPolicy,
        resource::Sourcing,
        strategy::{NamedThreadFactory, ThreadFactory},
    };

    fn noop_graph(pool: &str) -> GraphBuilder {
        GraphBuilder::default().add_function(FunctionSpec::new("noop", pool, |_: &mut crate::context::FunctionContext<'_>| {
            Ok(Next::default())
        }))
    }

    #[test]
    fn configured_pools_are_created() {
        let mut config = RuntimeConfiguration::default();
        config.pools = vec![
            PoolConfiguration {
                name: "io".to_string(),
                kind: PoolKind::Fixed,
                workers: 2,
                queue_capacity: 8,
                overload_policy: OverloadPolicy::Queue,
            },
            PoolConfiguration {
                name: "main".to_string(),
                kind: PoolKind::Passive,
                workers: 1,
                queue_capacity: 8,
                overload_policy: OverloadPolicy::Queue,
            },
        ];

        let runtime = RuntimeBuilder::new(config).build(noop_graph("io")).unwrap();
        let names = runtime
            .execution_strategies()
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>();
        similar_asserts::assert_eq!(names, vec!["io".to_string(), "main".to_string()]);
        assert_eq!(runtime.execution_strategies()[0].thread_factories().len(), 2);
        assert_eq!(runtime.engine.fallback, Some(PoolId(0)));
    }

    #[test]
    fn duplicate_pools_are_rejected() {
        let result = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_pool(Arc::new(PassivePool::new("main")))
            .with_pool(Arc::new(FixedWorkerPool::single("main")))
            .build(noop_graph("main"));
        assert!(matches!(result, Err(RuntimeError::DuplicatePool { name }) if name == "main"));
    }

    #[test]
    fn second_thread_affinity_pool_is_rejected() {
        let result = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_thread_affinity_pool("host")
            .with_thread_affinity_pool("other")
            .build(noop_graph("host"));
        assert!(matches!(
            result,
            Err(RuntimeError::DuplicateThreadAffinityPool { name, existing }) if name == "other" && existing == "host"
        ));
    }

    #[test]
    fn fallback_pool_must_have_threads() {
        let mut config = RuntimeConfiguration::default();
        config.fallback_pool = Some("main".to_string());
        let result = RuntimeBuilder::new(config)
            .with_pool(Arc::new(PassivePool::new("main")))
            .build(noop_graph("main"));
        assert!(matches!(result, Err(RuntimeError::UnknownFallbackPool { .. })));
    }

    #[test]
    fn unresolved_graph_fails_to_build() {
        let result = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_pool(Arc::new(PassivePool::new("main")))
            .build(noop_graph("io"));
        assert!(matches!(result, Err(RuntimeError::InvalidGraph { .. })));
    }

    #[test]
    fn unknown_function_by_name() {
        let runtime = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_pool(Arc::new(PassivePool::new("main")))
            .build(noop_graph("main"))
            .unwrap();
        let result = runtime.invoke_process_by_name("missing", None, |_| {});
        assert!(matches!(result, Err(RuntimeError::UnknownFunction { name }) if name == "missing"));
    }

    #[test]
    fn completion_reports_the_folded_failure() {
        let runtime = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_pool(Arc::new(PassivePool::new("main")))
            .build(noop_graph("main"))
            .unwrap();

        let process = ProcessState::new(ProcessId(99), Box::new(|_: &ProcessOutcome| {}), 0);
        process.flow_started();
        let function: Arc<str> = Arc::from("noop");
        process.fold(Escalation::function(&function, generic_error!("boom")));
        process.flow_finished(&runtime.engine);

        let outcome = process.outcome().unwrap();
        assert_eq!(outcome.escalation().map(Escalation::kind), Some(EscalationKind::Function));
    }

    #[test]
    fn dropping_the_runtime_abandons_suspended_jobs() {
        let graph = GraphBuilder::default()
            .add_resource(
                ResourceSpec::new("never", Scope::Function, |_| Sourcing::Pending)
                    .with_timeout(Duration::from_secs(60)),
            )
            .add_function(
                FunctionSpec::new("wait", "main", |_: &mut crate::context::FunctionContext<'_>| {
                    Ok(Next::default())
                })
                    .with_dependency("never"),
            );
        let runtime = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_pool(Arc::new(PassivePool::new("main")))
            .build(graph)
            .unwrap();

        let handle = runtime.invoke_process_by_name("wait", None, |_| {}).unwrap();
        assert_eq!(runtime.supervisors()[0].asset_count(), 1);

        // A clone keeps the runtime alive.
        let clone = runtime.clone();
        drop(runtime);
        assert!(handle.outcome().is_none());

        drop(clone);
        let outcome = handle.outcome().unwrap();
        assert!(matches!(outcome.escalation(), Some(Escalation::Cancelled { .. })));
    }

    struct SingleStrategy;

    impl ExecutionStrategyProvider for SingleStrategy {
        fn strategies(&self, _pools: &[PoolDescriptor]) -> Vec<ExecutionStrategy> {
            vec![ExecutionStrategy::new(
                "bridge",
                vec![Arc::new(NamedThreadFactory::new("bridge")) as Arc<dyn ThreadFactory>],
            )]
        }
    }

    #[test]
    fn functions_see_their_execution_strategies() {
        let graph = GraphBuilder::default().add_function(
            FunctionSpec::new("bridge", "main", |ctx: &mut crate::context::FunctionContext<'_>| {
                let strategy = ctx.execution_strategy(0)?;
                if strategy.name() != "bridge" {
                    return Err(generic_error!("unexpected strategy '{}'", strategy.name()));
                }
                if ctx.execution_strategy(1).is_ok() {
                    return Err(generic_error!("expected a single strategy"));
                }
                Ok(Next::Stop)
            })
            .with_strategy("bridge"),
        );
        let runtime = RuntimeBuilder::new(RuntimeConfiguration::default())
            .with_pool(Arc::new(PassivePool::new("main")))
            .with_strategy_provider(SingleStrategy)
            .build(graph)
            .unwrap();

        let outcome = runtime.invoke_process_by_name("bridge", None, |_| {}).unwrap().wait();
        assert!(outcome.is_success(), "{:?}", outcome.escalation());
    }
}
