//! Execution strategies.
//!
//! An execution strategy is a named set of thread factories. Functions that need to run work of their own outside the
//! engine, such as a blocking call handed off to a dedicated thread, declare the strategies they use and get them from
//! their context.
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

/// Spawns threads.
pub trait ThreadFactory: Send + Sync {
    /// Returns the name of the factory.
    fn name(&self) -> &str;

    /// Spawns a thread running the given task.
    ///
    /// # Errors
    ///
    /// If the thread cannot be spawned, an error is returned.
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

/// A thread factory that names threads after a prefix and a counter: `<prefix>-NN`.
pub struct NamedThreadFactory {
    prefix: Arc<str>,
    next_id: AtomicUsize,
}

impl NamedThreadFactory {
    /// Creates a new `NamedThreadFactory` with the given prefix.
    pub fn new<P: Into<Arc<str>>>(prefix: P) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl ThreadFactory for NamedThreadFactory {
    fn name(&self) -> &str {
        &self.prefix
    }

    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        let thread_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        thread::Builder::new()
            .name(format!("{}-{:02}", self.prefix, thread_id))
            .spawn(task)
    }
}

/// A named set of thread factories.
#[derive(Clone)]
pub struct ExecutionStrategy {
    name: Arc<str>,
    factories: Vec<Arc<dyn ThreadFactory>>,
    next_factory: Arc<AtomicUsize>,
}

impl ExecutionStrategy {
    /// Creates a new `ExecutionStrategy`.
    pub fn new<N: Into<Arc<str>>>(name: N, factories: Vec<Arc<dyn ThreadFactory>>) -> Self {
        Self {
            name: name.into(),
            factories,
            next_factory: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the name of the strategy.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the thread factories of the strategy.
    pub fn thread_factories(&self) -> &[Arc<dyn ThreadFactory>] {
        &self.factories
    }

    /// Spawns a thread running the given task, rotating through the strategy's factories.
    ///
    /// # Errors
    ///
    /// If the strategy has no factories, or the thread cannot be spawned, an error is returned.
    pub fn spawn<F>(&self, task: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.factories.is_empty() {
            return Err(io::Error::other(format!(
                "execution strategy '{}' has no thread factories",
                self.name
            )));
        }
        let idx = self.next_factory.fetch_add(1, Ordering::Relaxed) % self.factories.len();
        self.factories[idx].spawn(Box::new(task))
    }
}

impl fmt::Debug for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.iter().map(|f| f.name()).collect::<Vec<_>>();
        f.debug_struct("ExecutionStrategy")
            .field("name", &self.name)
            .field("factories", &factories)
            .finish()
    }
}

/// A worker pool, as seen by an execution strategy provider.
#[derive(Clone, Debug)]
pub struct PoolDescriptor {
    /// Name of the pool.
    pub name: Arc<str>,

    /// Number of worker threads in the pool.
    pub workers: usize,
}

/// Provides the execution strategies available to functions.
pub trait ExecutionStrategyProvider: Send + Sync {
    /// Returns the strategies for a runtime with the given worker pools.
    fn strategies(&self, pools: &[PoolDescriptor]) -> Vec<ExecutionStrategy>;
}

/// The default execution strategy provider.
///
/// Provides one strategy per worker pool, named after the pool, with one thread factory per pool worker (and at least
/// one). Threads spawned through these strategies are named `<pool>-strategy-<worker>-NN`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultExecutionStrategyProvider;

impl ExecutionStrategyProvider for DefaultExecutionStrategyProvider {
    fn strategies(&self, pools: &[PoolDescriptor]) -> Vec<ExecutionStrategy> {
        pools
            .iter()
            .map(|pool| {
                let factories = (0..pool.workers.max(1))
                    .map(|worker| {
                        Arc::new(NamedThreadFactory::new(format!("{}-strategy-{}", pool.name, worker)))
                            as Arc<dyn ThreadFactory>
                    })
                    .collect();
                ExecutionStrategy::new(Arc::clone(&pool.name), factories)
            })
            .collect()
    }
}
