//! Static execution graph.
//!
//! The graph is produced ahead of time, by whatever wires an application together, and is consumed read-only by the
//! runtime. Everything is declared by name, and every name is resolved exactly once, when the graph is built, into a
//! dense index that the engine uses from then on.
use std::{collections::HashMap, sync::Arc, time::Duration};

use skein_error::GenericError;
use snafu::Snafu;

use crate::{
    context::{Function, FunctionContext, Next},
    escalation::EscalationMatcher,
    resource::{ResourcePool, ResourceSource, SourceContext, Sourcing},
};

/// Identifier of a function in a built graph.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FunctionId(pub(crate) usize);

impl FunctionId {
    /// Returns the index of the function within the graph.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identifier of a resource in a built graph.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResourceId(pub(crate) usize);

impl ResourceId {
    /// Returns the index of the resource within the graph.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identifier of a worker pool in a runtime.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(pub(crate) usize);

impl PoolId {
    /// Returns the index of the pool within the runtime.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Graph errors.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum GraphError {
    /// Two declarations of the same kind share a name.
    #[snafu(display("Duplicate {} name '{}'.", kind, name))]
    DuplicateName {
        /// Kind of declaration: `function` or `resource`.
        kind: &'static str,

        /// The duplicated name.
        name: String,
    },

    /// A declaration refers to a function that does not exist.
    #[snafu(display("'{}' refers to unknown function '{}'.", referrer, name))]
    UnresolvedFunction {
        /// Name of the referring declaration.
        referrer: String,

        /// The unknown name.
        name: String,
    },

    /// A declaration refers to a resource that does not exist.
    #[snafu(display("'{}' refers to unknown resource '{}'.", referrer, name))]
    UnresolvedResource {
        /// Name of the referring declaration.
        referrer: String,

        /// The unknown name.
        name: String,
    },

    /// A function refers to a worker pool that does not exist.
    #[snafu(display("Function '{}' refers to unknown worker pool '{}'.", function, name))]
    UnresolvedPool {
        /// Name of the function.
        function: String,

        /// The unknown name.
        name: String,
    },

    /// A function refers to an execution strategy that does not exist.
    #[snafu(display("Function '{}' refers to unknown execution strategy '{}'.", function, name))]
    UnresolvedStrategy {
        /// Name of the function.
        function: String,

        /// The unknown name.
        name: String,
    },
}

/// Scope of a resource handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    /// One handle per process, shared by every function in it, released when the process finishes.
    ///
    /// With a resource pool, the handle is taken from the pool when the process first needs it, and returned to it when
    /// the process finishes.
    Process,

    /// One handle per function execution, taken from and returned to its resource pool under the thread that created
    /// the handle.
    ///
    /// Without a resource pool, nothing survives the function execution, and the handle is discarded as if it had
    /// function scope.
    Thread,

    /// One handle per function execution, discarded when the function exits.
    Function,
}

/// Declaration of a resource.
pub struct ResourceSpec {
    name: String,
    scope: Scope,
    source: Arc<dyn ResourceSource>,
    dependencies: Vec<String>,
    pool: Option<Arc<dyn ResourcePool>>,
    timeout: Option<Duration>,
}

impl ResourceSpec {
    /// Creates a resource declaration sourced by the given closure.
    pub fn new<N, F>(name: N, scope: Scope, source: F) -> Self
    where
        N: Into<String>,
        F: Fn(&mut SourceContext<'_>) -> Sourcing + Send + Sync + 'static,
    {
        Self::from_source(name, scope, Arc::new(source))
    }

    /// Creates a resource declaration sourced by the given source.
    pub fn from_source<N>(name: N, scope: Scope, source: Arc<dyn ResourceSource>) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            scope,
            source,
            dependencies: Vec::new(),
            pool: None,
            timeout: None,
        }
    }

    /// Adds a dependency on another resource.
    ///
    /// Dependencies are resolved in the order they are declared, before this resource is sourced.
    pub fn with_dependency<N: Into<String>>(mut self, name: N) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Sets the resource pool that handles are reused from and released to.
    ///
    /// Only process- and thread-scope handles are pooled. Function-scope handles are always discarded.
    pub fn with_pool(mut self, pool: Arc<dyn ResourcePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets how long asynchronous sourcing may take before the handle fails with a timeout.
    ///
    /// Defaults to the runtime's default sourcing timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Declaration of a function.
pub struct FunctionSpec {
    name: String,
    pool: String,
    body: Arc<dyn Function>,
    dependencies: Vec<String>,
    next: Option<String>,
    flows: Vec<String>,
    strategies: Vec<String>,
    handlers: Vec<(EscalationMatcher, String)>,
}

impl FunctionSpec {
    /// Creates a function declaration with the given closure as its body, running on the given worker pool.
    pub fn new<N, P, F>(name: N, pool: P, body: F) -> Self
    where
        N: Into<String>,
        P: Into<String>,
        F: Fn(&mut FunctionContext<'_>) -> Result<Next, GenericError> + Send + Sync + 'static,
    {
        Self::from_function(name, pool, Arc::new(body))
    }

    /// Creates a function declaration with the given body, running on the given worker pool.
    pub fn from_function<N, P>(name: N, pool: P, body: Arc<dyn Function>) -> Self
    where
        N: Into<String>,
        P: Into<String>,
    {
        Self {
            name: name.into(),
            pool: pool.into(),
            body,
            dependencies: Vec::new(),
            next: None,
            flows: Vec::new(),
            strategies: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Adds a resource dependency, available to the body at the next dependency index.
    pub fn with_dependency<N: Into<String>>(mut self, name: N) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Sets the function linked after this one.
    pub fn with_next<N: Into<String>>(mut self, name: N) -> Self {
        self.next = Some(name.into());
        self
    }

    /// Adds a flow, instigatable from the body at the next flow index.
    pub fn with_flow<N: Into<String>>(mut self, name: N) -> Self {
        self.flows.push(name.into());
        self
    }

    /// Adds an execution strategy, available to the body at the next strategy index.
    pub fn with_strategy<N: Into<String>>(mut self, name: N) -> Self {
        self.strategies.push(name.into());
        self
    }

    /// Adds an escalation handler: escalations raised by this function that match are recovered by the named function.
    pub fn with_escalation_handler<M, N>(mut self, matcher: M, recovery: N) -> Self
    where
        M: Into<EscalationMatcher>,
        N: Into<String>,
    {
        self.handlers.push((matcher.into(), recovery.into()));
        self
    }
}

/// Builder for a [`Graph`].
#[derive(Default)]
pub struct GraphBuilder {
    functions: Vec<FunctionSpec>,
    resources: Vec<ResourceSpec>,
    handlers: Vec<(EscalationMatcher, String)>,
}

impl GraphBuilder {
    /// Adds a function.
    pub fn add_function(mut self, spec: FunctionSpec) -> Self {
        self.functions.push(spec);
        self
    }

    /// Adds a resource.
    pub fn add_resource(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }

    /// Adds a process-level escalation handler.
    ///
    /// Process-level handlers are consulted, in the order they were added, for escalations that no function-level
    /// handler or flow callback took care of.
    pub fn with_escalation_handler<M, N>(mut self, matcher: M, recovery: N) -> Self
    where
        M: Into<EscalationMatcher>,
        N: Into<String>,
    {
        self.handlers.push((matcher.into(), recovery.into()));
        self
    }

    /// Resolves every name in the graph against itself and the given pool and strategy names.
    pub(crate) fn build(self, pools: &[Arc<str>], strategies: &[Arc<str>]) -> Result<Graph, GraphError> {
        let function_index = index_names("function", self.functions.iter().map(|f| f.name.as_str()))?;
        let resource_index = index_names("resource", self.resources.iter().map(|r| r.name.as_str()))?;

        let lookup_function = |referrer: &str, name: &str| -> Result<usize, GraphError> {
            function_index.get(name).copied().ok_or_else(|| GraphError::UnresolvedFunction {
                referrer: referrer.to_string(),
                name: name.to_string(),
            })
        };
        let lookup_resource = |referrer: &str, name: &str| -> Result<usize, GraphError> {
            resource_index.get(name).copied().ok_or_else(|| GraphError::UnresolvedResource {
                referrer: referrer.to_string(),
                name: name.to_string(),
            })
        };

        let mut resources = Vec::with_capacity(self.resources.len());
        for spec in self.resources {
            let dependencies = spec
                .dependencies
                .iter()
                .map(|dep| lookup_resource(&spec.name, dep).map(ResourceId))
                .collect::<Result<Vec<_>, _>>()?;

            resources.push(ResourceNode {
                name: Arc::from(spec.name),
                scope: spec.scope,
                source: spec.source,
                dependencies,
                pool: spec.pool,
                timeout: spec.timeout,
            });
        }

        let mut functions = Vec::with_capacity(self.functions.len());
        for spec in self.functions {
            let pool = pools
                .iter()
                .position(|p| **p == *spec.pool)
                .map(PoolId)
                .ok_or_else(|| GraphError::UnresolvedPool {
                    function: spec.name.clone(),
                    name: spec.pool.clone(),
                })?;
            let dependencies = spec
                .dependencies
                .iter()
                .map(|dep| lookup_resource(&spec.name, dep).map(ResourceId))
                .collect::<Result<Vec<_>, _>>()?;
            let next = spec
                .next
                .as_deref()
                .map(|next| lookup_function(&spec.name, next).map(FunctionId))
                .transpose()?;
            let flows = spec
                .flows
                .iter()
                .map(|flow| lookup_function(&spec.name, flow).map(FunctionId))
                .collect::<Result<Vec<_>, _>>()?;
            let strategies = spec
                .strategies
                .iter()
                .map(|strategy| {
                    strategies
                        .iter()
                        .position(|s| **s == **strategy)
                        .ok_or_else(|| GraphError::UnresolvedStrategy {
                            function: spec.name.clone(),
                            name: strategy.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let handlers = resolve_handlers(&spec.name, &spec.handlers, &lookup_function)?;

            functions.push(FunctionNode {
                name: Arc::from(spec.name),
                pool,
                body: spec.body,
                dependencies,
                next,
                flows,
                strategies,
                handlers,
            });
        }

        let process_handlers = resolve_handlers("<process>", &self.handlers, &lookup_function)?;

        Ok(Graph {
            functions,
            resources,
            process_handlers,
            function_index: function_index
                .into_iter()
                .map(|(name, idx)| (name, FunctionId(idx)))
                .collect(),
        })
    }
}

fn index_names<'a, I>(kind: &'static str, names: I) -> Result<HashMap<String, usize>, GraphError>
where
    I: Iterator<Item = &'a str>,
{
    let mut index = HashMap::new();
    for (idx, name) in names.enumerate() {
        if index.insert(name.to_string(), idx).is_some() {
            return Err(GraphError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(index)
}

fn resolve_handlers<F>(
    referrer: &str, handlers: &[(EscalationMatcher, String)], lookup_function: &F,
) -> Result<Vec<Handler>, GraphError>
where
    F: Fn(&str, &str) -> Result<usize, GraphError>,
{
    handlers
        .iter()
        .map(|(matcher, recovery)| {
            lookup_function(referrer, recovery).map(|idx| Handler {
                matcher: *matcher,
                recovery: FunctionId(idx),
            })
        })
        .collect()
}

/// An escalation handler, resolved.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Handler {
    pub(crate) matcher: EscalationMatcher,
    pub(crate) recovery: FunctionId,
}

pub(crate) struct FunctionNode {
    pub(crate) name: Arc<str>,
    pub(crate) pool: PoolId,
    pub(crate) body: Arc<dyn Function>,
    pub(crate) dependencies: Vec<ResourceId>,
    pub(crate) next: Option<FunctionId>,
    pub(crate) flows: Vec<FunctionId>,
    pub(crate) strategies: Vec<usize>,
    pub(crate) handlers: Vec<Handler>,
}

pub(crate) struct ResourceNode {
    pub(crate) name: Arc<str>,
    pub(crate) scope: Scope,
    pub(crate) source: Arc<dyn ResourceSource>,
    pub(crate) dependencies: Vec<ResourceId>,
    pub(crate) pool: Option<Arc<dyn ResourcePool>>,
    pub(crate) timeout: Option<Duration>,
}

/// A resolved, immutable execution graph.
pub struct Graph {
    functions: Vec<FunctionNode>,
    resources: Vec<ResourceNode>,
    process_handlers: Vec<Handler>,
    function_index: HashMap<String, FunctionId>,
}

impl Graph {
    /// Looks up a function by name.
    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.function_index.get(name).copied()
    }

    /// Returns the name of the given function.
    ///
    /// # Panics
    ///
    /// Panics if the identifier does not belong to this graph.
    pub fn function_name(&self, id: FunctionId) -> &str {
        &self.functions[id.0].name
    }

    /// Returns the number of functions in the graph.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Returns the number of resources in the graph.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn function(&self, id: FunctionId) -> &FunctionNode {
        &self.functions[id.0]
    }

    pub(crate) fn resource(&self, id: ResourceId) -> &ResourceNode {
        &self.resources[id.0]
    }

    pub(crate) fn resources(&self) -> impl Iterator<Item = &ResourceNode> {
        self.resources.iter()
    }

    pub(crate) fn process_handlers(&self) -> &[Handler] {
        &self.process_handlers
    }
}
