//! The function contract.
use std::{any::Any, sync::Arc};

use skein_error::{generic_error, GenericError};

use crate::{
    escalation::Escalation,
    graph::{FunctionId, FunctionNode},
    process::{ProcessId, ProcessState, ProcessStatus},
    runtime::Engine,
    strategy::ExecutionStrategy,
    value_at, Parameter, Value,
};

/// A unit of work in the graph.
///
/// A function runs once all of its dependencies are ready, and returns the continuation of its flow.
pub trait Function: Send + Sync {
    /// Runs the function.
    ///
    /// # Errors
    ///
    /// If the function fails, an error is returned, and escalated through the handlers of the function and its process.
    fn execute(&self, ctx: &mut FunctionContext<'_>) -> Result<Next, GenericError>;
}

impl<F> Function for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<Next, GenericError> + Send + Sync,
{
    fn execute(&self, ctx: &mut FunctionContext<'_>) -> Result<Next, GenericError> {
        self(ctx)
    }
}

/// Callback of a flow instigated with [`FlowMode::Spawn`] or [`FunctionContext::join`].
///
/// Called exactly once, with the first escalation raised by any of the flows, or `None` if they all finished cleanly.
pub type FlowCallback = Box<dyn FnOnce(Option<Escalation>) -> Result<(), GenericError> + Send>;

/// How an instigated flow runs relative to the function that instigated it.
pub enum FlowMode {
    /// The flow runs after the instigating function returns, and before its own flow continues.
    Sequential,

    /// The flow runs independently, as a job of its own.
    Parallel,

    /// The flow runs independently, and the callback is invoked when it finishes.
    Spawn(FlowCallback),
}

impl FlowMode {
    /// Creates a `FlowMode::Spawn` from a closure.
    pub fn spawn<F>(callback: F) -> Self
    where
        F: FnOnce(Option<Escalation>) -> Result<(), GenericError> + Send + 'static,
    {
        Self::Spawn(Box::new(callback))
    }
}

/// The continuation returned by a function.
#[derive(Debug)]
pub enum Next {
    /// Continue with the function linked after this one, if any, passing it the parameter.
    Linked(Parameter),

    /// Continue with the flow at the given index, passing it the parameter.
    Flow(usize, Parameter),

    /// End the flow.
    Stop,
}

impl Default for Next {
    fn default() -> Self {
        Self::Linked(None)
    }
}

impl Next {
    /// Continues with the linked function, passing it the given value.
    pub fn with<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::Linked(Some(Arc::new(value)))
    }

    /// Continues with the flow at the given index.
    pub fn flow(index: usize) -> Self {
        Self::Flow(index, None)
    }

    /// Continues with the flow at the given index, passing it the given value.
    pub fn flow_with<T>(index: usize, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::Flow(index, Some(Arc::new(value)))
    }
}

pub(crate) enum Instigation {
    Sequential(FunctionId, Parameter),
    Parallel(FunctionId, Parameter),
    Join(Vec<(FunctionId, Parameter)>, FlowCallback),
}

/// Context given to a running function.
pub struct FunctionContext<'a> {
    engine: &'a Arc<Engine>,
    process: &'a Arc<ProcessState>,
    node: &'a FunctionNode,
    parameter: Parameter,
    escalation: Option<Escalation>,
    dependencies: &'a [Value],
    instigations: Vec<Instigation>,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        engine: &'a Arc<Engine>, process: &'a Arc<ProcessState>, node: &'a FunctionNode, parameter: Parameter,
        escalation: Option<Escalation>, dependencies: &'a [Value],
    ) -> Self {
        Self {
            engine,
            process,
            node,
            parameter,
            escalation,
            dependencies,
            instigations: Vec::new(),
        }
    }

    /// Returns the parameter passed by the previous function, if any.
    pub fn parameter(&self) -> Option<&Value> {
        self.parameter.as_ref()
    }

    /// Returns the parameter passed by the previous function, downcast to `T`.
    ///
    /// # Errors
    ///
    /// If there is no parameter, or it is not of type `T`, an error is returned.
    pub fn parameter_as<T>(&self) -> Result<Arc<T>, GenericError>
    where
        T: Any + Send + Sync,
    {
        let parameter = self
            .parameter
            .clone()
            .ok_or_else(|| generic_error!("'{}' was not passed a parameter.", self.node.name))?;
        parameter.downcast::<T>().map_err(|_| {
            generic_error!(
                "Parameter of '{}' is not of type '{}'.",
                self.node.name,
                std::any::type_name::<T>()
            )
        })
    }

    /// Returns the escalation being recovered from, when the function runs as a recovery function.
    pub fn escalation(&self) -> Option<&Escalation> {
        self.escalation.as_ref()
    }

    /// Returns the dependency at the given index.
    ///
    /// # Errors
    ///
    /// If there is no dependency at the given index, or it is not of type `T`, an error is returned.
    pub fn dependency<T>(&self, index: usize) -> Result<Arc<T>, GenericError>
    where
        T: Any + Send + Sync,
    {
        value_at(self.dependencies, index, &self.node.name)
    }

    /// Instigates the flow at the given index.
    ///
    /// Flows are instigated when the function returns successfully. If it fails, its instigations are discarded.
    ///
    /// # Errors
    ///
    /// If the function has no flow at the given index, an error is returned.
    pub fn instigate(&mut self, index: usize, parameter: Parameter, mode: FlowMode) -> Result<(), GenericError> {
        let flow = self.flow(index)?;
        let instigation = match mode {
            FlowMode::Sequential => Instigation::Sequential(flow, parameter),
            FlowMode::Parallel => Instigation::Parallel(flow, parameter),
            FlowMode::Spawn(callback) => Instigation::Join(vec![(flow, parameter)], callback),
        };
        self.instigations.push(instigation);
        Ok(())
    }

    /// Instigates several flows, with a single callback invoked once all of them have finished.
    ///
    /// # Errors
    ///
    /// If the function has no flow at one of the given indices, an error is returned, and none of the flows are
    /// instigated.
    pub fn join<F>(&mut self, flows: Vec<(usize, Parameter)>, callback: F) -> Result<(), GenericError>
    where
        F: FnOnce(Option<Escalation>) -> Result<(), GenericError> + Send + 'static,
    {
        let children = flows
            .into_iter()
            .map(|(index, parameter)| self.flow(index).map(|flow| (flow, parameter)))
            .collect::<Result<Vec<_>, _>>()?;
        self.instigations.push(Instigation::Join(children, Box::new(callback)));
        Ok(())
    }

    fn flow(&self, index: usize) -> Result<FunctionId, GenericError> {
        self.node
            .flows
            .get(index)
            .copied()
            .ok_or_else(|| generic_error!("'{}' has no flow at index {}.", self.node.name, index))
    }

    /// Returns the execution strategy at the given index.
    ///
    /// # Errors
    ///
    /// If the function has no execution strategy at the given index, an error is returned.
    pub fn execution_strategy(&self, index: usize) -> Result<&ExecutionStrategy, GenericError> {
        self.node
            .strategies
            .get(index)
            .and_then(|strategy| self.engine.strategies.get(*strategy))
            .ok_or_else(|| generic_error!("'{}' has no execution strategy at index {}.", self.node.name, index))
    }

    /// Returns the identifier of the process the function runs in.
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Returns the name of the function.
    pub fn function_name(&self) -> &str {
        &self.node.name
    }

    /// Returns `true` if the process has been cancelled.
    ///
    /// Cancellation never interrupts a running function, but a long-running one may check this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.process.status() == ProcessStatus::Cancelling
    }

    pub(crate) fn into_instigations(self) -> Vec<Instigation> {
        self.instigations
    }
}
