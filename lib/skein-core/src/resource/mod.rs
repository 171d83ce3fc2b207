//! Resource handles.
//!
//! A resource is anything a function needs injected before it can run: a connection, a parsed configuration, a
//! scratch buffer. Resources are sourced on demand, either synchronously or asynchronously, and scoped to a process, a
//! function execution, or a function execution with thread-keyed reuse.
use std::{
    any::Any,
    sync::{Arc, Weak},
};

use skein_error::GenericError;
use tracing::debug;

use crate::{escalation::Escalation, graph::ResourceId, runtime::Engine, value_at, Value};

mod completion;
pub(crate) use self::completion::{Completion, Rejected, Resolution, Waiter};

mod pool;
pub use self::pool::{ResourcePool, ThreadKeyedPool};

pub(crate) mod registry;

/// The result of asking a source for a value.
pub enum Sourcing {
    /// The value is available now.
    Ready(Value),

    /// The value will be delivered later through the [`CompletionListener`] taken from the source context.
    Pending,

    /// The value could not be sourced.
    Failed(GenericError),
}

impl Sourcing {
    /// Creates a `Sourcing::Ready` from a concrete value.
    pub fn ready<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::Ready(Arc::new(value))
    }

    /// Creates a `Sourcing::Failed` from an error.
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<GenericError>,
    {
        Self::Failed(error.into())
    }
}

/// A source of resource values.
pub trait ResourceSource: Send + Sync {
    /// Sources a new value.
    ///
    /// Dependencies declared for the resource are resolved before this is called, and are available through the
    /// context. A source that completes asynchronously takes a listener from the context, returns
    /// [`Sourcing::Pending`], and later settles the listener from any thread.
    fn source(&self, ctx: &mut SourceContext<'_>) -> Sourcing;

    /// Discards a value that is no longer needed and will not be reused.
    fn discard(&self, value: Value) -> Result<(), GenericError> {
        drop(value);
        Ok(())
    }
}

impl<F> ResourceSource for F
where
    F: Fn(&mut SourceContext<'_>) -> Sourcing + Send + Sync,
{
    fn source(&self, ctx: &mut SourceContext<'_>) -> Sourcing {
        self(ctx)
    }
}

/// Context given to a resource source.
pub struct SourceContext<'a> {
    engine: &'a Arc<Engine>,
    id: ResourceId,
    resource: &'a Arc<str>,
    dependencies: &'a [Value],
    completion: &'a Arc<Completion>,
}

impl<'a> SourceContext<'a> {
    pub(crate) fn new(
        engine: &'a Arc<Engine>, id: ResourceId, resource: &'a Arc<str>, dependencies: &'a [Value],
        completion: &'a Arc<Completion>,
    ) -> Self {
        Self {
            engine,
            id,
            resource,
            dependencies,
            completion,
        }
    }

    /// Returns the name of the resource being sourced.
    pub fn resource_name(&self) -> &str {
        self.resource
    }

    /// Returns the value of the dependency at the given index.
    ///
    /// # Errors
    ///
    /// If there is no dependency at the given index, or it is not of type `T`, an error is returned.
    pub fn dependency<T>(&self, index: usize) -> Result<Arc<T>, GenericError>
    where
        T: Any + Send + Sync,
    {
        value_at(self.dependencies, index, self.resource)
    }

    /// Returns a listener for completing the value asynchronously.
    pub fn listener(&self) -> CompletionListener {
        CompletionListener {
            completion: Arc::clone(self.completion),
            engine: Arc::downgrade(self.engine),
            id: self.id,
        }
    }
}

/// Settles an asynchronously-sourced resource handle.
///
/// Listeners can be cloned and moved to any thread. Only the first call to [`complete`][Self::complete] or
/// [`fail`][Self::fail], across all clones, has any effect.
#[derive(Clone)]
pub struct CompletionListener {
    completion: Arc<Completion>,
    engine: Weak<Engine>,
    id: ResourceId,
}

impl CompletionListener {
    /// Completes the handle with a value.
    ///
    /// Returns `false` if the handle had already been settled, for example because it timed out or its process was
    /// cancelled. The value is then discarded through the resource's source.
    pub fn complete<T>(&self, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.complete_value(Arc::new(value))
    }

    /// Completes the handle with an already type-erased value.
    pub fn complete_value(&self, value: Value) -> bool {
        match self.completion.transition(Ok(value)) {
            Ok(()) => true,
            Err(Rejected(outcome)) => {
                debug!(
                    resource = %self.completion.resource(),
                    "Discarding late value of an already-settled resource handle."
                );
                if let (Ok(value), Some(engine)) = (outcome, self.engine.upgrade()) {
                    engine.discard(self.id, value);
                }
                false
            }
        }
    }

    /// Fails the handle.
    ///
    /// Returns `false` if the handle had already been settled.
    pub fn fail<E>(&self, error: E) -> bool
    where
        E: Into<GenericError>,
    {
        let escalation = Escalation::sourcing(self.completion.resource(), error.into());
        self.completion.transition(Err(escalation)).is_ok()
    }

    /// Returns `true` if the handle has been settled, by this listener or otherwise.
    pub fn is_settled(&self) -> bool {
        self.completion.is_settled()
    }
}
