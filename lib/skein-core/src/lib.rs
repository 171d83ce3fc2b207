//! An engine for running chains of dependency-injected functions across pluggable worker pools.
//!
//! Functions are declared in a static [`Graph`][graph::Graph], along with the resources they depend on and the
//! worker pools they run on. A [`Runtime`][runtime::Runtime] then invokes processes against that graph: each process is
//! a tree of flows, each flow a chain of functions linked by continuations, and no pool thread ever blocks waiting for
//! another function or for an asynchronously-sourced resource. A background supervisor times out whatever stalls.
#![deny(missing_docs)]

use std::{any::Any, sync::Arc};

use skein_error::{generic_error, GenericError};

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod escalation;
pub mod graph;
pub mod job;
pub mod pool;
pub mod process;
pub mod resource;
pub mod runtime;
pub mod strategy;
pub mod supervisor;

mod flow;

/// A type-erased value passed between functions or injected as a resource.
pub type Value = Arc<dyn Any + Send + Sync>;

/// The optional value handed from one function to the next.
pub type Parameter = Option<Value>;

/// Wraps a concrete value as a [`Value`].
pub fn value<T>(value: T) -> Value
where
    T: Any + Send + Sync,
{
    Arc::new(value)
}

pub(crate) fn value_at<T>(values: &[Value], index: usize, owner: &str) -> Result<Arc<T>, GenericError>
where
    T: Any + Send + Sync,
{
    let value = values
        .get(index)
        .ok_or_else(|| generic_error!("'{}' has no dependency at index {}.", owner, index))?;
    Arc::clone(value).downcast::<T>().map_err(|_| {
        generic_error!(
            "Dependency {} of '{}' is not of type '{}'.",
            index,
            owner,
            std::any::type_name::<T>()
        )
    })
}
