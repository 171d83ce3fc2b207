//! Handle resolution.
//!
//! Process-scope handles live in the process's registry, shared by every job of the process. Thread- and
//! function-scope handles live in the job that requested them, and survive the job being suspended and resumed.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, ThreadId},
};

use skein_error::{from_panic_payload, generic_error};
use tracing::{debug, trace};

use super::{Completion, Rejected, Resolution, ResourcePool, SourceContext, Sourcing, Waiter};
use crate::{
    escalation::Escalation,
    graph::{ResourceId, Scope},
    process::ProcessState,
    runtime::Engine,
    Value,
};

#[derive(Default)]
struct Slots {
    cells: Vec<Option<Arc<Completion>>>,
    order: Vec<ResourceId>,
}

/// Process-scope handles of a single process.
pub(crate) struct ProcessResources {
    slots: Mutex<Slots>,
}

impl ProcessResources {
    pub(crate) fn new(resource_count: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                cells: vec![None; resource_count],
                order: Vec::new(),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, id: ResourceId) -> Option<Arc<Completion>> {
        self.slots().cells.get(id.0).cloned().flatten()
    }

    /// Inserts the handle unless one already exists, in which case the existing handle is returned.
    fn insert_if_absent(&self, id: ResourceId, cell: &Arc<Completion>) -> Option<Arc<Completion>> {
        let mut guard = self.slots();
        let slots = &mut *guard;
        match slots.cells.get_mut(id.0) {
            Some(Some(existing)) => Some(Arc::clone(existing)),
            Some(slot) => {
                *slot = Some(Arc::clone(cell));
                slots.order.push(id);
                None
            }
            None => None,
        }
    }

    /// Removes every handle, in the order they were created.
    pub(crate) fn take_all(&self) -> Vec<(ResourceId, Arc<Completion>)> {
        let mut slots = self.slots();
        let order = std::mem::take(&mut slots.order);
        order
            .into_iter()
            .filter_map(|id| slots.cells[id.0].take().map(|cell| (id, cell)))
            .collect()
    }
}

/// Thread- and function-scope handles held by a job for the function it is about to run.
#[derive(Default)]
pub(crate) struct LocalResources {
    entries: Vec<(ResourceId, Arc<Completion>)>,
}

impl LocalResources {
    fn get(&self, id: ResourceId) -> Option<Arc<Completion>> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, cell)| Arc::clone(cell))
    }

    fn insert(&mut self, id: ResourceId, cell: Arc<Completion>) {
        self.entries.push((id, cell));
    }

    /// Removes every handle, in the order they were created.
    pub(crate) fn take_all(&mut self) -> Vec<(ResourceId, Arc<Completion>)> {
        std::mem::take(&mut self.entries)
    }
}

// Settles one outstanding asynchronous process-scope acquisition.
struct OutstandingAcquisition {
    engine: Arc<Engine>,
    process: Arc<ProcessState>,
}

impl Waiter for OutstandingAcquisition {
    fn wake(&self) {
        self.process.acquisition_settled(&self.engine);
    }
}

/// Outcome of resolving every dependency of a function.
pub(crate) enum Dependencies {
    Ready(Vec<Value>),
    Pending(ResourceId, Arc<Completion>),
    Failed(Escalation),
}

/// Resolves the given resources, in order.
///
/// Stops at the first resource that is not ready: the caller either suspends until it settles, then resolves again, or
/// escalates its failure.
pub(crate) fn resolve_dependencies(
    engine: &Arc<Engine>, process: &Arc<ProcessState>, locals: &mut LocalResources, ids: &[ResourceId],
) -> Dependencies {
    let mut values = Vec::with_capacity(ids.len());
    let mut path = Vec::new();
    for id in ids {
        match resolve(engine, process, locals, *id, &mut path) {
            Resolution::Ready(value) => values.push(value),
            Resolution::Pending(cell) => return Dependencies::Pending(*id, cell),
            Resolution::Failed(escalation) => return Dependencies::Failed(escalation),
        }
    }
    Dependencies::Ready(values)
}

fn resolve(
    engine: &Arc<Engine>, process: &Arc<ProcessState>, locals: &mut LocalResources, id: ResourceId,
    path: &mut Vec<ResourceId>,
) -> Resolution {
    let node = engine.graph.resource(id);

    if path.contains(&id) {
        let cycle = path
            .iter()
            .chain(std::iter::once(&id))
            .map(|id| &*engine.graph.resource(*id).name)
            .collect::<Vec<_>>()
            .join(" -> ");
        return Resolution::Failed(Escalation::sourcing(
            &node.name,
            generic_error!("dependency cycle detected: {}", cycle),
        ));
    }

    let existing = match node.scope {
        Scope::Process => process.resources.get(id),
        Scope::Thread | Scope::Function => locals.get(id),
    };
    if let Some(cell) = existing {
        return cell.resolve();
    }

    if let Some(value) = reuse(node.scope, node.pool.as_deref()) {
        trace!(resource = %node.name, "Reusing pooled resource.");
        let cell = Completion::ready(&node.name, Arc::clone(&value));
        match node.scope {
            Scope::Process => {
                if let Some(existing) = process.resources.insert_if_absent(id, &cell) {
                    // Another job of the process got there first: the pooled value goes straight back.
                    release(engine, id, value, cell.owner(), None);
                    return existing.resolve();
                }
            }
            Scope::Thread | Scope::Function => locals.insert(id, cell),
        }
        return Resolution::Ready(value);
    }

    path.push(id);
    let mut dependencies = Vec::with_capacity(node.dependencies.len());
    for dependency in &node.dependencies {
        match resolve(engine, process, locals, *dependency, path) {
            Resolution::Ready(value) => dependencies.push(value),
            other => {
                path.pop();
                return other;
            }
        }
    }
    path.pop();

    let timeout = node.timeout.unwrap_or(engine.default_sourcing_timeout);
    let cell = Completion::pending(&node.name, engine.clock.now(), timeout);
    match node.scope {
        Scope::Process => {
            // Another job of the process may have created the handle while we were resolving its dependencies.
            if let Some(existing) = process.resources.insert_if_absent(id, &cell) {
                return existing.resolve();
            }
        }
        Scope::Thread | Scope::Function => locals.insert(id, Arc::clone(&cell)),
    }

    let sourcing = {
        let mut ctx = SourceContext::new(engine, id, &node.name, &dependencies, &cell);
        panic::catch_unwind(AssertUnwindSafe(|| node.source.source(&mut ctx)))
            .unwrap_or_else(|payload| Sourcing::Failed(from_panic_payload(payload)))
    };

    match sourcing {
        Sourcing::Ready(value) => {
            // The source may already have settled the handle through its listener.
            if let Err(Rejected(Ok(value))) = cell.transition(Ok(value)) {
                engine.discard(id, value);
            }
        }
        Sourcing::Failed(e) => {
            debug!(resource = %node.name, error = %e, "Failed to source resource.");
            let _ = cell.transition(Err(Escalation::sourcing(&node.name, e)));
        }
        Sourcing::Pending => {
            trace!(resource = %node.name, timeout = ?timeout, "Resource is being sourced asynchronously.");
            if node.scope == Scope::Process {
                process.acquisition_started();
                let waiter = Arc::new(OutstandingAcquisition {
                    engine: Arc::clone(engine),
                    process: Arc::clone(process),
                });
                if !cell.add_waiter(waiter) {
                    process.acquisition_settled(engine);
                }
            }
        }
    }

    cell.resolve()
}

// Takes an idle value from the resource's pool, for the scopes that are pooled.
fn reuse(scope: Scope, pool: Option<&dyn ResourcePool>) -> Option<Value> {
    match (scope, pool) {
        (Scope::Thread | Scope::Process, Some(pool)) => pool.source_or_reuse(thread::current().id()),
        _ => None,
    }
}

/// Releases a value whose handle has gone out of scope, returning it to its pool or discarding it.
///
/// `owner` is the thread the handle was created on, which is where a thread-keyed pool files the value.
pub(crate) fn release(engine: &Engine, id: ResourceId, value: Value, owner: ThreadId, cause: Option<&Escalation>) {
    let node = engine.graph.resource(id);
    let declined = match (&node.pool, node.scope) {
        (Some(pool), Scope::Thread | Scope::Process) => pool.return_or_discard(owner, value, cause),
        _ => Some(value),
    };
    if let Some(value) = declined {
        engine.discard(id, value);
    }
}
