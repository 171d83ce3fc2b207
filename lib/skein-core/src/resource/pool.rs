use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    thread::ThreadId,
};

use metrics::{counter, Counter};
use tracing::debug;

use crate::{escalation::Escalation, Value};

/// A pool of released resource values, available for reuse.
///
/// Pools never create values themselves: when a pool has nothing to offer, the engine sources a new value and hands it
/// back to the pool once the function that used it exits.
pub trait ResourcePool: Send + Sync {
    /// Returns the name of the pool.
    fn name(&self) -> &str;

    /// Takes an idle value previously released on the given thread, if there is one.
    fn source_or_reuse(&self, thread: ThreadId) -> Option<Value>;

    /// Offers a released value back to the pool.
    ///
    /// `cause` is the escalation, if any, raised by the function that held the value. Returns the value back if the
    /// pool declines it, in which case the caller discards it.
    fn return_or_discard(&self, thread: ThreadId, value: Value, cause: Option<&Escalation>) -> Option<Value>;

    /// Removes and returns every idle value.
    fn drain(&self) -> Vec<Value>;
}

struct Metrics {
    reused: Counter,
    returned: Counter,
    discarded: Counter,
}

impl Metrics {
    fn new(pool_name: &Arc<str>) -> Self {
        let pool_name = pool_name.to_string();
        Self {
            reused: counter!("skein_resource_pool_reused_total", "pool_name" => pool_name.clone()),
            returned: counter!("skein_resource_pool_returned_total", "pool_name" => pool_name.clone()),
            discarded: counter!("skein_resource_pool_discarded_total", "pool_name" => pool_name),
        }
    }
}

/// A resource pool keyed by thread.
///
/// Values released on a thread are only ever reused on that same thread, most recently released first. Each thread
/// keeps at most `per_thread_capacity` idle values; values released while a thread is at capacity, or released by a
/// function that failed, are declined.
pub struct ThreadKeyedPool {
    name: Arc<str>,
    per_thread_capacity: usize,
    idle: Mutex<HashMap<ThreadId, Vec<Value>>>,
    metrics: Metrics,
}

impl ThreadKeyedPool {
    /// Creates a new `ThreadKeyedPool` holding up to `per_thread_capacity` idle values per thread.
    pub fn new<N: Into<Arc<str>>>(name: N, per_thread_capacity: usize) -> Self {
        let name = name.into();
        Self {
            metrics: Metrics::new(&name),
            name,
            per_thread_capacity,
            idle: Mutex::new(HashMap::new()),
        }
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Value>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the number of idle values held for the given thread.
    pub fn idle_for(&self, thread: ThreadId) -> usize {
        self.idle().get(&thread).map_or(0, Vec::len)
    }
}

impl ResourcePool for ThreadKeyedPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_or_reuse(&self, thread: ThreadId) -> Option<Value> {
        let value = self.idle().get_mut(&thread).and_then(Vec::pop);
        if value.is_some() {
            self.metrics.reused.increment(1);
        }
        value
    }

    fn return_or_discard(&self, thread: ThreadId, value: Value, cause: Option<&Escalation>) -> Option<Value> {
        if let Some(cause) = cause {
            debug!(pool = %self.name, cause = %cause, "Declining resource released by a failed function.");
            self.metrics.discarded.increment(1);
            return Some(value);
        }

        let mut idle = self.idle();
        let values = idle.entry(thread).or_default();
        if values.len() >= self.per_thread_capacity {
            self.metrics.discarded.increment(1);
            return Some(value);
        }

        values.push(value);
        self.metrics.returned.increment(1);
        None
    }

    fn drain(&self) -> Vec<Value> {
        self.idle().drain().flat_map(|(_, values)| values).collect()
    }
}
