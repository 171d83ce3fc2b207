//! Runtime configuration.
use std::time::Duration;

use serde::Deserialize;

use crate::pool::OverloadPolicy;

const fn default_supervisor_tick_interval_ms() -> u64 {
    10
}

const fn default_supervisors() -> usize {
    1
}

const fn default_sourcing_timeout_ms() -> u64 {
    30_000
}

const fn default_overload_retry_timeout_ms() -> u64 {
    5_000
}

const fn default_max_asset_check_failures() -> usize {
    3
}

const fn default_workers() -> usize {
    1
}

const fn default_queue_capacity() -> usize {
    crate::pool::DEFAULT_QUEUE_CAPACITY
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Kind of a configured worker pool.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// A [`FixedWorkerPool`][crate::pool::FixedWorkerPool] with `workers` threads.
    Fixed,

    /// A [`FixedWorkerPool`][crate::pool::FixedWorkerPool] with a single thread.
    Single,

    /// A [`PassivePool`][crate::pool::PassivePool].
    Passive,

    /// A [`ThreadAffinityPool`][crate::pool::ThreadAffinityPool].
    ThreadAffinity,
}

/// Configuration of a single worker pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct PoolConfiguration {
    /// Name of the pool, as referred to by functions.
    pub name: String,

    /// Kind of pool.
    pub kind: PoolKind,

    /// Number of worker threads.
    ///
    /// Only used by `fixed` pools. Defaults to 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of jobs queued before the pool signals overload.
    ///
    /// Only used by `fixed` and `single` pools. Defaults to 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// What the pool does when every worker is busy.
    ///
    /// Only used by `fixed` and `single` pools. Defaults to `queue`.
    #[serde(default)]
    pub overload_policy: OverloadPolicy,
}

/// Runtime configuration.
///
/// Every field has a default, so an empty configuration is valid.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RuntimeConfiguration {
    /// How often supervisors check their assets, in milliseconds.
    ///
    /// Defaults to 10ms.
    pub supervisor_tick_interval_ms: u64,

    /// Number of supervisors.
    ///
    /// Defaults to 1.
    pub supervisors: usize,

    /// How long asynchronous sourcing of a resource may take before failing with a timeout, in milliseconds, for
    /// resources that do not set their own timeout.
    ///
    /// Defaults to 30 seconds.
    pub default_sourcing_timeout_ms: u64,

    /// How long an assignment to an overloaded pool is retried before the job fails with a timeout, in milliseconds.
    ///
    /// Defaults to 5 seconds.
    pub overload_retry_timeout_ms: u64,

    /// Number of consecutive failed checks after which a supervisor abandons an asset.
    ///
    /// Defaults to 3.
    pub max_asset_check_failures: usize,

    /// Worker pools to create.
    pub pools: Vec<PoolConfiguration>,

    /// Name of the pool that work is rerouted to when a passive pool cannot run it.
    ///
    /// Defaults to the first pool that has threads of its own.
    pub fallback_pool: Option<String>,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            supervisor_tick_interval_ms: default_supervisor_tick_interval_ms(),
            supervisors: default_supervisors(),
            default_sourcing_timeout_ms: default_sourcing_timeout_ms(),
            overload_retry_timeout_ms: default_overload_retry_timeout_ms(),
            max_asset_check_failures: default_max_asset_check_failures(),
            pools: Vec::new(),
            fallback_pool: None,
        }
    }
}

impl RuntimeConfiguration {
    /// Returns the supervisor tick interval.
    pub fn supervisor_tick_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_interval_ms.max(1))
    }

    /// Returns the default sourcing timeout.
    pub fn default_sourcing_timeout(&self) -> Duration {
        Duration::from_millis(self.default_sourcing_timeout_ms)
    }

    /// Returns the overload retry timeout.
    pub fn overload_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.overload_retry_timeout_ms)
    }

    /// Sets the supervisor tick interval.
    pub fn with_supervisor_tick_interval(mut self, interval: Duration) -> Self {
        self.supervisor_tick_interval_ms = saturating_millis(interval);
        self
    }

    /// Sets the default sourcing timeout.
    pub fn with_default_sourcing_timeout(mut self, timeout: Duration) -> Self {
        self.default_sourcing_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Sets the overload retry timeout.
    pub fn with_overload_retry_timeout(mut self, timeout: Duration) -> Self {
        self.overload_retry_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Sets the number of supervisors.
    pub fn with_supervisors(mut self, supervisors: usize) -> Self {
        self.supervisors = supervisors;
        self
    }
}
