//! Supervision of stalled work.
//!
//! A supervisor owns a set of assets: things that are waiting on something, such as a job suspended on a resource or
//! a job that could not be assigned because its pool was overloaded. On every tick, on its own thread, the supervisor
//! checks each asset against the current time. Checking is how timeouts are enforced and how stalled work is retried.
use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

use metrics::{gauge, Gauge};
use quanta::{Clock, Instant};
use skein_error::{from_panic_payload, GenericError};
use slab::Slab;
use snafu::Snafu;
use tracing::{debug, trace};

use crate::diagnostics::{Diagnostic, Diagnostics};

mod pending;
pub(crate) use self::pending::{DeferredAssignment, PendingJob};

thread_local! {
    static ON_SUPERVISOR_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if the current thread is a supervisor thread.
pub fn on_supervisor_thread() -> bool {
    ON_SUPERVISOR_THREAD.with(|flag| flag.get())
}

/// Supervisor errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SupervisorError {
    /// The supervisor was already started.
    #[snafu(display("Supervisor '{}' was already started.", supervisor_id))]
    AlreadyStarted {
        /// Identifier of the supervisor.
        supervisor_id: Arc<str>,
    },

    /// The supervisor thread could not be spawned.
    #[snafu(display("Failed to spawn thread for supervisor '{}': {}", supervisor_id, source))]
    SpawnThread {
        /// Identifier of the supervisor.
        supervisor_id: Arc<str>,

        /// Error source.
        source: std::io::Error,
    },
}

/// Status of an asset after a check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssetStatus {
    /// The asset is still waiting, and should be checked again on the next tick.
    Pending,

    /// The asset is done, and can be removed.
    Resolved,
}

/// Something a supervisor checks on every tick.
pub trait Asset: Send + Sync {
    /// Returns the name of the asset.
    fn name(&self) -> &str;

    /// Checks the asset against the current time.
    ///
    /// # Errors
    ///
    /// If the check itself fails, an error is returned. The asset stays registered and is checked again on the next
    /// tick, until it has failed too many checks in a row and is abandoned.
    fn check(&self, now: Instant) -> Result<AssetStatus, GenericError>;

    /// Called when the asset is removed without having resolved: it failed too many checks, or its supervisor stopped.
    fn abandon(&self) {}
}

/// Key of an asset registered with a supervisor.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AssetKey {
    supervisor: usize,
    slot: usize,
}

impl AssetKey {
    /// Returns the index of the supervisor the asset is registered with.
    pub fn supervisor(&self) -> usize {
        self.supervisor
    }
}

/// Counts from a single pass over a supervisor's assets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CheckSummary {
    /// Number of assets checked.
    pub checked: usize,

    /// Number of assets that resolved and were removed.
    pub resolved: usize,

    /// Number of failed checks.
    pub failed: usize,

    /// Number of assets abandoned after failing too many checks.
    pub abandoned: usize,
}

struct Entry {
    asset: Arc<dyn Asset>,
    failures: usize,
}

enum Outcome {
    Status(AssetStatus),
    Failed(GenericError),
}

struct Inner {
    index: usize,
    id: Arc<str>,
    tick_interval: Duration,
    max_check_failures: usize,
    clock: Clock,
    diagnostics: Diagnostics,
    assets: Mutex<Slab<Entry>>,
    shutdown: Mutex<bool>,
    signal: Condvar,
    assets_gauge: Gauge,
}

impl Inner {
    fn assets(&self) -> MutexGuard<'_, Slab<Entry>> {
        self.assets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shutdown(&self) -> MutexGuard<'_, bool> {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self) {
        ON_SUPERVISOR_THREAD.with(|flag| flag.set(true));
        debug!(supervisor_id = %self.id, tick_interval = ?self.tick_interval, "Supervisor started.");

        loop {
            let shutdown = self.shutdown();
            if *shutdown {
                break;
            }
            let (shutdown, _) = self
                .signal
                .wait_timeout(shutdown, self.tick_interval)
                .unwrap_or_else(|e| e.into_inner());
            if *shutdown {
                break;
            }
            drop(shutdown);

            self.check_assets(self.clock.now());
        }

        debug!(supervisor_id = %self.id, "Supervisor stopped.");
    }

    fn check_assets(&self, now: Instant) -> CheckSummary {
        // Checks run without holding the lock, since checking an asset may register new ones.
        let snapshot = self
            .assets()
            .iter()
            .map(|(slot, entry)| (slot, Arc::clone(&entry.asset)))
            .collect::<Vec<_>>();

        let mut outcomes = Vec::with_capacity(snapshot.len());
        for (slot, asset) in snapshot {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| asset.check(now))) {
                Ok(Ok(status)) => Outcome::Status(status),
                Ok(Err(e)) => Outcome::Failed(e),
                Err(payload) => Outcome::Failed(from_panic_payload(payload)),
            };
            outcomes.push((slot, asset, outcome));
        }

        let mut summary = CheckSummary {
            checked: outcomes.len(),
            ..CheckSummary::default()
        };
        let mut abandoned = Vec::new();
        {
            let mut assets = self.assets();
            for (slot, asset, outcome) in outcomes {
                // The slot may have been deregistered, and even reused, while we were checking.
                let Some(entry) = assets.get_mut(slot).filter(|entry| Arc::ptr_eq(&entry.asset, &asset)) else {
                    continue;
                };

                match outcome {
                    Outcome::Status(AssetStatus::Pending) => entry.failures = 0,
                    Outcome::Status(AssetStatus::Resolved) => {
                        assets.remove(slot);
                        summary.resolved += 1;
                    }
                    Outcome::Failed(e) => {
                        entry.failures += 1;
                        summary.failed += 1;
                        self.diagnostics.emit(Diagnostic::AssetCheckFailed {
                            supervisor: Arc::clone(&self.id),
                            asset: Arc::from(asset.name()),
                            error: Arc::from(format!("{:#}", e)),
                            failures: entry.failures,
                        });
                        if entry.failures >= self.max_check_failures {
                            assets.remove(slot);
                            abandoned.push(asset);
                        }
                    }
                }
            }
            self.assets_gauge.set(assets.len() as f64);
        }

        summary.abandoned = abandoned.len();
        for asset in abandoned {
            self.diagnostics.emit(Diagnostic::AssetAbandoned {
                supervisor: Arc::clone(&self.id),
                asset: Arc::from(asset.name()),
            });
            asset.abandon();
        }

        if summary.checked > 0 {
            trace!(supervisor_id = %self.id, checked = summary.checked, resolved = summary.resolved, failed = summary.failed, "Checked assets.");
        }
        summary
    }
}

/// A supervisor.
pub struct Supervisor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub(crate) fn new(
        index: usize, tick_interval: Duration, max_check_failures: usize, clock: Clock, diagnostics: Diagnostics,
    ) -> Self {
        let id: Arc<str> = Arc::from(format!("skein-{}", index));
        Self {
            inner: Arc::new(Inner {
                index,
                assets_gauge: gauge!("skein_supervisor_assets", "supervisor_id" => id.to_string()),
                id,
                tick_interval,
                max_check_failures: max_check_failures.max(1),
                clock,
                diagnostics,
                assets: Mutex::new(Slab::new()),
                shutdown: Mutex::new(false),
                signal: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Returns the identifier of the supervisor.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Starts the supervisor on a dedicated thread, named `<id>-sup-rt`.
    ///
    /// # Errors
    ///
    /// If the supervisor was already started, or the thread cannot be spawned, an error is returned.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if thread.is_some() {
            return Err(SupervisorError::AlreadyStarted {
                supervisor_id: Arc::clone(&self.inner.id),
            });
        }

        *self.inner.shutdown() = false;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("{}-sup-rt", self.inner.id))
            .spawn(move || inner.run())
            .map_err(|source| SupervisorError::SpawnThread {
                supervisor_id: Arc::clone(&self.inner.id),
                source,
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stops the supervisor, abandoning every asset still registered.
    ///
    /// Blocks until the supervisor thread has exited, if it was running. Assets are abandoned whether or not the
    /// supervisor was ever started.
    pub fn stop(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            *self.inner.shutdown() = true;
            self.inner.signal.notify_all();
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let remaining = self.inner.assets().drain().collect::<Vec<_>>();
        self.inner.assets_gauge.set(0.0);
        debug!(supervisor_id = %self.inner.id, abandoned = remaining.len(), "Abandoning remaining assets.");
        for entry in remaining {
            entry.asset.abandon();
        }
    }

    /// Registers an asset, to be checked from the next tick onwards.
    pub fn register_asset(&self, asset: Arc<dyn Asset>) -> AssetKey {
        let mut assets = self.inner.assets();
        trace!(supervisor_id = %self.inner.id, asset = asset.name(), "Registering asset.");
        let slot = assets.insert(Entry { asset, failures: 0 });
        self.inner.assets_gauge.set(assets.len() as f64);
        AssetKey {
            supervisor: self.inner.index,
            slot,
        }
    }

    /// Deregisters an asset without abandoning it.
    ///
    /// Returns `false` if the asset was no longer registered.
    pub fn deregister_asset(&self, key: AssetKey) -> bool {
        if key.supervisor != self.inner.index {
            return false;
        }
        let mut assets = self.inner.assets();
        let removed = assets.try_remove(key.slot).is_some();
        self.inner.assets_gauge.set(assets.len() as f64);
        removed
    }

    /// Returns the number of registered assets.
    pub fn asset_count(&self) -> usize {
        self.inner.assets().len()
    }

    /// Checks every registered asset against the given time, as a tick would.
    pub fn check_assets(&self, now: Instant) -> CheckSummary {
        self.inner.check_assets(now)
    }
}
