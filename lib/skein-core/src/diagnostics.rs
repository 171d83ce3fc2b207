//! Out-of-band diagnostics.
//!
//! Some failures have nobody waiting on them: a worker pool dying, a supervisor asset that keeps failing its checks, a
//! resource that could not be discarded. These never reach a process's completion callback, so they are logged and
//! handed to any registered diagnostic listeners instead.
use std::{
    fmt,
    sync::{Arc, Mutex},
};

use tracing::{error, warn};

/// A diagnostic event.
#[derive(Clone, Debug)]
pub enum Diagnostic {
    /// A worker pool became unusable.
    PoolFailed {
        /// Name of the pool.
        pool: Arc<str>,

        /// Why the pool failed.
        reason: Arc<str>,
    },

    /// A supervisor asset failed its check.
    AssetCheckFailed {
        /// Identifier of the supervisor.
        supervisor: Arc<str>,

        /// Name of the asset.
        asset: Arc<str>,

        /// Rendered error.
        error: Arc<str>,

        /// Number of consecutive failed checks so far.
        failures: usize,
    },

    /// A supervisor asset was abandoned after failing too many checks.
    AssetAbandoned {
        /// Identifier of the supervisor.
        supervisor: Arc<str>,

        /// Name of the asset.
        asset: Arc<str>,
    },

    /// A resource value could not be discarded.
    DiscardFailed {
        /// Name of the resource.
        resource: Arc<str>,

        /// Rendered error.
        error: Arc<str>,
    },

    /// A flow or completion callback panicked.
    CallbackPanicked {
        /// Identifier of the process the callback belonged to.
        process_id: u64,

        /// Rendered panic message.
        error: Arc<str>,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolFailed { pool, reason } => write!(f, "worker pool '{}' failed: {}", pool, reason),
            Self::AssetCheckFailed {
                supervisor,
                asset,
                error,
                failures,
            } => write!(
                f,
                "asset '{}' on supervisor '{}' failed its check ({} in a row): {}",
                asset, supervisor, failures, error
            ),
            Self::AssetAbandoned { supervisor, asset } => {
                write!(f, "asset '{}' on supervisor '{}' was abandoned", asset, supervisor)
            }
            Self::DiscardFailed { resource, error } => {
                write!(f, "failed to discard resource '{}': {}", resource, error)
            }
            Self::CallbackPanicked { process_id, error } => {
                write!(f, "callback for process {} panicked: {}", process_id, error)
            }
        }
    }
}

type Listener = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// A diagnostic channel.
///
/// Cloning the channel is cheap, and all clones share the same set of listeners.
#[derive(Clone, Default)]
pub struct Diagnostics {
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl Diagnostics {
    /// Registers a listener that is called for every diagnostic emitted after this point.
    ///
    /// Listeners are called on whichever thread emitted the diagnostic, and must not block.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(Arc::new(listener));
    }

    /// Emits a diagnostic.
    pub fn emit(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::PoolFailed { pool, reason } => {
                error!(pool = %pool, reason = %reason, "Worker pool failed and is no longer usable.")
            }
            Diagnostic::AssetCheckFailed {
                supervisor,
                asset,
                error,
                failures,
            } => warn!(supervisor_id = %supervisor, asset = %asset, failures, error = %error, "Asset check failed."),
            Diagnostic::AssetAbandoned { supervisor, asset } => {
                error!(supervisor_id = %supervisor, asset = %asset, "Asset failed too many checks and was abandoned.")
            }
            Diagnostic::DiscardFailed { resource, error } => {
                warn!(resource = %resource, error = %error, "Failed to discard resource.")
            }
            Diagnostic::CallbackPanicked { process_id, error } => {
                error!(process_id, error = %error, "Callback panicked.")
            }
        }

        // Listeners are called outside the lock so that one may subscribe another.
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            listener(&diagnostic);
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("Diagnostics").field("listeners", &listeners).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use super::*;

    #[test]
    fn listeners_see_every_diagnostic() {
        let diagnostics = Diagnostics::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        diagnostics.clone().subscribe(move |d| seen2.lock().unwrap().push(d.to_string()));

        diagnostics.emit(Diagnostic::PoolFailed {
            pool: Arc::from("io"),
            reason: Arc::from("worker thread panicked"),
        });
        diagnostics.emit(Diagnostic::DiscardFailed {
            resource: Arc::from("db"),
            error: Arc::from("already closed"),
        });

        similar_asserts::assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "worker pool 'io' failed: worker thread panicked".to_string(),
                "failed to discard resource 'db': already closed".to_string(),
            ]
        );
    }

    #[test]
    fn listener_may_subscribe_during_emit() {
        let diagnostics = Diagnostics::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = diagnostics.clone();
        let calls2 = Arc::clone(&calls);
        diagnostics.subscribe(move |_| {
            let calls3 = Arc::clone(&calls2);
            inner.subscribe(move |_| {
                calls3.fetch_add(1, SeqCst);
            });
        });

        diagnostics.emit(Diagnostic::AssetAbandoned {
            supervisor: Arc::from("sup-0"),
            asset: Arc::from("pending"),
        });
        diagnostics.emit(Diagnostic::AssetAbandoned {
            supervisor: Arc::from("sup-0"),
            asset: Arc::from("pending"),
        });

        assert_eq!(calls.load(SeqCst), 1);
    }
}
