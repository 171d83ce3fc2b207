//! Escalations.
//!
//! An escalation is how a failure travels through the engine: out of a function body or a resource source, through any
//! escalation handlers that match it, and finally into a flow callback or the owning process's completion callback.
use std::{fmt, sync::Arc, time::Duration};

use skein_error::GenericError;
use snafu::Snafu;

/// A failure propagating through a process.
///
/// Escalations are cheap to clone, since the same escalation may be delivered to a recovery function, recorded as the
/// outcome of a process, and handed to a completion callback.
#[derive(Clone, Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Escalation {
    /// A resource could not be sourced.
    #[snafu(display("Failed to source resource '{}': {}", resource, reason))]
    Sourcing {
        /// Name of the resource.
        resource: Arc<str>,

        /// Underlying failure.
        reason: Arc<GenericError>,
    },

    /// Something did not finish before its deadline.
    #[snafu(display("'{}' timed out after {:?}.", subject, after))]
    Timeout {
        /// Name of the resource or pool that timed out.
        subject: Arc<str>,

        /// How long was waited before giving up.
        after: Duration,
    },

    /// A function body, or a callback acting on its behalf, failed.
    #[snafu(display("Function '{}' failed: {}", function, reason))]
    Function {
        /// Name of the function.
        function: Arc<str>,

        /// Underlying failure.
        reason: Arc<GenericError>,
    },

    /// The process was cancelled before the function could run.
    #[snafu(display("Process was cancelled before function '{}' ran.", function))]
    Cancelled {
        /// Name of the function whose job was dropped.
        function: Arc<str>,
    },

    /// The worker pool responsible for a job became unusable.
    #[snafu(display("Worker pool '{}' is unusable: {}", pool, reason))]
    PoolFailure {
        /// Name of the pool.
        pool: Arc<str>,

        /// Why the pool failed.
        reason: Arc<str>,
    },
}

impl Escalation {
    pub(crate) fn sourcing(resource: &Arc<str>, reason: GenericError) -> Self {
        Self::Sourcing {
            resource: Arc::clone(resource),
            reason: Arc::new(reason),
        }
    }

    pub(crate) fn function(function: &Arc<str>, reason: GenericError) -> Self {
        Self::Function {
            function: Arc::clone(function),
            reason: Arc::new(reason),
        }
    }

    pub(crate) fn cancelled(function: &Arc<str>) -> Self {
        Self::Cancelled {
            function: Arc::clone(function),
        }
    }

    pub(crate) fn pool_failure(pool: &Arc<str>, reason: impl Into<Arc<str>>) -> Self {
        Self::PoolFailure {
            pool: Arc::clone(pool),
            reason: reason.into(),
        }
    }

    /// Returns the kind of this escalation.
    pub fn kind(&self) -> EscalationKind {
        match self {
            Self::Sourcing { .. } => EscalationKind::Sourcing,
            Self::Timeout { .. } => EscalationKind::Timeout,
            Self::Function { .. } => EscalationKind::Function,
            Self::Cancelled { .. } => EscalationKind::Cancelled,
            Self::PoolFailure { .. } => EscalationKind::PoolFailure,
        }
    }
}

/// The kind of an escalation, without its details.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EscalationKind {
    /// See [`Escalation::Sourcing`].
    Sourcing,

    /// See [`Escalation::Timeout`].
    Timeout,

    /// See [`Escalation::Function`].
    Function,

    /// See [`Escalation::Cancelled`].
    Cancelled,

    /// See [`Escalation::PoolFailure`].
    PoolFailure,
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sourcing => "sourcing",
            Self::Timeout => "timeout",
            Self::Function => "function",
            Self::Cancelled => "cancelled",
            Self::PoolFailure => "pool_failure",
        };
        f.write_str(name)
    }
}

/// Decides whether an escalation handler applies to an escalation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EscalationMatcher {
    /// Matches every escalation.
    Any,

    /// Matches escalations of the given kind.
    Kind(EscalationKind),
}

impl EscalationMatcher {
    /// Returns `true` if the escalation is matched.
    pub fn matches(&self, escalation: &Escalation) -> bool {
        match self {
            Self::Any => true,
            Self::Kind(kind) => escalation.kind() == *kind,
        }
    }
}

impl From<EscalationKind> for EscalationMatcher {
    fn from(kind: EscalationKind) -> Self {
        Self::Kind(kind)
    }
}
