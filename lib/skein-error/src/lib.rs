//! Error primitives shared across the workspace.
//!
//! Typed errors live next to the code that produces them (as `snafu` enums). Anything user-provided, such as a function
//! body or a resource source failing, is carried as a [`GenericError`].

/// A type-erased error.
///
/// Function bodies, resource sources, and other pieces of user code report failures with this type, since the engine
/// never needs to inspect them beyond rendering them into an escalation.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`], and can be constructed from a string literal, a format string
/// (with arguments accepted, in the same order as `std::format!`), or a value which implements `Debug` and `Display`,
/// such as an existing error that implements `std::error::Error`.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

use std::{any::Any, fmt::Display};

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: We wrap `anyhow::Context` so the extension methods don't collide with `snafu::ResultExt` in modules that need
// both.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily only once an error does occur.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// Converts a panic payload, as returned by `std::panic::catch_unwind`, into a generic error.
///
/// Payloads carrying a `&str` or `String` keep their message. Anything else is reported as an opaque panic.
pub fn from_panic_payload(payload: Box<dyn Any + Send>) -> GenericError {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        generic_error!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        generic_error!("panicked: {}", message)
    } else {
        generic_error!("panicked with a non-string payload")
    }
}
