//! Error types and error-handling strategy for taskloom.
//!
//! This module defines the crate-wide error type used by every component.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - User-callback failures are propagated verbatim to the submitting caller
//! - Queue-internal failures never cross the user boundary except as
//!   `Cancelled`, `FactoryFailed`, or `Shutdown`
//! - Invalid-state misuse (double release, unlock with zero claims) is
//!   logged at error severity and otherwise a no-op where safe

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled before producing a result.
    Cancelled,
    /// A non-blocking variant found the operation would have to wait.
    WouldBlock,
    /// A pool or lazy factory could not produce a value.
    FactoryFailed,
    /// Release of an unheld claim, unlock with zero claims, or submission
    /// with an already-cancelled token.
    InvalidState,
    /// A user callback failed or panicked; the failure is re-raised to the
    /// caller of the corresponding `execute*`.
    CallbackFailed,
    /// The queue or pool has been shut down.
    Shutdown,
}

impl ErrorKind {
    /// Returns a short static label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::WouldBlock => "would block",
            Self::FactoryFailed => "factory failed",
            Self::InvalidState => "invalid state",
            Self::CallbackFailed => "callback failed",
            Self::Shutdown => "shut down",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for taskloom operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Creates a `Cancelled` error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates a `WouldBlock` error.
    #[must_use]
    pub const fn would_block() -> Self {
        Self::new(ErrorKind::WouldBlock)
    }

    /// Creates a `Shutdown` error.
    #[must_use]
    pub const fn shut_down() -> Self {
        Self::new(ErrorKind::Shutdown)
    }

    /// Creates an `InvalidState` error with a description of the misuse.
    #[must_use]
    pub fn invalid_state(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_context(context)
    }

    /// Creates a `FactoryFailed` error wrapping the underlying cause.
    #[must_use]
    pub fn factory_failed(source: Self) -> Self {
        Self {
            kind: ErrorKind::FactoryFailed,
            context: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a `CallbackFailed` error from a payload extracted out of a
    /// panic. The panic message is preserved when it was a string.
    #[must_use]
    pub fn callback_panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callback panicked".to_string());
        Self::new(ErrorKind::CallbackFailed).with_context(msg)
    }

    /// Attaches context to the error.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches a source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns `true` if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns the context string, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}: {context}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::invalid_state("claim released twice");
        assert_eq!(err.to_string(), "invalid state: claim released twice");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn factory_failure_chains_source() {
        let cause = Error::cancelled();
        let err = Error::factory_failed(cause);
        assert_eq!(err.kind(), ErrorKind::FactoryFailed);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn panic_payload_message_is_kept() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let err = Error::callback_panicked(payload.as_ref());
        assert_eq!(err.kind(), ErrorKind::CallbackFailed);
        assert_eq!(err.context(), Some("boom"));
    }
}
