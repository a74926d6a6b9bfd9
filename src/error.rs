use std::{fmt, time::Duration};
use thiserror::Error;

/// Failures the engine itself produces.
///
/// Any reason type used with a [`Promise`](crate::Promise) must be constructible
/// from this enum so that cycles, panics and timeouts can be reported through the
/// ordinary rejection channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("promise was resolved with itself (vicious cycle)")]
    ViciousCycle,
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("promise does not support operation: {0}")]
    Unsupported(&'static str),
    #[error("promise is still pending and no work is left to run")]
    Stalled,
    #[error("runtime exceeded its limit of {0} turns")]
    TurnLimit(u64),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Builds a plain message reason.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_promise::Error;
    /// assert_eq!(Error::msg("boom").to_string(), "boom");
    /// ```
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::msg(message)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Message(message)
    }
}

/// A rejection that escaped a chain terminated with [`Promise::done`](crate::Promise::done).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uncaught {
    pub reason: String,
    pub trace: String,
}

impl fmt::Display for Uncaught {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uncaught rejection: {}", self.reason)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}
