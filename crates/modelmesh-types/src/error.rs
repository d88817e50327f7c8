//! Error kinds shared across the catalog and lifecycle layers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the unification core. `Conflict` is reserved for
/// internal bookkeeping and is never constructed by public operations: id
/// conflicts are resolved by suffixing rather than surfaced.
#[derive(Debug, Error)]
pub enum Error {
    /// A required field was missing or malformed (e.g. a nil endpoint URL).
    /// Nil batch entries are skipped rather than raising this.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `resolve`/`get_aliases` found no matching id or alias.
    #[error("not found: {0}")]
    NotFound(String),

    /// Reserved for internal id/digest bookkeeping; never returned to callers.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Ingest was refused because the endpoint's circuit breaker is open.
    #[error("circuit open for endpoint {0}")]
    CircuitOpen(String),

    /// The underlying failure is not worth retrying.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The underlying failure may succeed on a later attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A caller-supplied deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A retry helper exhausted its attempt budget.
    #[error("retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted { attempts: u32, source: Box<Error> },
}

impl Error {
    /// Whether the retry helper should attempt this error again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_) | Self::Timeout(_) | Self::Cancelled)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_input(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_and_timeout_and_cancelled_are_not_retryable() {
        assert!(!Error::Permanent("boom".into()).is_retryable());
        assert!(!Error::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn transient_is_retryable() {
        assert!(Error::Transient("boom".into()).is_retryable());
    }
}
