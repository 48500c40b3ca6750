use std::time::Duration;

use thiserror::Error;

use crate::BoxError;

/// Error that can occur while establishing a new session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The connector failed to establish a session.
    #[error("creating connection")]
    Connecting(#[source] BoxError),

    /// The connector did not finish within the pool's connect timeout.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    pub(crate) fn connecting<E: Into<BoxError>>(error: E) -> Self {
        ConnectError::Connecting(error.into())
    }
}

/// Error returned when a lease request does not produce a session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseError {
    /// The pool was closed before or while the request was waiting.
    #[error("connection pool is closed")]
    Closed,

    /// The request's deadline elapsed before a session became available.
    #[error("timed out waiting for a pooled connection")]
    Timeout,

    /// The request was cancelled by the caller.
    #[error("lease request cancelled")]
    Cancelled,

    /// A new session was needed, and connecting failed.
    #[error("connecting for lease")]
    Connect(#[from] ConnectError),
}

impl LeaseError {
    /// Returns `true` if the pool was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, LeaseError::Closed)
    }

    /// Returns `true` if the request's deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LeaseError::Timeout)
    }

    /// Returns `true` if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LeaseError::Cancelled)
    }

    /// Returns `true` if connecting a new session failed.
    pub fn is_connect(&self) -> bool {
        matches!(self, LeaseError::Connect(_))
    }

    /// Returns `true` if a new lease request might succeed where this one failed.
    ///
    /// Closed pools never recover, and cancellation was the caller's own decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::Timeout | LeaseError::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(LeaseError: std::error::Error, Send, Sync, Into<BoxError>);
    assert_impl_all!(ConnectError: std::error::Error, Send, Sync);

    #[test]
    fn retryable() {
        assert!(LeaseError::Timeout.is_retryable());
        assert!(LeaseError::from(ConnectError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(!LeaseError::Closed.is_retryable());
        assert!(!LeaseError::Cancelled.is_retryable());
    }

    #[test]
    fn connect_error_source() {
        let error = LeaseError::from(ConnectError::connecting("refused"));
        assert!(error.is_connect());

        let source = error.source().expect("lease error has a source");
        assert_eq!(source.to_string(), "creating connection");
        assert_eq!(
            source.source().map(|s| s.to_string()).as_deref(),
            Some("refused")
        );
    }
}
