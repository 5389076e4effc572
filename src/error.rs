use std::time::Duration;

/// Errors returned by [`Pool::get`](crate::Pool::get).
///
/// The permit ledger is restored on every one of these paths before the
/// error reaches the caller: a `PoolError` is never returned while a permit
/// is still outstanding for the failed attempt.
#[derive(thiserror::Error, Debug)]
pub enum PoolError<E> {
    /// The permit gate did not yield a permit within `connection_timeout`.
    ///
    /// Non-retryable within this call (the wait already happened), but the
    /// caller may call `get` again.
    #[error("timed out waiting for a connection after {elapsed:?}")]
    NoCapacity {
        /// How long the caller waited before giving up.
        elapsed: Duration,
    },

    /// The pool has been shut down and is not accepting new checkouts.
    ///
    /// Retryable in the sense that a different pool (e.g. another sub-pool
    /// in an embedding outer pool) may still serve the request.
    #[error("pool is shut down")]
    ShuttingDown,

    /// The factory failed while manufacturing a new managed connection.
    ///
    /// The permit reserved for this attempt has already been released by
    /// the time this error is constructed.
    #[error("failed to create a new connection")]
    CreateFailed(#[source] E),
}

impl<E> PoolError<E> {
    /// True if the error reflects pool-wide unavailability rather than a
    /// one-off factory failure (i.e. calling `get` again immediately is not
    /// obviously pointless).
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::ShuttingDown)
    }
}

/// Outcome of a fallible factory match, kept distinct from [`PoolError`]
/// because it never escapes the checkout loop as a caller-visible error;
/// see `ManagedConnectionFactory::match_connection`. A rejection and a
/// match error are handled identically by the checkout loop, so both
/// collapse to `Rejected` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchOutcome {
    Matched,
    Rejected,
}
