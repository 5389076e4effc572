use std::fmt;

use async_trait::async_trait;

/// A trait which provides connection-specific functionality.
///
/// Implementors supply the database- (or broker-, or whatever-) specific
/// logic to create, match, validate and tear down the connections a
/// [`Pool`](crate::Pool) manages. The pool never speaks to the underlying
/// resource directly outside of these calls, and never issues two
/// concurrent calls against the *same* connection.
#[async_trait]
pub trait ManagedConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory deals with.
    type Connection: Send + 'static;
    /// The error type returned by `Connection`s.
    type Error: std::error::Error + Send + Sync + 'static;
    /// Caller identity a checkout is matched against. Factories that don't
    /// distinguish callers can set this to `()`.
    type Subject: Send + Sync + Default + 'static;
    /// Per-request connection criteria a checkout is matched against.
    /// Factories that don't distinguish requests can set this to `()`.
    type RequestInfo: Send + Sync + Default + 'static;

    /// Attempts to create a new connection for `subject`/`cri`.
    async fn create(
        &self,
        subject: &Self::Subject,
        cri: &Self::RequestInfo,
    ) -> Result<Self::Connection, Self::Error>;

    /// Decides whether an idle connection popped from inventory may be
    /// handed to a caller checking out with `subject`/`cri`.
    ///
    /// The connection is always handed back in the returned tuple,
    /// regardless of outcome, so the pool can destroy it when it doesn't
    /// match — unlike a plain `Result<Option<Connection>, Error>`, this
    /// shape can't accidentally lose the resource on the rejection path.
    /// `Ok(false)` ("no match") is handled identically to `Err`: the pool
    /// destroys the candidate and keeps scanning (or manufactures
    /// immediately, under `fast_fail`). `Ok(true)` hands the caller the
    /// connection, possibly adapted (e.g. re-authenticated) in the process.
    ///
    /// The default implementation accepts every candidate unconditionally,
    /// which is the right behavior for factories with no notion of subject
    /// or request-scoped matching.
    async fn match_connection(
        &self,
        conn: Self::Connection,
        _subject: &Self::Subject,
        _cri: &Self::RequestInfo,
    ) -> (Self::Connection, Result<bool, Self::Error>) {
        (conn, Ok(true))
    }

    /// Resets per-checkout state on a connection before it is handed to a
    /// caller. Most factories have nothing to do here; a transactional
    /// adapter might issue a `ROLLBACK`.
    async fn cleanup(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Tears down a connection. Failures are logged by the pool, not
    /// propagated: a listener is marked `DESTROYED` regardless of whether
    /// this call succeeds.
    async fn destroy(&self, conn: Self::Connection) -> Result<(), Self::Error>;

    /// Synchronously determine if the connection is known to be broken,
    /// without a round trip. Used nowhere by the abstract protocol but kept
    /// as a hook adapters can use from `cleanup`/`match_connection`.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Optional validating capability. `None` means "this factory does not
    /// support background validation"; the pool logs a one-shot warning and
    /// takes no further action. `Some(Ok(true))` marks the connection
    /// invalid (destroyed); `Some(Ok(false))` marks it still good.
    async fn validate(&self, _conn: &Self::Connection) -> Option<Result<bool, Self::Error>> {
        None
    }
}

/// A trait to receive errors generated by connection management that aren't
/// tied to any particular caller (filler and maintenance failures).
pub trait ErrorSink<E>: fmt::Debug + Send + Sync + 'static {
    /// Receive an error.
    fn sink(&self, error: E);

    /// Clone this sink.
    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>>;
}

/// An `ErrorSink` implementation that forwards to `tracing::warn!` and
/// otherwise does nothing. The default for [`Builder`](crate::Builder).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl<E> ErrorSink<E> for TracingErrorSink
where
    E: fmt::Display,
{
    fn sink(&self, error: E) {
        tracing::warn!(%error, "unhandled error from pool background task");
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>> {
        Box::new(*self)
    }
}
