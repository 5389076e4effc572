use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::factory::{ErrorSink, ManagedConnectionFactory, TracingErrorSink};
use crate::inner::SharedPool;
use crate::pool::Pool;

/// Configuration frozen at pool construction. Not exposed directly; read
/// through `Builder`'s setters and `Pool::state`/friends.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) max_size: u32,
    pub(crate) min_idle: u32,
    pub(crate) connection_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) validation_interval: Option<Duration>,
    pub(crate) prefill: bool,
    pub(crate) strict_min: bool,
    pub(crate) fast_fail: bool,
    pub(crate) reaper_rate: Duration,
}

/// A builder for a connection pool.
pub struct Builder<F: ManagedConnectionFactory> {
    max_size: u32,
    min_idle: u32,
    connection_timeout: Duration,
    idle_timeout: Option<Duration>,
    validation_interval: Option<Duration>,
    prefill: bool,
    strict_min: bool,
    fast_fail: bool,
    reaper_rate: Duration,
    error_sink: Box<dyn ErrorSink<F::Error>>,
    on_empty: Option<Box<dyn Fn(&Pool<F>) + Send + Sync>>,
    _p: PhantomData<F>,
}

impl<F: ManagedConnectionFactory> fmt::Debug for Builder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("max_size", &self.max_size)
            .field("min_idle", &self.min_idle)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("validation_interval", &self.validation_interval)
            .field("prefill", &self.prefill)
            .field("strict_min", &self.strict_min)
            .field("fast_fail", &self.fast_fail)
            .field("reaper_rate", &self.reaper_rate)
            .finish_non_exhaustive()
    }
}

impl<F: ManagedConnectionFactory> Default for Builder<F> {
    fn default() -> Self {
        Builder {
            max_size: 10,
            min_idle: 0,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            validation_interval: None,
            prefill: false,
            strict_min: false,
            fast_fail: false,
            reaper_rate: Duration::from_secs(30),
            error_sink: Box::new(TracingErrorSink),
            on_empty: None,
            _p: PhantomData,
        }
    }
}

impl<F: ManagedConnectionFactory> Builder<F> {
    /// Constructs a new `Builder`, initialized with its default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the hard cap on concurrently outstanding connections.
    ///
    /// Defaults to 10. Fixed for the lifetime of the pool: the permit gate
    /// is sized to this value at `build()` and never resized.
    pub fn max_size(mut self, max_size: u32) -> Self {
        assert!(max_size > 0, "max_size must be greater than zero!");
        self.max_size = max_size;
        self
    }

    /// Sets the floor of idle connections the filler tries to maintain.
    ///
    /// Defaults to 0 (no floor).
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Sets the maximum time a `get` call will wait for a permit before
    /// failing with `PoolError::NoCapacity`.
    ///
    /// Defaults to 30 seconds.
    pub fn connection_timeout(mut self, connection_timeout: Duration) -> Self {
        assert!(
            connection_timeout > Duration::from_secs(0),
            "connection_timeout must be non-zero"
        );
        self.connection_timeout = connection_timeout;
        self
    }

    /// Sets the idle timeout used by the maintenance driver.
    ///
    /// `None` disables idle eviction entirely. Defaults to 10 minutes.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the cadence of background liveness validation.
    ///
    /// `None` (the default) disables it.
    pub fn validation_interval(mut self, validation_interval: Option<Duration>) -> Self {
        assert!(
            validation_interval != Some(Duration::from_secs(0)),
            "validation_interval must be greater than zero!"
        );
        self.validation_interval = validation_interval;
        self
    }

    /// If true, the pool fills toward `min_idle` as part of construction
    /// rather than waiting for the first checkout to trigger it.
    ///
    /// Defaults to false.
    pub fn prefill(mut self, prefill: bool) -> Self {
        self.prefill = prefill;
        self
    }

    /// If true, idle eviction treats `min_idle` as a hard floor and stops
    /// sweeping once inventory would drop to it.
    ///
    /// Defaults to false.
    pub fn strict_min(mut self, strict_min: bool) -> Self {
        self.strict_min = strict_min;
        self
    }

    /// If true, a single match failure during checkout skips the rest of
    /// the inventory scan and manufactures a new connection immediately.
    ///
    /// Defaults to false.
    pub fn fast_fail(mut self, fast_fail: bool) -> Self {
        self.fast_fail = fast_fail;
        self
    }

    /// Sets the wake interval for the combined maintenance task (idle
    /// eviction and background validation).
    ///
    /// Defaults to 30 seconds.
    pub fn reaper_rate(mut self, reaper_rate: Duration) -> Self {
        self.reaper_rate = reaper_rate;
        self
    }

    /// Sets the sink for errors that are not associated with any particular
    /// caller (filler and maintenance failures).
    ///
    /// Defaults to a sink that forwards to `tracing::warn!`.
    pub fn error_sink(mut self, error_sink: Box<dyn ErrorSink<F::Error>>) -> Self {
        self.error_sink = error_sink;
        self
    }

    /// Registers a callback invoked (outside any lock) whenever an idle
    /// sweep leaves the pool completely empty.
    ///
    /// Meant for an embedding outer pool that groups several sub-pools by
    /// subject/credentials and wants to discard ones that have gone idle;
    /// a freestanding pool has no use for this and leaves it unset.
    pub fn on_empty(mut self, on_empty: Box<dyn Fn(&Pool<F>) + Send + Sync>) -> Self {
        self.on_empty = Some(on_empty);
        self
    }

    fn build_inner(self, factory: F) -> Pool<F> {
        assert!(
            self.min_idle <= self.max_size,
            "min_idle must be no larger than max_size"
        );

        let config = Config {
            max_size: self.max_size,
            min_idle: self.min_idle,
            connection_timeout: self.connection_timeout,
            idle_timeout: self.idle_timeout,
            validation_interval: self.validation_interval,
            prefill: self.prefill,
            strict_min: self.strict_min,
            fast_fail: self.fast_fail,
            reaper_rate: self.reaper_rate,
        };

        let shared = SharedPool::new(config, factory, self.error_sink, self.on_empty);
        Pool::from_shared(shared)
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// If `prefill` is set, waits for the initial fill-to-minimum to finish
    /// (or time out) before returning.
    pub async fn build(self, factory: F) -> Pool<F> {
        let prefill = self.prefill;
        let pool = self.build_inner(factory);
        pool.reenable();
        if prefill {
            pool.fill_to_min_now().await;
        }
        pool
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// Unlike `build`, this does not wait for any connections to be
    /// established before returning: prefill (if enabled) runs in the
    /// background.
    pub fn build_unchecked(self, factory: F) -> Pool<F> {
        let prefill = self.prefill;
        let pool = self.build_inner(factory);
        pool.reenable();
        if prefill {
            pool.spawn_fill_to_min();
        }
        pool
    }
}
