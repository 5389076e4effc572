use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::builder::Config;
use crate::factory::{ErrorSink, ManagedConnectionFactory};
use crate::listener::{Listener, ListenerId, ListenerState, SharedState};
use crate::pool::Pool;

/// State protected by the single mutex: the inventory list, the
/// checked-out set, and the counters `should_remove`/fill-size
/// computations need. Held briefly; never across an `.await`.
pub(crate) struct Internals<C> {
    pub(crate) inventory: VecDeque<Listener<C>>,
    /// Checked-out listeners, keyed by identity. The value is a clone of
    /// the same `SharedState` cell the caller's `Listener<C>` carries, so
    /// `flush` can mark a listener for destruction without owning the
    /// connection (the caller still has that).
    pub(crate) checked_out: HashMap<ListenerId, SharedState>,
    pub(crate) max_used: u32,
}

impl<C> Internals<C> {
    fn new(max_size: u32) -> Self {
        Internals {
            inventory: VecDeque::with_capacity(max_size as usize),
            checked_out: HashMap::with_capacity(max_size as usize),
            max_used: 0,
        }
    }

    pub(crate) fn note_checked_out(&mut self, max_size: u32, available_permits: usize) {
        let used = max_size.saturating_sub(available_permits as u32);
        self.max_used = self.max_used.max(used);
    }
}

/// The guts of a `Pool`, shared behind an `Arc` between the handle returned
/// to callers and the background maintenance/filler tasks.
pub(crate) struct SharedPool<F>
where
    F: ManagedConnectionFactory,
{
    pub(crate) config: Config,
    pub(crate) factory: F,
    pub(crate) error_sink: Box<dyn ErrorSink<F::Error>>,
    pub(crate) internals: Mutex<Internals<F::Connection>>,
    /// Fair FIFO counting semaphore; one permit per outstanding or
    /// in-flight-manufacture listener.
    pub(crate) permits: Semaphore,
    /// Listener identities that currently hold a permit. The single source
    /// of truth for "does this return need to release a permit", so that a
    /// double return (or a late asynchronous error notification racing a
    /// real return) releases at most one permit.
    pub(crate) permit_holders: Mutex<HashSet<ListenerId>>,
    pub(crate) started: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) validate_warned: AtomicBool,
    /// Background idle-eviction task, spawned by `reenable` when
    /// `idle_timeout` is set, aborted by `shutdown`.
    pub(crate) idle_task: Mutex<Option<JoinHandle<()>>>,
    /// Background validation task, spawned by `reenable` when
    /// `validation_interval` is set, aborted by `shutdown`.
    pub(crate) validation_task: Mutex<Option<JoinHandle<()>>>,
    /// Signalled whenever an idle sweep leaves the pool empty, for an
    /// embedding outer pool to observe; unused by a freestanding `Pool`.
    pub(crate) emptied: Notify,
    /// Invoked (outside any lock) after an idle sweep observes the pool
    /// empty, so an embedding outer pool can reclaim this sub-pool's slot.
    /// A freestanding pool leaves this unset.
    pub(crate) on_empty: Option<Box<dyn Fn(&Pool<F>) + Send + Sync>>,
}

impl<F> SharedPool<F>
where
    F: ManagedConnectionFactory,
{
    pub(crate) fn new(
        config: Config,
        factory: F,
        error_sink: Box<dyn ErrorSink<F::Error>>,
        on_empty: Option<Box<dyn Fn(&Pool<F>) + Send + Sync>>,
    ) -> Arc<Self> {
        let max_size = config.max_size;
        Arc::new(SharedPool {
            config,
            factory,
            error_sink,
            internals: Mutex::new(Internals::new(max_size)),
            permits: Semaphore::new(max_size as usize),
            permit_holders: Mutex::new(HashSet::with_capacity(max_size as usize)),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(true),
            validate_warned: AtomicBool::new(false),
            idle_task: Mutex::new(None),
            validation_task: Mutex::new(None),
            emptied: Notify::new(),
            on_empty,
        })
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn sink_error(&self, error: F::Error) {
        self.error_sink.sink(error);
    }

    /// Records that `id` now holds a permit. Called exactly once per
    /// successful checkout/manufacture attempt, before the permit could
    /// possibly be released by a racing return.
    pub(crate) fn record_permit_holder(&self, id: ListenerId) {
        self.permit_holders.lock().unwrap().insert(id);
    }

    /// Releases the permit for `id` exactly once, if (and only if) `id`
    /// is still recorded as holding one. Returns whether a permit was
    /// actually released, so callers can log anomalies if they expected
    /// one to be present.
    pub(crate) fn release_permit_for(&self, id: ListenerId) -> bool {
        let released = self.permit_holders.lock().unwrap().remove(&id);
        if released {
            self.permits.add_permits(1);
        }
        released
    }

    pub(crate) fn inventory_len(&self) -> usize {
        self.internals.lock().unwrap().inventory.len()
    }

    pub(crate) fn checked_out_len(&self) -> usize {
        self.internals.lock().unwrap().checked_out.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        let internals = self.internals.lock().unwrap();
        internals.inventory.is_empty() && internals.checked_out.is_empty()
    }

    /// How many more listeners would need to exist (idle or checked out)
    /// to satisfy `min_idle`. Read outside the mutex by the filler after
    /// manufacturing, so it may momentarily under-count relative to other
    /// concurrent fillers; the filler's loop tolerates this.
    pub(crate) fn deficit(&self) -> u32 {
        let internals = self.internals.lock().unwrap();
        let have = internals.inventory.len() + internals.checked_out.len();
        self.config.min_idle.saturating_sub(have as u32)
    }

    pub(crate) async fn do_destroy(&self, mut listener: Listener<F::Connection>) {
        if listener.state.get() == ListenerState::Destroyed {
            return;
        }
        listener.state.set(ListenerState::Destroyed);
        if let Err(e) = self.factory.destroy(listener.conn).await {
            tracing::debug!(error = %e, "factory destroy failed; listener remains destroyed");
        }
    }

    pub(crate) fn note_checked_out(&self) {
        let available = self.permits.available_permits();
        self.internals
            .lock()
            .unwrap()
            .note_checked_out(self.config.max_size, available);
    }

    pub(crate) fn cutoff(&self) -> Option<Instant> {
        self.config
            .idle_timeout
            .map(|timeout| Instant::now() - timeout)
    }
}
