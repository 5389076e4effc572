use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::timeout;

use crate::builder::Builder;
use crate::error::{MatchOutcome, PoolError};
use crate::factory::ManagedConnectionFactory;
use crate::guard::PooledConnection;
use crate::inner::SharedPool;
use crate::listener::{Listener, ListenerState};
use crate::maintenance;

/// Information about the current state of a [`Pool`].
pub struct State {
    /// Connections currently managed by the pool (idle + checked out).
    pub connections: u32,
    /// Connections currently idle in the inventory.
    pub idle_connections: u32,
    /// High-water mark of `max_size - available_permits` observed so far.
    pub max_used_connections: u32,
    _p: (),
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("connections", &self.connections)
            .field("idle_connections", &self.idle_connections)
            .field("max_used_connections", &self.max_used_connections)
            .finish()
    }
}

/// A bounded, semaphore-guarded pool of managed connections.
///
/// Cheap to clone: internally an `Arc` around the pool's shared state.
pub struct Pool<F: ManagedConnectionFactory> {
    pub(crate) inner: Arc<SharedPool<F>>,
}

impl<F: ManagedConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ManagedConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Pool({:p})", self.inner))
    }
}

impl<F: ManagedConnectionFactory> Pool<F> {
    pub(crate) fn from_shared(inner: Arc<SharedPool<F>>) -> Self {
        Pool { inner }
    }

    /// Returns a [`Builder`] to configure a new pool.
    pub fn builder() -> Builder<F> {
        Builder::new()
    }

    /// Acquires a connection, using `F::Subject` and `F::RequestInfo`'s
    /// `Default` for factories that don't distinguish callers or requests.
    pub async fn get(&self) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        self.get_with(&F::Subject::default(), &F::RequestInfo::default())
            .await
    }

    /// Acquires a connection matched against `subject`/`cri`.
    ///
    /// Implements the checkout protocol: block for a permit, scan the
    /// inventory tail-first for a match, and manufacture a new connection
    /// if none is found (or `fast_fail` short-circuits the scan).
    pub async fn get_with(
        &self,
        subject: &F::Subject,
        cri: &F::RequestInfo,
    ) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        let pool = &self.inner;
        let start = Instant::now();

        let permit = match timeout(pool.config.connection_timeout, pool.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(PoolError::ShuttingDown);
            }
            Err(_elapsed) => {
                return Err(PoolError::NoCapacity {
                    elapsed: start.elapsed(),
                });
            }
        };
        // The permit is tracked by `ListenerId` in `permit_holders` from
        // here on, not by holding this guard; `forget` stops it from
        // auto-releasing when dropped so a later `return_connection` (on
        // a different task entirely) is what releases it.
        permit.forget();

        loop {
            if pool.is_shutdown() {
                pool.permits.add_permits(1);
                return Err(PoolError::ShuttingDown);
            }

            let popped = {
                let mut internals = pool.internals.lock().unwrap();
                match internals.inventory.pop_back() {
                    Some(listener) => {
                        internals.checked_out.insert(listener.id, listener.state.clone());
                        drop(internals);
                        pool.note_checked_out();
                        Some(listener)
                    }
                    None => None,
                }
            };

            let mut listener = match popped {
                Some(listener) => listener,
                None => break,
            };

            let (conn, match_result) = pool
                .factory
                .match_connection(listener.conn, subject, cri)
                .await;
            listener.conn = conn;

            let outcome = match match_result {
                Ok(true) => MatchOutcome::Matched,
                Ok(false) => {
                    tracing::debug!(listener_id = listener.id, "checkout: no match, destroying candidate");
                    MatchOutcome::Rejected
                }
                Err(e) => {
                    tracing::debug!(listener_id = listener.id, error = %e, "checkout: match failed, destroying candidate");
                    MatchOutcome::Rejected
                }
            };

            match outcome {
                MatchOutcome::Matched => {
                    pool.record_permit_holder(listener.id);
                    return Ok(PooledConnection::new(pool.clone(), listener));
                }
                MatchOutcome::Rejected => {
                    let id = listener.id;
                    pool.internals.lock().unwrap().checked_out.remove(&id);
                    pool.do_destroy(listener).await;
                    if pool.config.fast_fail {
                        break;
                    }
                }
            }
        }

        // Inventory scan exhausted (or fast-failed out of it): manufacture.
        let conn = match pool.factory.create(subject, cri).await {
            Ok(conn) => conn,
            Err(e) => {
                pool.permits.add_permits(1);
                return Err(PoolError::CreateFailed(e));
            }
        };
        let listener = Listener::new(conn);
        {
            let mut internals = pool.internals.lock().unwrap();
            internals
                .checked_out
                .insert(listener.id, listener.state.clone());
            drop(internals);
            pool.note_checked_out();
        }

        if pool
            .started
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
            && pool.config.min_idle > 0
        {
            crate::filler::spawn_fill_to_min(self.clone());
        }

        pool.record_permit_holder(listener.id);
        Ok(PooledConnection::new(pool.clone(), listener))
    }

    /// Explicitly returns a checked-out connection to the pool.
    ///
    /// `kill` forces destruction regardless of the listener's state; pass
    /// `false` for a normal return. The `PooledConnection` guard calls this
    /// automatically (with `kill = false`) when dropped, so most callers
    /// never need to call it directly.
    pub async fn return_connection(&self, conn: PooledConnection<F>, kill: bool) {
        let (pool, listener) = conn.into_parts();
        return_listener(pool, listener, kill).await;
    }

    /// Reports whether the pool has no connections at all, idle or
    /// checked out.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Reports whether the pool is accepting new checkouts.
    pub fn is_running(&self) -> bool {
        !self.inner.is_shutdown()
    }

    /// Snapshots the pool's connection counts.
    pub fn state(&self) -> State {
        let internals = self.inner.internals.lock().unwrap();
        State {
            connections: (internals.inventory.len() + internals.checked_out.len()) as u32,
            idle_connections: internals.inventory.len() as u32,
            max_used_connections: internals.max_used,
            _p: (),
        }
    }

    /// Registers the pool with the background idle-eviction and
    /// validation tasks (per configuration) and clears `shutdown`.
    ///
    /// Called automatically by `Builder::build`/`build_unchecked`; exposed
    /// so an embedding outer pool can revive a previously shut-down
    /// sub-pool. A freestanding `Pool` never needs to call this itself.
    pub fn reenable(&self) {
        self.inner.shutdown.store(false, std::sync::atomic::Ordering::Release);
        maintenance::reenable(self);
    }

    /// Shuts the pool down: stops accepting new checkouts, aborts the
    /// background maintenance tasks, and flushes every connection the pool
    /// currently holds (idle immediately, checked-out on next return).
    ///
    /// Terminal for this pool instance; `reenable` is provided for
    /// embedding scenarios that choose to revive it, but a freestanding
    /// pool does not call it automatically.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, std::sync::atomic::Ordering::Release);
        maintenance::abort(self);
        self.flush().await;
    }

    /// Marks every checked-out listener for destruction (taking effect on
    /// its next return) and immediately destroys everything currently
    /// idle. Re-fills toward `min_idle` afterward unless the pool is shut
    /// down.
    pub async fn flush(&self) {
        let (to_destroy, checked_out_marked) = {
            let mut internals = self.inner.internals.lock().unwrap();
            for state in internals.checked_out.values() {
                state.set(ListenerState::Destroy);
            }
            let checked_out_marked = internals.checked_out.len();
            let to_destroy: Vec<_> = internals.inventory.drain(..).collect();
            (to_destroy, checked_out_marked)
        };
        tracing::debug!(
            destroyed = to_destroy.len(),
            marked = checked_out_marked,
            "flush: draining inventory, marking checked-out listeners for destruction"
        );
        for listener in to_destroy {
            self.inner.do_destroy(listener).await;
        }
        if !self.inner.is_shutdown() && self.inner.config.min_idle > 0 {
            crate::filler::spawn_fill_to_min(self.clone());
        }
    }

    /// Runs one `fill_to_min` pass to completion and waits for it,
    /// matching `Builder::build`'s "wait for the configured minimum before
    /// returning" contract.
    pub(crate) async fn fill_to_min_now(&self) {
        crate::filler::fill_to_min(self.clone()).await;
    }

    /// Fires a detached `fill_to_min` task, matching
    /// `Builder::build_unchecked`'s "don't wait" contract.
    pub(crate) fn spawn_fill_to_min(&self) {
        crate::filler::spawn_fill_to_min(self.clone());
    }

    /// The high-water mark of concurrently outstanding connections.
    pub fn max_used_connections(&self) -> u32 {
        self.inner.internals.lock().unwrap().max_used
    }
}

/// Core of `return_connection`, shared by the public API and
/// `PooledConnection`'s `Drop` impl. Takes the `Arc` directly so `Drop`
/// (which only has `Arc<SharedPool<F>>`, not a `Pool<F>`) can call it too.
pub(crate) async fn return_listener<F: ManagedConnectionFactory>(
    pool: Arc<SharedPool<F>>,
    mut listener: Listener<F::Connection>,
    mut kill: bool,
) {
    let id = listener.id;

    // A background task may have destroyed this listener (e.g. via
    // `flush`, racing an in-flight checkout) while it was still checked
    // out. If so, there's nothing left to clean up but the permit.
    if listener.state.get() == ListenerState::Destroyed {
        if pool.release_permit_for(id) {
            tracing::debug!(listener_id = id, "return: already destroyed, releasing permit");
        }
        return;
    }

    if let Err(e) = pool.factory.cleanup(&mut listener.conn).await {
        tracing::warn!(listener_id = id, error = %e, "return: cleanup failed, forcing kill");
        kill = true;
    }

    let to_destroy = {
        let mut internals = pool.internals.lock().unwrap();

        if matches!(
            listener.state.get(),
            ListenerState::Destroy | ListenerState::Destroyed
        ) {
            kill = true;
        }

        internals.checked_out.remove(&id);

        if !kill && internals.inventory.len() >= pool.config.max_size as usize {
            tracing::warn!(
                listener_id = id,
                "return: inventory already at max_size, forcing kill (more connections exist than permits allow)"
            );
            kill = true;
        }

        let to_destroy = if kill {
            // Shouldn't be present, but an asynchronous error notification
            // can race a normal return; be defensive rather than duplicate.
            if let Some(pos) = internals.inventory.iter().position(|l| l.id == id) {
                internals.inventory.remove(pos);
            }
            Some(listener)
        } else {
            listener.touch();
            if internals.inventory.iter().any(|l| l.id == id) {
                tracing::debug!(listener_id = id, "return: double-return detected, ignoring");
            } else {
                internals.inventory.push_back(listener);
            }
            None
        };

        pool.release_permit_for(id);

        to_destroy
    };

    if let Some(listener) = to_destroy {
        pool.do_destroy(listener).await;
    }
}
