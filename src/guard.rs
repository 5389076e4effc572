use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::factory::ManagedConnectionFactory;
use crate::inner::SharedPool;
use crate::listener::{Listener, ListenerId, ListenerState};
use crate::pool::return_listener;

/// A connection checked out of a [`Pool`](crate::Pool).
///
/// Dereferences to `F::Connection`. Returned to the pool automatically when
/// dropped (via a detached task, since `Drop` cannot `.await`); call
/// [`Pool::return_connection`](crate::Pool::return_connection) directly if
/// you need to force destruction (`kill = true`) or want the return to be
/// awaited rather than fire-and-forget.
pub struct PooledConnection<F: ManagedConnectionFactory> {
    pool: Arc<SharedPool<F>>,
    listener: Option<Listener<F::Connection>>,
}

impl<F: ManagedConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(pool: Arc<SharedPool<F>>, listener: Listener<F::Connection>) -> Self {
        PooledConnection {
            pool,
            listener: Some(listener),
        }
    }

    /// Disassembles the guard without running `Drop`'s auto-return,
    /// handing the caller (always `Pool::return_connection`) the raw
    /// listener to process explicitly.
    pub(crate) fn into_parts(mut self) -> (Arc<SharedPool<F>>, Listener<F::Connection>) {
        let listener = self.listener.take().expect("listener taken twice");
        (self.pool.clone(), listener)
    }

    /// A cloneable handle that can force this connection to be destroyed
    /// on return even from outside this guard's scope — e.g. a task
    /// observing the underlying connection's own error channel.
    ///
    /// The notifier cannot destroy the connection itself (it does not own
    /// it), so it only marks the shared state; the actual teardown happens
    /// the next time this guard is returned or dropped, at which point the
    /// pool sees the mark and forces `kill = true`.
    pub fn broken_notifier(&self) -> BrokenNotifier {
        BrokenNotifier {
            id: self.listener.as_ref().expect("listener taken twice").id,
            state: self.listener.as_ref().unwrap().state.clone(),
        }
    }
}

impl<F: ManagedConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<F: ManagedConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        &self.listener.as_ref().expect("listener taken twice").conn
    }
}

impl<F: ManagedConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        &mut self.listener.as_mut().expect("listener taken twice").conn
    }
}

impl<F: ManagedConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                return_listener(pool, listener, false).await;
            });
        }
    }
}

/// Handle allowing an asynchronous error notification (originating outside
/// the task that owns a [`PooledConnection`]) to mark a connection broken.
///
/// See [`PooledConnection::broken_notifier`].
#[derive(Clone)]
pub struct BrokenNotifier {
    #[allow(dead_code)]
    id: ListenerId,
    state: crate::listener::SharedState,
}

impl BrokenNotifier {
    /// Marks the connection for destruction. Takes effect the next time
    /// the owning guard is returned to the pool (explicitly or via drop).
    pub fn mark_broken(&self) {
        self.state.set(ListenerState::Destroy);
    }
}

impl fmt::Debug for BrokenNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokenNotifier").finish_non_exhaustive()
    }
}
