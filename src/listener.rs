use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Identifies a listener for the lifetime of a single checkout, used as the
/// key of the permit-holder map and the checked-out set.
pub(crate) type ListenerId = u64;

pub(crate) fn next_listener_id() -> ListenerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The three states a listener can occupy. `Destroyed` is terminal: a
/// listener never transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ListenerState {
    Normal = 0,
    Destroy = 1,
    Destroyed = 2,
}

impl ListenerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ListenerState::Normal,
            1 => ListenerState::Destroy,
            _ => ListenerState::Destroyed,
        }
    }
}

/// A shared, lock-free cell for a listener's state.
///
/// Split out from `Listener<C>` itself because the pool needs to mark a
/// *checked-out* listener for destruction (during `flush`) without owning
/// the connection it wraps — the connection stays with the caller until
/// `return_connection` is called. Both the checked-out-set entry and the
/// `Listener<C>` the caller holds share a clone of this cell.
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        SharedState(Arc::new(AtomicU8::new(ListenerState::Normal as u8)))
    }

    pub(crate) fn get(&self) -> ListenerState {
        ListenerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ListenerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The pool's wrapper around a managed connection, carrying the identity,
/// state and timestamps the core reasons about. Owned by the pool while
/// idle, by the caller (inside a `PooledConnection`) while checked out.
#[derive(Debug)]
pub(crate) struct Listener<C> {
    pub(crate) id: ListenerId,
    pub(crate) conn: C,
    pub(crate) state: SharedState,
    pub(crate) last_used: Instant,
    pub(crate) last_validated: Instant,
}

impl<C> Listener<C> {
    pub(crate) fn new(conn: C) -> Self {
        let now = Instant::now();
        Listener {
            id: next_listener_id(),
            conn,
            state: SharedState::new(),
            last_used: now,
            last_validated: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn is_timed_out(&self, cutoff: Instant) -> bool {
        self.last_used <= cutoff
    }
}
