use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio::time::{interval, timeout};

use crate::factory::ManagedConnectionFactory;
use crate::inner::SharedPool;
use crate::listener::{Listener, ListenerState};
use crate::pool::Pool;

/// Spawns the idle-eviction and background-validation tasks for `pool`
/// according to its configuration, replacing any previously spawned ones.
/// Called by `Pool::reenable` (directly, or via `Builder::build`).
///
/// Aborts any tasks already running first: a double `reenable()` (or an
/// embedding outer pool reviving a sub-pool without checking
/// `is_running()` first) must not leak the previous idle-eviction/
/// validation loop — dropping a `JoinHandle` doesn't abort its task, so
/// overwriting it without aborting first would run it forever with no
/// remaining way to stop it.
pub(crate) fn reenable<F: ManagedConnectionFactory>(pool: &Pool<F>) {
    abort(pool);

    let shared = pool.inner.clone();

    if let Some(idle_timeout) = shared.config.idle_timeout {
        let _ = idle_timeout; // used by `remove_idle_connections` via `shared.cutoff()`
        let task_pool = Pool::from_shared(shared.clone());
        let rate = shared.config.reaper_rate;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(rate);
            loop {
                ticker.tick().await;
                remove_idle_connections(&task_pool).await;
            }
        });
        *shared.idle_task.lock().unwrap() = Some(handle);
    }

    if let Some(validation_interval) = shared.config.validation_interval {
        let task_pool = Pool::from_shared(shared.clone());
        let handle = tokio::spawn(async move {
            let mut ticker = interval(validation_interval);
            loop {
                ticker.tick().await;
                validate_connections(&task_pool).await;
            }
        });
        *shared.validation_task.lock().unwrap() = Some(handle);
    }
}

/// Aborts both background tasks, if running. Called by `Pool::shutdown`.
pub(crate) fn abort<F: ManagedConnectionFactory>(pool: &Pool<F>) {
    if let Some(handle) = pool.inner.idle_task.lock().unwrap().take() {
        handle.abort();
    }
    if let Some(handle) = pool.inner.validation_task.lock().unwrap().take() {
        handle.abort();
    }
}

/// Sweeps the inventory head for listeners idle past `idle_timeout`,
/// destroying them and (if any were destroyed) topping back up to
/// `min_idle`.
async fn remove_idle_connections<F: ManagedConnectionFactory>(pool: &Pool<F>) {
    let shared: &SharedPool<F> = &pool.inner;
    let Some(cutoff) = shared.cutoff() else {
        return;
    };

    let to_destroy = collect_idle_for_removal(shared, cutoff);
    if to_destroy.is_empty() {
        return;
    }

    tracing::debug!(count = to_destroy.len(), "idle eviction: destroying listeners");
    for listener in to_destroy {
        shared.do_destroy(listener).await;
    }

    if !shared.is_shutdown() && shared.config.min_idle > 0 {
        crate::filler::spawn_fill_to_min(pool.clone());
    }

    if shared.is_empty() {
        shared.emptied.notify_waiters();
        if let Some(on_empty) = &shared.on_empty {
            on_empty(pool);
        }
    }
}

fn collect_idle_for_removal<F: ManagedConnectionFactory>(
    shared: &SharedPool<F>,
    cutoff: Instant,
) -> Vec<Listener<F::Connection>> {
    let mut internals = shared.internals.lock().unwrap();
    let mut to_destroy = Vec::new();
    loop {
        let should_remove = match internals.inventory.front() {
            Some(listener) if listener.is_timed_out(cutoff) => {
                if shared.config.strict_min {
                    internals.inventory.len() > shared.config.min_idle as usize
                } else {
                    true
                }
            }
            _ => false,
        };
        if !should_remove {
            break;
        }
        // Chronologically ordered head-to-tail, so once the head is
        // fresher than `cutoff` every remaining entry is too.
        to_destroy.push(internals.inventory.pop_front().unwrap());
    }
    to_destroy
}

/// Revalidates listeners whose `last_validated` has aged past
/// `validation_interval`, destroying any the factory reports as invalid.
async fn validate_connections<F: ManagedConnectionFactory>(pool: &Pool<F>) {
    let shared: &SharedPool<F> = &pool.inner;
    let Some(validation_interval) = shared.config.validation_interval else {
        return;
    };

    // Borrow a permit for the duration of the sweep: serializes validation
    // against checkout at peak capacity without starving callers forever
    // (bounded by `connection_timeout`, same as a real checkout).
    let permit = match timeout(shared.config.connection_timeout, shared.permits.acquire()).await {
        Ok(Ok(permit)) => permit,
        _ => return,
    };

    let mut any_destroyed = false;
    loop {
        let candidate = take_validation_candidate(shared, validation_interval);
        let mut listener = match candidate {
            Some(listener) => listener,
            None => break,
        };

        match shared.factory.validate(&listener.conn).await {
            None => {
                if !shared.validate_warned.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        "background validation enabled but factory does not implement it; disabling checks for this pool"
                    );
                }
                // Can't validate; put it back untouched rather than lose it.
                shared.internals.lock().unwrap().inventory.push_back(listener);
                break;
            }
            Some(Ok(true)) if listener.state.get() != ListenerState::Destroy => {
                any_destroyed = true;
                shared.do_destroy(listener).await;
            }
            Some(Ok(_)) => {
                listener.last_validated = Instant::now();
                shared.internals.lock().unwrap().inventory.push_back(listener);
            }
            Some(Err(e)) => {
                shared.sink_error(e);
                listener.last_validated = Instant::now();
                shared.internals.lock().unwrap().inventory.push_back(listener);
            }
        }
    }

    drop(permit);

    if any_destroyed && !shared.is_shutdown() && shared.config.min_idle > 0 {
        crate::filler::spawn_fill_to_min(pool.clone());
    }
}

fn take_validation_candidate<F: ManagedConnectionFactory>(
    shared: &SharedPool<F>,
    validation_interval: std::time::Duration,
) -> Option<Listener<F::Connection>> {
    let mut internals = shared.internals.lock().unwrap();
    let cutoff = Instant::now() - validation_interval;
    let pos = internals
        .inventory
        .iter()
        .position(|l| l.last_validated <= cutoff)?;
    internals.inventory.remove(pos)
}
