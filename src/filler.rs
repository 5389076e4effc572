use tokio::time::timeout;

use crate::factory::ManagedConnectionFactory;
use crate::listener::Listener;
use crate::pool::Pool;

/// Fires a detached `fill_to_min` task. Safe to call repeatedly and
/// concurrently: every run reads the current deficit itself, so redundant
/// calls converge on the same target rather than over-filling.
pub(crate) fn spawn_fill_to_min<F: ManagedConnectionFactory>(pool: Pool<F>) {
    tokio::spawn(async move {
        fill_to_min(pool).await;
    });
}

/// Tops the pool up toward `min_idle`, one connection at a time, stopping
/// as soon as the deficit closes, the pool shuts down, or a permit can't
/// be had within `connection_timeout`.
///
/// Idempotent: reads inventory + checked-out counts outside the mutex
/// after releasing each permit, which can momentarily under-count against
/// a concurrently running filler or checkout; the loop simply retries on
/// its next iteration rather than trying to make that read atomic with
/// the acquire.
pub(crate) async fn fill_to_min<F: ManagedConnectionFactory>(pool: Pool<F>) {
    let shared = &pool.inner;
    loop {
        if shared.deficit() == 0 {
            return;
        }

        let permit = match timeout(shared.config.connection_timeout, shared.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return,
        };

        if shared.is_shutdown() || shared.deficit() == 0 {
            drop(permit);
            return;
        }

        // Held only for the duration of this manufacture: a freshly
        // filled connection goes straight to the idle inventory, not the
        // checked-out set, so it must not hold a permit afterward. Unlike
        // `get_with`'s checked-out permit (which outlives this function
        // and is tracked via `permit_holders`), this one is released by
        // ordinary `Drop` when the loop iteration ends.
        let conn = match shared
            .factory
            .create(&F::Subject::default(), &F::RequestInfo::default())
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                shared.sink_error(e);
                drop(permit);
                return;
            }
        };

        let listener = Listener::new(conn);
        shared.internals.lock().unwrap().inventory.push_back(listener);
        drop(permit);
    }
}
