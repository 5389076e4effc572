use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use respool::{Builder, ManagedConnectionFactory, PoolError};

static TRACING_INIT: Once = Once::new();

/// Enables `tracing` output for a test, controlled by `RUST_LOG` (e.g.
/// `RUST_LOG=debug cargo test`). Safe to call from every test; only the
/// first call takes effect.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Debug)]
struct ConnError(&'static str);

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConnError {}

/// A connection is just an id; tests assert on identity to tell reuse
/// apart from fresh manufacture.
#[derive(Debug)]
struct Conn(u32);

#[derive(Default)]
struct Stats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

struct MockFactory {
    stats: Arc<Stats>,
    next_id: AtomicU32,
    match_queue: Mutex<VecDeque<bool>>,
    validate_queue: Mutex<VecDeque<Option<bool>>>,
    fail_create: AtomicBool,
}

impl MockFactory {
    fn new() -> Self {
        MockFactory {
            stats: Arc::new(Stats::default()),
            next_id: AtomicU32::new(0),
            match_queue: Mutex::new(VecDeque::new()),
            validate_queue: Mutex::new(VecDeque::new()),
            fail_create: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ManagedConnectionFactory for MockFactory {
    type Connection = Conn;
    type Error = ConnError;
    type Subject = ();
    type RequestInfo = ();

    async fn create(&self, _subject: &(), _cri: &()) -> Result<Conn, ConnError> {
        if self.fail_create.load(Ordering::Acquire) {
            return Err(ConnError("create failed"));
        }
        self.stats.created.fetch_add(1, Ordering::AcqRel);
        Ok(Conn(self.next_id.fetch_add(1, Ordering::AcqRel)))
    }

    async fn match_connection(
        &self,
        conn: Conn,
        _subject: &(),
        _cri: &(),
    ) -> (Conn, Result<bool, ConnError>) {
        let matched = self.match_queue.lock().unwrap().pop_front().unwrap_or(true);
        (conn, Ok(matched))
    }

    async fn destroy(&self, _conn: Conn) -> Result<(), ConnError> {
        self.stats.destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn validate(&self, _conn: &Conn) -> Option<Result<bool, ConnError>> {
        self.validate_queue.lock().unwrap().pop_front().flatten().map(Ok)
    }
}

#[tokio::test]
async fn exhausts_capacity_and_times_out() {
    let factory = MockFactory::new();
    let pool = Builder::new()
        .max_size(2)
        .min_idle(0)
        .connection_timeout(Duration::from_millis(100))
        .idle_timeout(None)
        .build(factory)
        .await;

    let c1 = pool.get().await.expect("first checkout");
    let c2 = pool.get().await.expect("second checkout");
    assert_ne!(c1.0, c2.0);

    let start = Instant::now();
    let err = pool.get().await.expect_err("third checkout should fail");
    assert!(matches!(err, PoolError::NoCapacity { .. }));
    assert!(start.elapsed() >= Duration::from_millis(90));

    drop(c1);
    drop(c2);
}

#[tokio::test]
async fn fast_fail_false_scans_and_manufactures() {
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    factory.match_queue.lock().unwrap().extend([false, false]);

    let pool = Builder::new()
        .max_size(2)
        .min_idle(2)
        .prefill(true)
        .fast_fail(false)
        .idle_timeout(None)
        .build(factory)
        .await;

    assert_eq!(pool.state().idle_connections, 2);

    let conn = pool
        .get()
        .await
        .expect("checkout should manufacture after scanning");
    drop(conn);

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 2);
    assert_eq!(stats.created.load(Ordering::Acquire), 3);
}

#[tokio::test]
async fn fast_fail_true_stops_after_first_rejection() {
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    factory.match_queue.lock().unwrap().push_back(false);

    let pool = Builder::new()
        .max_size(2)
        .min_idle(2)
        .prefill(true)
        .fast_fail(true)
        .idle_timeout(None)
        .build(factory)
        .await;

    assert_eq!(pool.state().idle_connections, 2);

    let _conn = pool
        .get()
        .await
        .expect("checkout should manufacture immediately on first rejection");

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 1);
    assert_eq!(pool.state().idle_connections, 1);
}

#[tokio::test]
async fn strict_min_idle_eviction_keeps_floor() {
    let factory = MockFactory::new();
    let pool = Builder::new()
        .max_size(5)
        .min_idle(1)
        .idle_timeout(Some(Duration::from_millis(50)))
        .reaper_rate(Duration::from_millis(20))
        .strict_min(true)
        .build(factory)
        .await;

    for _ in 0..3 {
        let conn = pool.get().await.unwrap();
        drop(conn);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.state().idle_connections, 3);

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(pool.state().idle_connections, 1);
}

#[tokio::test]
async fn shutdown_flushes_inventory_and_marks_checked_out() {
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    let pool = Builder::new()
        .max_size(3)
        .min_idle(0)
        .idle_timeout(None)
        .build(factory)
        .await;

    let checked_out = pool.get().await.unwrap();
    let idle1 = pool.get().await.unwrap();
    let idle2 = pool.get().await.unwrap();
    pool.return_connection(idle1, false).await;
    pool.return_connection(idle2, false).await;

    assert_eq!(pool.state().idle_connections, 2);
    assert_eq!(pool.state().connections, 3);

    pool.shutdown().await;

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 2);
    assert!(!pool.is_empty(), "the checked-out connection is still outstanding");
    assert!(!pool.is_running());

    pool.return_connection(checked_out, false).await;

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 3);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn concurrent_flush_and_return_destroys_checked_out() {
    init_tracing();
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    let pool = Builder::new()
        .max_size(1)
        .min_idle(0)
        .idle_timeout(None)
        .build(factory)
        .await;

    let conn = pool.get().await.unwrap();

    let flush_pool = pool.clone();
    let flush_task = tokio::spawn(async move { flush_pool.flush().await });
    pool.return_connection(conn, false).await;
    flush_task.await.unwrap();

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 1);
    assert_eq!(stats.created.load(Ordering::Acquire), 1);
    assert!(pool.is_empty());

    // the permit was released exactly once regardless of race order: a
    // subsequent checkout must succeed rather than time out.
    let again = tokio::time::timeout(Duration::from_millis(200), pool.get())
        .await
        .expect("checkout should not hang")
        .expect("permit must be available after the flush/return race");
    drop(again);
}

#[tokio::test]
async fn get_return_get_reuses_from_inventory() {
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    let pool = Builder::new()
        .max_size(2)
        .min_idle(0)
        .idle_timeout(None)
        .build(factory)
        .await;

    let first = pool.get().await.unwrap();
    let first_id = first.0;
    pool.return_connection(first, false).await;

    let second = pool.get().await.unwrap();
    assert_eq!(second.0, first_id, "should reuse the returned listener, not manufacture");
    assert_eq!(stats.created.load(Ordering::Acquire), 1);
    assert_eq!(pool.max_used_connections(), 1);
}

#[tokio::test]
async fn flush_then_fill_restores_min_idle() {
    let factory = MockFactory::new();
    let pool = Builder::new()
        .max_size(4)
        .min_idle(2)
        .prefill(true)
        .idle_timeout(None)
        .build(factory)
        .await;

    assert_eq!(pool.state().idle_connections, 2);

    pool.flush().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pool.state().idle_connections, 2);
}

#[tokio::test]
async fn permit_grants_are_fifo() {
    let factory = MockFactory::new();
    let pool = Builder::new()
        .max_size(1)
        .min_idle(0)
        .idle_timeout(None)
        .build(factory)
        .await;

    let held = pool.get().await.unwrap();
    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut waiters = Vec::new();
    for i in 0..3u32 {
        let pool = pool.clone();
        let order_tx = order_tx.clone();
        waiters.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
            let conn = pool.get().await.unwrap();
            order_tx.send(i).unwrap();
            drop(conn);
        }));
    }
    // let every waiter queue behind the semaphore before releasing it
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(held);

    for waiter in waiters {
        waiter.await.unwrap();
    }
    drop(order_tx);

    let mut order = Vec::new();
    while let Some(i) = order_rx.recv().await {
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2], "permits must be granted in arrival order");
}

#[tokio::test]
async fn validator_destroys_invalid_connections() {
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    factory.validate_queue.lock().unwrap().push_back(Some(true));

    let pool = Builder::new()
        .max_size(2)
        .min_idle(1)
        .prefill(true)
        .idle_timeout(None)
        .validation_interval(Some(Duration::from_millis(30)))
        .reaper_rate(Duration::from_millis(20))
        .build(factory)
        .await;

    assert_eq!(pool.state().idle_connections, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 1);
    // the filler should have topped back up to min_idle after the destroy
    assert_eq!(pool.state().idle_connections, 1);
}

#[tokio::test]
async fn broken_notifier_forces_kill_on_return() {
    init_tracing();
    let factory = MockFactory::new();
    let stats = factory.stats.clone();
    let pool = Builder::new()
        .max_size(1)
        .min_idle(0)
        .idle_timeout(None)
        .build(factory)
        .await;

    let conn = pool.get().await.unwrap();
    let notifier = conn.broken_notifier();

    // simulate an asynchronous error notification arriving on a different
    // task than the one holding the guard, racing the eventual return.
    let marker = tokio::spawn(async move {
        notifier.mark_broken();
    });
    marker.await.unwrap();

    pool.return_connection(conn, false).await;

    assert_eq!(stats.destroyed.load(Ordering::Acquire), 1, "marked-broken connection must be destroyed on return");
    assert_eq!(stats.created.load(Ordering::Acquire), 1);
    assert_eq!(pool.state().idle_connections, 0, "a killed connection must not re-enter inventory");

    // the permit must have been released exactly once: a subsequent
    // checkout must succeed immediately rather than time out, and the
    // resulting pool must still be internally consistent (no double
    // release, no leaked permit).
    let again = tokio::time::timeout(Duration::from_millis(200), pool.get())
        .await
        .expect("checkout should not hang")
        .expect("permit must be available after the broken-notifier return");
    assert_eq!(stats.created.load(Ordering::Acquire), 2);
    drop(again);
}

#[tokio::test]
async fn create_failure_releases_the_permit() {
    let factory = MockFactory::new();
    factory.fail_create.store(true, Ordering::Release);

    let pool = Builder::new()
        .max_size(1)
        .min_idle(0)
        .idle_timeout(None)
        .build(factory)
        .await;

    let err = pool.get().await.expect_err("create is configured to fail");
    assert!(matches!(err, PoolError::CreateFailed(_)));

    // the permit reserved for the failed attempt must have been released,
    // or this second call would hang until `connection_timeout` instead of
    // failing immediately on the (still-failing) create call.
    let second = tokio::time::timeout(Duration::from_millis(200), pool.get())
        .await
        .expect("second attempt should not hang waiting for a permit");
    assert!(matches!(second, Err(PoolError::CreateFailed(_))));
}
