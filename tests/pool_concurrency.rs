// ==============================================
// POOL CONCURRENCY TESTS (integration)
// ==============================================
//
// Cross-thread behaviour: limited-capacity back-pressure, eviction ordering
// under the background collector, and a request/release storm. These need
// multi-threaded execution and cannot live inline.

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use rrdpool::path::canonical_path;
use rrdpool::prelude::*;
use tempfile::TempDir;

fn test_pool() -> RrdDbPool {
    RrdDbPool::with_factory(Arc::new(FileBackendFactory))
}

fn seed_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, b"rrd bytes").unwrap();
    path
}

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

// ==============================================
// Limited-capacity back-pressure
// ==============================================
//
// With limited_capacity on and capacity 1, a second distinct path must
// block until the first lease is released and the collector makes room.

mod back_pressure {
    use super::*;

    #[test]
    fn blocked_request_proceeds_after_release() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(test_pool());
        pool.set_capacity(1);
        pool.set_limited_capacity(true);

        let x = seed_file(&dir, "x.rrd");
        let y = seed_file(&dir, "y.rrd");

        let hx = pool.request(&x).unwrap();

        let (tx, rx) = mpsc::channel();
        let pool_b = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let result = pool_b.request(&y);
            tx.send(()).unwrap();
            result
        });

        // the second request must still be parked
        thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err(), "request for y completed while x held the only slot");

        pool.release(&hx).unwrap();

        rx.recv_timeout(Duration::from_secs(5))
            .expect("request for y did not complete after release");
        let hy = waiter.join().unwrap().unwrap();
        assert!(!hy.is_closed());
        pool.release(&hy).unwrap();
    }
}

// ==============================================
// Eviction ordering
// ==============================================
//
// Reclamation is FIFO over release events: the entry released first is
// closed first, and a re-used entry re-enters the queue at the tail.

mod eviction_order {
    use super::*;

    #[test]
    fn oldest_released_entry_is_closed_first() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool();
        pool.set_capacity(10);

        let a = seed_file(&dir, "a.rrd");
        let b = seed_file(&dir, "b.rrd");
        let ha = pool.request(&a).unwrap();
        let hb = pool.request(&b).unwrap();
        pool.release(&ha).unwrap();
        pool.release(&hb).unwrap();

        // table holds 2, so capacity 2 reclaims exactly one entry
        pool.set_capacity(2);
        assert!(wait_until(|| ha.is_closed(), Duration::from_secs(5)));
        assert!(!hb.is_closed());
        assert_eq!(pool.cached_paths(), vec![canonical_path(&b).unwrap()]);
    }

    #[test]
    fn reuse_moves_entry_to_queue_tail() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool();
        pool.set_capacity(10);

        let a = seed_file(&dir, "a.rrd");
        let b = seed_file(&dir, "b.rrd");
        let ha = pool.request(&a).unwrap();
        let hb = pool.request(&b).unwrap();
        pool.release(&ha).unwrap();
        pool.release(&hb).unwrap();

        // touch a again: it leaves the queue and re-enters at the tail
        let ha2 = pool.request(&a).unwrap();
        pool.release(&ha2).unwrap();

        pool.set_capacity(2);
        assert!(wait_until(|| hb.is_closed(), Duration::from_secs(5)));
        assert!(!ha.is_closed());
        assert_eq!(pool.cached_paths(), vec![canonical_path(&a).unwrap()]);
    }
}

// ==============================================
// Request/release storm
// ==============================================
//
// Many threads hammering a small set of paths. Afterwards every lease has
// been returned, counters are consistent, and no handle was closed while a
// lease was outstanding.

mod storm {
    use super::*;

    #[test]
    fn counters_and_leases_stay_consistent() {
        let num_threads = 8;
        let iterations = 50;

        let dir = TempDir::new().unwrap();
        let pool = Arc::new(test_pool());
        let paths: Arc<Vec<PathBuf>> = Arc::new(
            (0..4).map(|i| seed_file(&dir, &format!("p{i}.rrd"))).collect(),
        );

        let barrier = Arc::new(Barrier::new(num_threads));
        let workers: Vec<_> = (0..num_threads)
            .map(|tid| {
                let pool = Arc::clone(&pool);
                let paths = Arc::clone(&paths);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..iterations {
                        let path = &paths[(tid + i) % paths.len()];
                        let h = pool.request(path).unwrap();
                        assert!(!h.is_closed(), "handle closed while lease outstanding");
                        pool.release(&h).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.requests, (num_threads * iterations) as u64);
        assert!(stats.hits <= stats.requests);
        assert!((0.0..=1.0).contains(&stats.efficiency));
        assert!(stats.max_used_capacity >= stats.open);
        assert!(pool.cached_paths().len() <= paths.len());

        // all leases returned: every cached entry is idle
        assert_eq!(stats.idle, stats.open);

        pool.reset().unwrap();
        assert!(pool.cached_paths().is_empty());
    }
}

// ==============================================
// Shutdown interrupts waiters
// ==============================================

mod shutdown {
    use super::*;

    #[test]
    fn blocked_waiter_fails_with_interrupted() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(test_pool());
        pool.set_capacity(1);
        pool.set_limited_capacity(true);

        let x = seed_file(&dir, "x.rrd");
        let y = seed_file(&dir, "y.rrd");
        let _hx = pool.request(&x).unwrap();

        let pool_b = Arc::clone(&pool);
        let waiter = thread::spawn(move || pool_b.request(&y));

        thread::sleep(Duration::from_millis(100));
        pool.shutdown().unwrap();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PoolError::Interrupted { .. })));
    }
}
