use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::managed::ObjectState;
use crate::pool::{ObjectFactory, ObjectPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct FactoryStats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_create: AtomicBool,
}

struct TestFactory {
    stats: Arc<FactoryStats>,
}

impl ObjectFactory for TestFactory {
    type Object = usize;

    fn name(&self) -> String {
        "test".to_string()
    }

    fn create(&self) -> PoolResult<usize> {
        if self.stats.fail_create.load(Ordering::SeqCst) {
            return Err(PoolError::CreationFailed("refused".to_string()));
        }
        Ok(self.stats.created.fetch_add(1, Ordering::SeqCst))
    }

    fn destroy(&self, _object: usize) -> PoolResult<()> {
        self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config() -> PoolConfig {
    PoolConfig {
        min: 1,
        max: 2,
        interval: Duration::from_millis(50),
        expire: Duration::from_secs(60),
        max_ttl: None,
        in_use_idle_time: None,
        time_to_wait: Duration::from_millis(300),
        time_to_sleep: Duration::from_millis(20),
        daemon: false,
        auto_debug_threshold: 100,
        debug: false,
    }
}

fn create_test_pool(config: PoolConfig) -> (Arc<ObjectPool<TestFactory>>, Arc<FactoryStats>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let stats = Arc::new(FactoryStats::default());
    let pool = ObjectPool::new(
        TestFactory {
            stats: stats.clone(),
        },
        config,
    )
    .unwrap();
    (pool, stats)
}

#[test]
fn test_each_acquire_below_max_creates_one() {
    let config = PoolConfig {
        max: 5,
        ..test_config()
    };
    let (pool, stats) = create_test_pool(config);
    let mut leases = Vec::new();
    for i in 1..=5 {
        leases.push(pool.acquire().unwrap());
        assert_eq!(pool.size(), i);
        assert_eq!(stats.created.load(Ordering::SeqCst), i);
    }
    assert!(pool.states().iter().all(|s| *s == ObjectState::InUse));
}

#[test]
fn test_released_member_is_reused() {
    let (pool, stats) = create_test_pool(test_config());
    let first = pool.acquire().unwrap();
    let id = first.id();
    first.release();

    let second = pool.acquire().unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(stats.created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_exhausted_pool_fails_after_wait() {
    let (pool, stats) = create_test_pool(test_config());
    let _a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();

    let start = Instant::now();
    let result = pool.acquire();
    assert!(start.elapsed() >= Duration::from_millis(300));
    match result {
        Err(PoolError::NoObjectAvailable { members, .. }) => {
            assert!(members.contains("2 member(s)"));
            assert!(members.contains("in_use"));
        }
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("pool should be exhausted"),
    }
    assert_eq!(pool.size(), 2);
    assert_eq!(stats.created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_release_during_wait_unblocks_acquire() {
    let config = PoolConfig {
        time_to_wait: Duration::from_secs(3),
        // long poll period, so only the release signal can wake the waiter in time
        time_to_sleep: Duration::from_secs(2),
        ..test_config()
    };
    let (pool, _stats) = create_test_pool(config);
    let a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    let released_id = a.id();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let lease = pool.acquire().map(|l| l.id());
            (lease, start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(100));
    drop(a);

    let (lease, elapsed) = waiter.join().unwrap();
    assert_eq!(lease.unwrap(), released_id);
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(pool.size(), 2);
}

#[test]
fn test_size_never_exceeds_max_under_contention() {
    let config = PoolConfig {
        max: 3,
        time_to_wait: Duration::from_secs(5),
        time_to_sleep: Duration::from_millis(5),
        ..test_config()
    };
    let (pool, stats) = create_test_pool(config);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let lease = pool.acquire().unwrap();
                    assert!(pool.size() <= 3);
                    lease.with(|v| *v).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(pool.size() <= 3);
    assert!(stats.created.load(Ordering::SeqCst) <= 3);
}

#[test]
fn test_release_clears_lease_site() {
    let config = PoolConfig {
        debug: true,
        ..test_config()
    };
    let (pool, _stats) = create_test_pool(config);
    let lease = pool.acquire().unwrap();
    assert!(lease.managed().lease_site().is_some());
    assert!(pool.describe_members().contains("leased at"));
    lease.release();

    assert_eq!(pool.states(), vec![ObjectState::Free]);
    assert!(!pool.describe_members().contains("leased at"));
}

#[test]
fn test_auto_debug_threshold_enables_capture() {
    let config = PoolConfig {
        max: 3,
        auto_debug_threshold: 1,
        ..test_config()
    };
    let (pool, _stats) = create_test_pool(config);
    let first = pool.acquire().unwrap();
    assert!(first.managed().lease_site().is_none());
    let second = pool.acquire().unwrap();
    assert!(second.managed().lease_site().is_some());
}

#[test]
fn test_expired_free_members_evicted_down_to_min() {
    let config = PoolConfig {
        max: 3,
        expire: Duration::from_millis(50),
        ..test_config()
    };
    let (pool, stats) = create_test_pool(config);
    let leases: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    drop(leases);
    assert_eq!(pool.size(), 3);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.sweep(), 2);
    assert_eq!(pool.size(), 1);
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 2);

    // at min, idleness alone never evicts
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.sweep(), 0);
    assert_eq!(pool.size(), 1);
}

#[test]
fn test_ttl_evicts_below_min() {
    let config = PoolConfig {
        max_ttl: Some(Duration::from_millis(50)),
        ..test_config()
    };
    let (pool, stats) = create_test_pool(config);
    pool.acquire().unwrap().release();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.size(), 0);
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_idle_lease_is_severed() {
    let config = PoolConfig {
        in_use_idle_time: Some(Duration::from_millis(50)),
        ..test_config()
    };
    let (pool, stats) = create_test_pool(config);
    let lease = pool.acquire().unwrap();
    let id = lease.id();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.size(), 0);
    assert!(matches!(lease.with(|v| *v), Err(PoolError::ObjectDestroyed(x)) if x == id));
    drop(lease);
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_touched_lease_survives_sweep() {
    let config = PoolConfig {
        in_use_idle_time: Some(Duration::from_millis(300)),
        ..test_config()
    };
    let (pool, _stats) = create_test_pool(config);
    let lease = pool.acquire().unwrap();
    for _ in 0..3 {
        thread::sleep(Duration::from_millis(150));
        lease.touch();
    }
    assert_eq!(pool.sweep(), 0);
    assert!(lease.with(|v| *v).is_ok());
}

#[test]
fn test_destroy_all() {
    let (pool, stats) = create_test_pool(test_config());
    let a = pool.acquire().unwrap();
    pool.acquire().unwrap().release();
    assert_eq!(pool.destroy_all(), 2);
    assert_eq!(pool.size(), 0);
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 2);
    assert!(a.with(|v| *v).is_err());

    // the pool keeps working afterwards
    let b = pool.acquire().unwrap();
    assert_eq!(pool.size(), 1);
    drop(b);
}

#[test]
fn test_creation_failure_does_not_touch_members() {
    let (pool, stats) = create_test_pool(test_config());
    let a = pool.acquire().unwrap();
    stats.fail_create.store(true, Ordering::SeqCst);
    assert!(matches!(
        pool.acquire(),
        Err(PoolError::NoObjectAvailable { .. })
    ));
    assert_eq!(pool.size(), 1);
    assert!(a.with(|v| *v).is_ok());
}

#[test]
fn test_maintenance_loop_sweeps_and_stops() {
    let config = PoolConfig {
        max: 3,
        expire: Duration::from_millis(30),
        ..test_config()
    };
    let (pool, stats) = create_test_pool(config);
    pool.start().unwrap();
    assert!(pool.is_running());

    let leases: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    drop(leases);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(pool.size(), 1);

    pool.stop();
    assert!(!pool.is_running());
    assert_eq!(pool.size(), 0);
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 3);
    assert!(matches!(pool.acquire(), Err(PoolError::Stopped(_))));
}

#[test]
fn test_stop_without_start_destroys_members() {
    let (pool, stats) = create_test_pool(test_config());
    pool.acquire().unwrap().release();
    pool.stop();
    assert_eq!(pool.size(), 0);
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);
}
