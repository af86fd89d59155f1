//! Integration Tests for the Object Cache
//!
//! Exercises the public surface end to end: the documented reference
//! scenario, lease expiry, shell isolation, concurrent callers and the
//! tokio-driven sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use object_cache::cache::ManualClock;
use object_cache::tasks::ManualScheduler;
use object_cache::{CacheSettings, ObjectCache};
use parking_lot::Mutex;

// == Helper Functions ==

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type DisposalLog = Arc<Mutex<Vec<String>>>;

fn manual_cache(
    settings: CacheSettings,
) -> (ObjectCache<String, String>, Arc<ManualClock>, ManualScheduler, DisposalLog) {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let scheduler = ManualScheduler::new();
    let log: DisposalLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();

    let cache = ObjectCache::builder(settings)
        .clock(clock.clone())
        .scheduler(Arc::new(scheduler.clone()))
        .disposer(move |value: String| sink.lock().push(value))
        .build();

    (cache, clock, scheduler, log)
}

// == Reference Scenario ==

#[test]
fn test_reference_scenario() -> anyhow::Result<()> {
    let settings = CacheSettings::default()
        .with_capacity_limit(1)
        .with_idle_timeout(Duration::from_secs(2))
        .without_lease_timeout();
    let (cache, clock, scheduler, log) = manual_cache(settings);

    let e1 = cache.add("x".to_string(), "obj".to_string());
    assert_eq!(e1.reference_count(), 1);

    let e2 = cache
        .take("x")
        .ok_or_else(|| anyhow::anyhow!("x should be cached"))?;
    assert_eq!(e2.value().as_str(), "obj");
    assert_eq!(e2.reference_count(), 2);

    e1.release();
    assert_eq!(e2.reference_count(), 1);

    clock.advance(Duration::from_secs(3));
    scheduler.fire_all();
    assert_eq!(cache.len(), 1, "a referenced entry must survive the sweep");
    assert!(log.lock().is_empty());

    e2.release();
    clock.advance(Duration::from_secs(2));
    scheduler.fire_all();
    assert!(cache.is_empty());
    assert_eq!(*log.lock(), vec!["obj".to_string()]);
    Ok(())
}

#[test]
fn test_idle_entry_unreachable_after_timeout() {
    let settings = CacheSettings::default()
        .with_idle_timeout(Duration::from_secs(10))
        .without_lease_timeout();
    let (cache, clock, _scheduler, log) = manual_cache(settings);

    cache.add("k".to_string(), "v".to_string()).release();
    clock.advance(Duration::from_secs(9));
    cache.take("k").expect("still fresh").release();

    clock.advance(Duration::from_secs(10));
    assert!(cache.take("k").is_none());
    assert_eq!(*log.lock(), vec!["v".to_string()]);
}

#[test]
fn test_lease_evicts_busy_entry_on_next_idle_moment() {
    let settings = CacheSettings::default()
        .without_idle_timeout()
        .with_lease_timeout(Duration::from_secs(30));
    let (cache, clock, _scheduler, log) = manual_cache(settings);

    let mut current = cache.take_with("conn".to_string(), || "c1".to_string());
    for _ in 0..40 {
        clock.advance(Duration::from_secs(1));
        let next = cache.take("conn").expect("held entries are never evicted");
        current.release();
        current = next;
    }
    assert!(log.lock().is_empty());

    current.release();
    assert!(cache.is_empty());

    let fresh = cache.take_with("conn".to_string(), || "c2".to_string());
    assert_eq!(fresh.value().as_str(), "c2");
    assert_eq!(*log.lock(), vec!["c1".to_string()]);
}

#[test]
fn test_shell_isolation() {
    let (cache, _clock, _scheduler, log) = manual_cache(CacheSettings::default());

    let first = cache.add("k".to_string(), "v1".to_string());
    let second = cache.add("k".to_string(), "v2".to_string());
    assert!(second.is_shell());

    let extra = second.try_add_reference().expect("live shell");
    second.release();
    assert!(log.lock().is_empty());
    extra.release();
    assert_eq!(*log.lock(), vec!["v2".to_string()]);

    assert_eq!(first.value().as_str(), "v1");
    assert_eq!(cache.take("k").unwrap().value().as_str(), "v1");
}

#[test]
fn test_cloned_handles_share_entries() {
    let (cache, _clock, _scheduler, _log) = manual_cache(CacheSettings::default());
    let other = cache.clone();

    let _entry = cache.add("k".to_string(), "v".to_string());
    assert_eq!(other.len(), 1);
    assert!(other.take("k").is_some());
    assert_eq!(other.stats().hits, 1);
}

#[test]
fn test_factory_error_leaves_cache_untouched() {
    let (cache, _clock, scheduler, _log) = manual_cache(CacheSettings::default());

    let result = cache.try_take_with("k".to_string(), || {
        Err::<String, _>(anyhow::anyhow!("connection refused"))
    });

    let err = result.err().expect("factory error propagates");
    assert_eq!(err.to_string(), "connection refused");
    assert!(cache.is_empty());
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_values_without_disposer_are_dropped() {
    struct Resource(Arc<AtomicUsize>);
    impl Drop for Resource {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let dropped = Arc::new(AtomicUsize::new(0));
    let cache: ObjectCache<u32, Resource> = ObjectCache::builder(CacheSettings::default())
        .without_background_sweep()
        .build();

    let held = cache.add(1, Resource(dropped.clone()));
    cache.add(2, Resource(dropped.clone())).release();
    assert_eq!(dropped.load(Ordering::SeqCst), 0);

    cache.dispose();
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
    assert!(held.try_value().is_none());
}

// == Concurrency ==

#[test]
fn test_concurrent_callers_never_see_disposed_values() {
    init_tracing();
    let disposals: Arc<Mutex<HashMap<u64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(0));

    let sink = disposals.clone();
    // A zero idle timeout evicts on every last release, maximising churn.
    let cache: ObjectCache<u32, u64> = ObjectCache::builder(
        CacheSettings::default()
            .with_capacity_limit(3)
            .with_idle_timeout(Duration::ZERO)
            .without_lease_timeout()
            .with_purge_frequency(4),
    )
    .without_background_sweep()
    .disposer(move |id: u64| *sink.lock().entry(id).or_insert(0) += 1)
    .build();

    let workers: Vec<_> = (0..8u32)
        .map(|worker| {
            let cache = cache.clone();
            let disposals = disposals.clone();
            let next_id = next_id.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    let key = (worker + i) % 5;
                    let entry = cache.take_with(key, || next_id.fetch_add(1, Ordering::SeqCst));
                    let id = *entry.value();
                    assert!(
                        !disposals.lock().contains_key(&id),
                        "value {} disposed while held",
                        id
                    );

                    if let Some(extra) = entry.try_add_reference() {
                        entry.release();
                        assert_eq!(*extra.value(), id);
                        extra.release();
                    }
                    if i % 50 == 0 {
                        cache.sweep();
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert!(cache.len() <= 3);
    cache.dispose();

    let created = next_id.load(Ordering::SeqCst);
    let disposals = disposals.lock();
    assert_eq!(disposals.len() as u64, created);
    assert!(disposals.values().all(|&count| count == 1));
}

// == Background Sweep ==

#[tokio::test]
async fn test_tokio_sweep_evicts_idle_entries() {
    init_tracing();
    let log: DisposalLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();

    let cache: ObjectCache<String, String> = ObjectCache::builder(
        CacheSettings::default()
            .with_idle_timeout(Duration::from_millis(100))
            .without_lease_timeout(),
    )
    .disposer(move |value: String| sink.lock().push(value))
    .build();

    let held = cache.add("held".to_string(), "h".to_string());
    cache.add("idle".to_string(), "i".to_string()).release();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cache.len(), 1);
    assert_eq!(*log.lock(), vec!["i".to_string()]);
    assert!(cache.stats().sweeps >= 1);

    held.release();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cache.is_empty());
    assert_eq!(log.lock().len(), 2);
}

#[tokio::test]
async fn test_tokio_sweep_stops_after_dispose() {
    let cache: ObjectCache<String, String> = ObjectCache::new(
        CacheSettings::default().with_idle_timeout(Duration::from_millis(50)),
    );

    cache.add("k".to_string(), "v".to_string()).release();
    cache.dispose();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.stats().sweeps, 0);
    assert!(cache.is_disposed());
}
