//! Cache Store Module
//!
//! [`ObjectCache`]: a keyed map of reference-counted entries guarded by a
//! single lock, with idle and lease eviction and a timer-driven sweep.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::entry::{Disposer, Entry, EntryCell, EntryOwner, Ownership};
use crate::cache::CacheStats;
use crate::config::CacheSettings;
use crate::tasks::{Scheduler, TimerHandle, TokioScheduler};

/// Tracked entry count at which the sweep timer is armed.
const SWEEP_THRESHOLD: usize = 1;

type Cell<K, V> = Arc<EntryCell<K, V>>;

// == Object Cache ==
/// A cache of shared, expensive-to-build values.
///
/// Every [`Entry`] handed out is one counted reference. Tracked entries
/// stay resident while referenced; once unreferenced they are evicted when
/// their idle or lease timeout has elapsed. When admission is refused (the
/// key is already cached or the cache is full) the caller gets a shell: an
/// entry only it can see, disposed on its last release.
///
/// Cloning the cache clones a handle to the same map.
pub struct ObjectCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

pub(crate) struct CacheInner<K, V> {
    state: Mutex<CacheState<K, V>>,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<dyn Scheduler>>,
    disposer: Option<Disposer<V>>,
    /// Shells torn down; they live outside the lock, so they count here
    shell_teardowns: Arc<AtomicU64>,
    self_ref: Weak<CacheInner<K, V>>,
}

struct CacheState<K, V> {
    entries: HashMap<K, Cell<K, V>>,
    capacity_limit: usize,
    sweep_timer: Option<SweepTimer>,
    timer_generation: u64,
    refused_admissions: usize,
    disposed: bool,
    stats: CacheStats,
}

struct SweepTimer {
    generation: u64,
    handle: Box<dyn TimerHandle>,
}

// == Builder ==
/// Configures an [`ObjectCache`].
pub struct ObjectCacheBuilder<K, V> {
    settings: CacheSettings,
    disposer: Option<Disposer<V>>,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<dyn Scheduler>>,
    detect_runtime: bool,
    _key: PhantomData<fn() -> K>,
}

impl<K, V> ObjectCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Teardown for evicted values. Without one, values are simply dropped.
    pub fn disposer(mut self, disposer: impl Fn(V) + Send + Sync + 'static) -> Self {
        self.disposer = Some(Arc::new(disposer));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Timer service for the background sweep.
    ///
    /// Defaults to a [`TokioScheduler`] when built inside a tokio runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// No background sweep; entries are only evicted on release, on lookup
    /// and by [`ObjectCache::sweep`].
    pub fn without_background_sweep(mut self) -> Self {
        self.scheduler = None;
        self.detect_runtime = false;
        self
    }

    pub fn build(self) -> ObjectCache<K, V> {
        let scheduler = match self.scheduler {
            Some(scheduler) => Some(scheduler),
            None if self.detect_runtime => match TokioScheduler::try_current() {
                Ok(scheduler) => Some(Arc::new(scheduler) as Arc<dyn Scheduler>),
                Err(e) => {
                    debug!("Background sweep disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let capacity_limit = self.settings.capacity_limit;
        let inner = Arc::new_cyclic(|self_ref| CacheInner {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                capacity_limit,
                sweep_timer: None,
                timer_generation: 0,
                refused_admissions: 0,
                disposed: false,
                stats: CacheStats::new(),
            }),
            settings: self.settings,
            clock: self.clock,
            scheduler,
            disposer: self.disposer,
            shell_teardowns: Arc::new(AtomicU64::new(0)),
            self_ref: self_ref.clone(),
        });

        ObjectCache { inner }
    }
}

impl<K, V> ObjectCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a cache with the default clock, no disposer, and a
    /// background sweep if a tokio runtime is available.
    pub fn new(settings: CacheSettings) -> Self {
        Self::builder(settings).build()
    }

    /// Starts a builder for a cache with a custom disposer, clock or
    /// scheduler.
    pub fn builder(settings: CacheSettings) -> ObjectCacheBuilder<K, V> {
        ObjectCacheBuilder {
            settings,
            disposer: None,
            clock: Arc::new(SystemClock),
            scheduler: None,
            detect_runtime: true,
            _key: PhantomData,
        }
    }

    // == Add ==
    /// Admits a freshly built value under `key`.
    ///
    /// If `key` is already cached or the cache is full, the value comes back
    /// as a shell that is never shared and is disposed on its last release.
    pub fn add(&self, key: K, value: V) -> Entry<K, V> {
        self.inner.add(key, value)
    }

    // == Take ==
    /// Takes a reference to the entry cached under `key`.
    ///
    /// Returns `None` if nothing is cached, or if the entry was unreferenced
    /// and already expired (it is evicted on the spot).
    pub fn take<Q>(&self, key: &Q) -> Option<Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.take(key)
    }

    /// Takes the entry cached under `key`, building and admitting one with
    /// `factory` on a miss.
    ///
    /// The factory runs outside the cache lock. Two callers racing on the
    /// same missing key may both build a value; the loser gets a shell.
    pub fn take_with<F>(&self, key: K, factory: F) -> Entry<K, V>
    where
        F: FnOnce() -> V,
    {
        match self.try_take_with(key, || Ok::<V, Infallible>(factory())) {
            Ok(entry) => entry,
            Err(never) => match never {},
        }
    }

    /// Like [`ObjectCache::take_with`] for a fallible factory.
    ///
    /// A factory error is returned as-is and leaves the cache untouched.
    pub fn try_take_with<F, E>(&self, key: K, factory: F) -> Result<Entry<K, V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(entry) = self.take(&key) {
            return Ok(entry);
        }
        let value = factory()?;
        Ok(self.add(key, value))
    }

    // == Sweep ==
    /// Evicts every unreferenced, expired entry now. Returns how many.
    pub fn sweep(&self) -> usize {
        let purged = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return 0;
            }
            let now = self.inner.clock.now();
            self.inner.purge_locked(&mut state, now)
        };

        let count = purged.len();
        if count > 0 {
            info!("Manual sweep: evicted {} expired entries", count);
        }
        dispose_all(purged);
        count
    }

    // == Dispose ==
    /// Shuts the cache down.
    ///
    /// Every resident entry is disposed whether or not it is still
    /// referenced, the timer is cancelled, and later calls to
    /// [`ObjectCache::add`] only produce shells. Callers must not keep using
    /// entries past this point. Teardown waits for any value borrow still
    /// held through [`Entry::value`], so do not call this while holding one.
    pub fn dispose(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.capacity_limit = 0;
            if let Some(timer) = state.sweep_timer.take() {
                timer.handle.cancel();
            }

            let drained: Vec<Cell<K, V>> = state.entries.drain().map(|(_, cell)| cell).collect();
            for cell in &drained {
                cell.mark_for_disposal();
            }
            state.stats.record_disposals(drained.len());
            state.stats.set_total_entries(0);
            drained
        };

        info!("Object cache disposed; tearing down {} entries", drained.len());
        dispose_all(drained);
    }

    // == Length ==
    /// Number of tracked entries; shells are not counted.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// The settings this cache was built with.
    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    // == Stats ==
    /// Snapshot of the cache's activity counters and current size.
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.set_total_entries(state.entries.len());
        stats.record_disposals(self.inner.shell_teardowns.load(Ordering::Relaxed) as usize);
        stats
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn add(&self, key: K, value: V) -> Entry<K, V> {
        let now = self.clock.now();
        let mut purged = Vec::new();

        let entry = {
            let mut state = self.state.lock();
            if self.admit_locked(&mut state, &key, now, &mut purged) {
                Entry::from_cell(self.insert_locked(&mut state, key, value, now))
            } else {
                state.stats.record_shell();
                Entry::shell(
                    key,
                    value,
                    now,
                    self.disposer.clone(),
                    Some(self.shell_teardowns.clone()),
                )
            }
        };

        dispose_all(purged);
        entry
    }

    fn take<Q>(&self, key: &Q) -> Option<Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut purged = Vec::new();

        let entry = {
            let mut state = self.state.lock();
            let found = state.entries.get(key).cloned();
            let Some(cell) = found else {
                state.stats.record_miss();
                return None;
            };

            let now = self.clock.now();
            if self.try_acquire_locked(&mut state, &cell, now, &mut purged) {
                state.stats.record_hit();
                trace!("Cache hit; {} references", cell.ref_count());
                Some(Entry::from_cell(cell))
            } else {
                state.stats.record_miss();
                None
            }
        };

        dispose_all(purged);
        entry
    }

    // == Admission ==
    /// Decides whether `key` may be inserted as a tracked entry.
    ///
    /// Every `purge_frequency` refusals of a full cache, expired entries are
    /// purged inline; the cells land in `purged` for teardown after unlock.
    fn admit_locked(
        &self,
        state: &mut CacheState<K, V>,
        key: &K,
        now: Instant,
        purged: &mut Vec<Cell<K, V>>,
    ) -> bool {
        if state.entries.contains_key(key) {
            debug!("Key already cached; handing out a shell");
            return false;
        }
        if state.entries.len() < state.capacity_limit {
            return true;
        }
        if state.capacity_limit == 0 {
            return false;
        }

        state.refused_admissions += 1;
        let purge_frequency = self.settings.purge_frequency;
        if purge_frequency > 0 && state.refused_admissions >= purge_frequency {
            state.refused_admissions = 0;
            purged.extend(self.purge_locked(state, now));
            debug!("Cache full; inline purge evicted {} entries", purged.len());
            return state.entries.len() < state.capacity_limit;
        }

        debug!(
            "Cache full ({} entries); handing out a shell",
            state.capacity_limit
        );
        false
    }

    fn insert_locked(
        &self,
        state: &mut CacheState<K, V>,
        key: K,
        value: V,
        now: Instant,
    ) -> Cell<K, V> {
        let owner: Weak<dyn EntryOwner<K, V>> = self.self_ref.clone();
        let created_at = self.settings.lease_timeout_enabled().then_some(now);
        let cell = EntryCell::new(
            key.clone(),
            value,
            Ownership::Tracked(owner),
            created_at,
            now,
            self.disposer.clone(),
        );

        state.entries.insert(key, cell.clone());
        state.stats.set_total_entries(state.entries.len());
        self.arm_timer_locked(state);
        cell
    }

    // == Acquire ==
    /// Adds a reference unless the entry is gone, or unreferenced and due
    /// for eviction, in which case it is evicted here.
    fn try_acquire_locked(
        &self,
        state: &mut CacheState<K, V>,
        cell: &Cell<K, V>,
        now: Instant,
        purged: &mut Vec<Cell<K, V>>,
    ) -> bool {
        if !cell.is_live() {
            return false;
        }
        if cell.ref_count() == 0 && self.should_purge(cell, now) {
            self.evict_locked(state, cell);
            purged.push(cell.clone());
            return false;
        }

        cell.acquire_locked();
        if self.settings.idle_timeout_enabled() {
            cell.touch(now);
        }
        true
    }

    // == Return ==
    /// Handles an entry whose last reference was just released. Returns
    /// whether the caller must tear it down once the lock is released.
    fn return_locked(&self, state: &mut CacheState<K, V>, cell: &Cell<K, V>) -> bool {
        if state.disposed {
            cell.locked_dispose();
            state.stats.record_disposals(1);
            return true;
        }

        let now = self.clock.now();
        if self.settings.idle_timeout_enabled() {
            cell.touch(now);
        }
        if self.should_purge(cell, now) {
            self.evict_locked(state, cell);
            return true;
        }
        false
    }

    // == Should Purge ==
    fn should_purge(&self, cell: &EntryCell<K, V>, now: Instant) -> bool {
        if cell.ref_count() != 0 {
            return false;
        }
        if self.settings.idle_timeout_enabled()
            && now.saturating_duration_since(cell.last_usage()) >= self.settings.idle_timeout
        {
            return true;
        }
        if self.settings.lease_timeout_enabled() {
            if let Some(created_at) = cell.created_at() {
                return now.saturating_duration_since(created_at) >= self.settings.lease_timeout;
            }
        }
        false
    }

    fn evict_locked(&self, state: &mut CacheState<K, V>, cell: &Cell<K, V>) {
        let resident = state
            .entries
            .get(cell.key())
            .is_some_and(|current| Arc::ptr_eq(current, cell));
        if resident {
            state.entries.remove(cell.key());
        }

        cell.locked_dispose();
        state.stats.record_evictions(1);
        state.stats.record_disposals(1);
        state.stats.set_total_entries(state.entries.len());
    }

    /// Removes and marks every unreferenced, expired entry.
    fn purge_locked(&self, state: &mut CacheState<K, V>, now: Instant) -> Vec<Cell<K, V>> {
        let mut purged = Vec::new();
        state.entries.retain(|_, cell| {
            if self.should_purge(cell, now) {
                cell.locked_dispose();
                purged.push(cell.clone());
                false
            } else {
                true
            }
        });

        state.stats.record_evictions(purged.len());
        state.stats.record_disposals(purged.len());
        state.stats.record_sweep();
        state.stats.set_total_entries(state.entries.len());
        purged
    }

    // == Sweep Timer ==
    fn arm_timer_locked(&self, state: &mut CacheState<K, V>) {
        if state.disposed || state.sweep_timer.is_some() || state.entries.len() < SWEEP_THRESHOLD {
            return;
        }
        if let Some(delay) = self.settings.sweep_interval() {
            self.schedule_sweep_locked(state, delay);
        }
    }

    fn schedule_sweep_locked(&self, state: &mut CacheState<K, V>, delay: Duration) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };

        state.timer_generation += 1;
        let generation = state.timer_generation;
        let cache = self.self_ref.clone();
        let handle = scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(cache) = cache.upgrade() {
                    cache.on_sweep_timer(generation);
                }
            }),
        );

        debug!("Sweep timer armed for {:?}", delay);
        state.sweep_timer = Some(SweepTimer { generation, handle });
    }

    fn on_sweep_timer(&self, generation: u64) {
        let purged = {
            let mut state = self.state.lock();
            match &state.sweep_timer {
                Some(timer) if timer.generation == generation => {}
                _ => {
                    trace!("Ignoring stale sweep timer");
                    return;
                }
            }
            state.sweep_timer = None;
            if state.disposed {
                return;
            }

            let now = self.clock.now();
            let purged = self.purge_locked(&mut state, now);
            if !state.entries.is_empty() && self.settings.idle_sweep_enabled() {
                self.schedule_sweep_locked(&mut state, self.settings.idle_timeout);
            }
            purged
        };

        if purged.is_empty() {
            debug!("Eviction sweep: no expired entries found");
        } else {
            info!("Eviction sweep: evicted {} expired entries", purged.len());
        }
        dispose_all(purged);
    }
}

impl<K, V> EntryOwner<K, V> for CacheInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn try_acquire(&self, cell: &Arc<EntryCell<K, V>>) -> bool {
        if cell.is_disposed() {
            return false;
        }

        let mut purged = Vec::new();
        let acquired = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            self.try_acquire_locked(&mut state, cell, now, &mut purged)
        };

        dispose_all(purged);
        acquired
    }

    fn release(&self, cell: &Arc<EntryCell<K, V>>) {
        let dispose = {
            let mut state = self.state.lock();
            if !cell.is_live() {
                debug!("Release of a disposed cache entry ignored");
                return;
            }
            if cell.release_locked() > 0 {
                return;
            }
            self.return_locked(&mut state, cell)
        };

        if dispose {
            cell.local_dispose();
        }
    }
}

impl<K, V> Drop for CacheInner<K, V> {
    /// Disposes unreferenced entries; referenced ones are disposed by their
    /// last release.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(timer) = state.sweep_timer.take() {
            timer.handle.cancel();
        }

        let mut unreferenced = Vec::new();
        for (_, cell) in state.entries.drain() {
            if cell.ref_count() == 0 {
                cell.mark_for_disposal();
                unreferenced.push(cell);
            }
        }
        dispose_all(unreferenced);
    }
}

/// Runs teardown for cells already marked under the lock.
///
/// A panicking disposer unwinds out of the loop; the remaining cells are
/// already marked, so their values are dropped with the `Vec` and never
/// reach the disposer.
fn dispose_all<K, V>(cells: Vec<Cell<K, V>>) {
    for cell in cells {
        cell.local_dispose();
    }
}

impl<K, V> Clone for ObjectCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> fmt::Debug for ObjectCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ObjectCache")
            .field("entries", &state.entries.len())
            .field("capacity_limit", &state.capacity_limit)
            .field("disposed", &state.disposed)
            .field("settings", &self.inner.settings)
            .finish()
    }
}
