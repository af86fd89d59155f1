//! Cache Entry Module
//!
//! A cached value, its reference count and its disposal state, plus the
//! [`Entry`] handle callers hold while using the value.

use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::debug;

/// Teardown callback registered on a cache.
pub type Disposer<V> = Arc<dyn Fn(V) + Send + Sync>;

/// Shared read access to a cached value.
pub type ValueRef<'a, V> = MappedRwLockReadGuard<'a, V>;

// == Disposal State ==
const LIVE: u8 = 0;
const MARKED_FOR_DISPOSAL: u8 = 1;
const DISPOSED: u8 = 2;

/// Reference count stored once an entry is torn down.
const DISPOSED_REFS: isize = -1;

// == Entry Owner ==
/// The cache side of a tracked entry.
///
/// Both calls run the reference count change under the owner's lock.
pub(crate) trait EntryOwner<K, V>: Send + Sync {
    fn try_acquire(&self, cell: &Arc<EntryCell<K, V>>) -> bool;
    fn release(&self, cell: &Arc<EntryCell<K, V>>);
}

/// Whether an entry lives in a cache map or was handed out as a shell.
///
/// A shell carries the refusing cache's teardown counter, so its disposal
/// still shows up in that cache's stats.
pub(crate) enum Ownership<K, V> {
    Tracked(Weak<dyn EntryOwner<K, V>>),
    Untracked(Option<Arc<AtomicU64>>),
}

// == Entry Cell ==
/// Shared state of one cached value.
///
/// For tracked entries the reference count, last usage and the
/// `Live -> MarkedForDisposal` transition only change under the owning
/// cache's lock. Teardown itself runs outside it.
pub(crate) struct EntryCell<K, V> {
    key: K,
    value: RwLock<Option<V>>,
    ref_count: AtomicIsize,
    created_at: Option<Instant>,
    last_usage: Mutex<Instant>,
    state: AtomicU8,
    ownership: Ownership<K, V>,
    disposer: Option<Disposer<V>>,
}

impl<K, V> EntryCell<K, V> {
    /// Creates a cell holding one reference.
    pub(crate) fn new(
        key: K,
        value: V,
        ownership: Ownership<K, V>,
        created_at: Option<Instant>,
        now: Instant,
        disposer: Option<Disposer<V>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            value: RwLock::new(Some(value)),
            ref_count: AtomicIsize::new(1),
            created_at,
            last_usage: Mutex::new(now),
            state: AtomicU8::new(LIVE),
            ownership,
            disposer,
        })
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn ref_count(&self) -> isize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn created_at(&self) -> Option<Instant> {
        self.created_at
    }

    pub(crate) fn last_usage(&self) -> Instant {
        *self.last_usage.lock()
    }

    pub(crate) fn touch(&self, now: Instant) {
        *self.last_usage.lock() = now;
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == LIVE
    }

    /// Lock-free check used before taking the cache lock.
    pub(crate) fn is_disposed(&self) -> bool {
        self.ref_count() < 0 || !self.is_live()
    }

    // == Locked Operations ==
    /// Adds a reference. Caller holds the owning cache's lock.
    pub(crate) fn acquire_locked(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference and returns the remaining count. Caller holds
    /// the owning cache's lock.
    pub(crate) fn release_locked(&self) -> isize {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "cache entry released more often than acquired");
        previous - 1
    }

    /// Marks an unreferenced entry for disposal. Caller holds the owning
    /// cache's lock and follows up with [`EntryCell::local_dispose`] once
    /// the lock is released.
    pub(crate) fn locked_dispose(&self) {
        debug_assert_eq!(self.ref_count(), 0, "disposing a referenced cache entry");
        self.mark_for_disposal();
    }

    /// Marks the entry for disposal whatever its reference count.
    pub(crate) fn mark_for_disposal(&self) {
        let _ = self.state.compare_exchange(
            LIVE,
            MARKED_FOR_DISPOSAL,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // == Local Dispose ==
    /// Tears the value down: runs the disposer if one is registered,
    /// otherwise drops the value.
    ///
    /// Only the first call does anything; returns whether this call did.
    /// Waits for outstanding [`ValueRef`] guards before taking the value.
    pub(crate) fn local_dispose(&self) -> bool {
        if self.state.swap(DISPOSED, Ordering::AcqRel) == DISPOSED {
            return false;
        }
        self.ref_count.store(DISPOSED_REFS, Ordering::Release);

        let value = self.value.write().take();
        if let Ownership::Untracked(Some(teardowns)) = &self.ownership {
            teardowns.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(value) = value {
            match &self.disposer {
                Some(disposer) => disposer(value),
                None => drop(value),
            }
        }
        true
    }

    // == Untracked Operations ==
    fn try_acquire_untracked(&self) -> bool {
        let mut current = self.ref_count();
        loop {
            if current <= 0 || !self.is_live() {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Shells, and tracked entries whose cache is gone, dispose themselves
    /// on their last release.
    fn release_untracked(&self) {
        if !self.is_live() {
            debug!("Release of a disposed cache entry ignored");
            return;
        }
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "cache entry released more often than acquired");
        if previous == 1 {
            self.local_dispose();
        }
    }

    fn owner(&self) -> Option<Arc<dyn EntryOwner<K, V>>> {
        match &self.ownership {
            Ownership::Tracked(owner) => owner.upgrade(),
            Ownership::Untracked(_) => None,
        }
    }
}

// == Entry ==
/// One counted reference to a cached value.
///
/// Dropping the handle (or calling [`Entry::release`]) gives the reference
/// back. When the last reference of a tracked entry is released the cache
/// decides whether to keep it; a shell disposes its value right away.
pub struct Entry<K, V> {
    cell: Arc<EntryCell<K, V>>,
}

impl<K, V> Entry<K, V> {
    /// Wraps a cell whose reference has already been counted.
    pub(crate) fn from_cell(cell: Arc<EntryCell<K, V>>) -> Self {
        Self { cell }
    }

    /// Builds an untracked entry that disposes itself on its last release.
    ///
    /// `teardowns` is bumped once when that disposal runs.
    pub(crate) fn shell(
        key: K,
        value: V,
        now: Instant,
        disposer: Option<Disposer<V>>,
        teardowns: Option<Arc<AtomicU64>>,
    ) -> Self {
        Self::from_cell(EntryCell::new(
            key,
            value,
            Ownership::Untracked(teardowns),
            None,
            now,
            disposer,
        ))
    }

    pub fn key(&self) -> &K {
        self.cell.key()
    }

    // == Value ==
    /// Borrows the cached value.
    ///
    /// # Panics
    /// If the entry was force-disposed by [`ObjectCache::dispose`](crate::cache::ObjectCache::dispose)
    /// while this handle was still held.
    pub fn value(&self) -> ValueRef<'_, V> {
        self.try_value()
            .unwrap_or_else(|| panic!("cache entry value used after disposal"))
    }

    /// Borrows the cached value, or `None` once it has been disposed.
    pub fn try_value(&self) -> Option<ValueRef<'_, V>> {
        RwLockReadGuard::try_map(self.cell.value.read(), |value| value.as_ref()).ok()
    }

    /// True when the entry was never admitted to the cache map.
    pub fn is_shell(&self) -> bool {
        matches!(self.cell.ownership, Ownership::Untracked(_))
    }

    /// Current number of outstanding references; negative once disposed.
    pub fn reference_count(&self) -> isize {
        self.cell.ref_count()
    }

    // == Try Add Reference ==
    /// Takes another reference to the same value.
    ///
    /// Returns `None` if the entry has already been disposed.
    pub fn try_add_reference(&self) -> Option<Self> {
        if self.cell.is_disposed() {
            return None;
        }

        let acquired = match self.cell.owner() {
            Some(owner) => owner.try_acquire(&self.cell),
            None => self.cell.try_acquire_untracked(),
        };

        acquired.then(|| Self::from_cell(self.cell.clone()))
    }

    /// Gives this reference back. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        match self.cell.owner() {
            Some(owner) => owner.release(&self.cell),
            None => self.cell.release_untracked(),
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", self.key())
            .field("shell", &self.is_shell())
            .field("references", &self.reference_count())
            .finish()
    }
}
