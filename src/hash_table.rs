pub(crate) mod bucket;
pub(crate) mod entry;
pub(crate) mod pool;
pub(crate) mod state;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use equivalent::Equivalent;
use parking_lot::{RwLock, RwLockReadGuard};
use sdd::{AtomicShared, Guard, Shared, Tag};
use tracing::debug;

use bucket::{Reader, Writer};
use entry::{Entry, Item};
use pool::EntryPool;
use state::State;

/// [`HashTable`] is the machinery shared by every map type: the current [`State`] and the lock
/// that serializes replacing it.
///
/// Every operation takes a pre-computed 32-bit hash. Lookups take no lock at all; mutations share
/// the resize lock, and growing or clearing the table takes it exclusively.
#[repr(align(64))]
pub(crate) struct HashTable<K, V> {
    state: AtomicShared<State<K, V>>,
    resize_lock: RwLock<()>,
}

/// [`LockedState`] keeps every bucket of a [`State`] locked, and the [`State`] from being
/// replaced, until dropped.
pub(crate) struct LockedState<'t, K, V> {
    state: Shared<State<K, V>>,
    pool: &'t EntryPool<K, V>,
    _resize_guard: RwLockReadGuard<'t, ()>,
}

/// The effect of a mutation on the item count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Change {
    Inserted,
    Removed,
    Unchanged,
}

impl<K: 'static, V: 'static> HashTable<K, V> {
    /// Creates a [`HashTable`] with at least `capacity` buckets.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: AtomicShared::from(Shared::new(State::new(capacity))),
            resize_lock: RwLock::new(()),
        }
    }

    /// Replaces the [`State`] with an empty one of the same size.
    ///
    /// The replaced [`State`] is dropped once no reader can observe it.
    pub(crate) fn clear(&self) {
        let _exclusive = self.resize_lock.write();
        let guard = Guard::new();
        let len = self.state(&guard).len();
        self.state
            .swap((Some(Shared::new(State::new(len))), Tag::None), AcqRel);
        debug!(buckets = len, "cleared state");
    }
}

impl<K, V> HashTable<K, V> {
    /// Returns the number of items.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.state(&Guard::new()).count()
    }

    /// Returns the number of buckets.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.state(&Guard::new()).len()
    }

    /// Reads the item matching the key.
    #[inline]
    pub(crate) fn read<Q, R, F: FnOnce(&K, &V) -> R>(
        &self,
        hash: u32,
        key: &Q,
        reader: F,
        pool: &EntryPool<K, V>,
    ) -> Option<R>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let guard = Guard::new();
        let entry = Reader::acquire(self.state(&guard).bucket(hash), pool)?;
        entry
            .search(hash, key)
            .map(|item| reader(&item.key, &item.value))
    }

    /// Visits every item until `f` returns `false`.
    ///
    /// Returns `false` if stopped early.
    pub(crate) fn range<F: FnMut(&K, &V) -> bool>(&self, f: &mut F, pool: &EntryPool<K, V>) -> bool {
        let guard = Guard::new();
        for bucket in self.state(&guard).buckets() {
            let Some(entry) = Reader::acquire(bucket, pool) else {
                continue;
            };
            for item in entry.iter() {
                if !f(&item.key, &item.value) {
                    return false;
                }
            }
        }
        true
    }

    /// Locks every bucket.
    pub(crate) fn lock<'t>(&'t self, pool: &'t EntryPool<K, V>) -> LockedState<'t, K, V> {
        let resize_guard = self.resize_lock.read();
        // The state is detached only when the table is dropped.
        let state = unsafe {
            self.state
                .get_shared(Acquire, &Guard::new())
                .unwrap_unchecked()
        };
        for bucket in state.buckets() {
            bucket.lock_exclusive();
        }
        LockedState {
            state,
            pool,
            _resize_guard: resize_guard,
        }
    }

    /// Returns `true` if every bucket of the current [`State`] is quiescent.
    #[cfg(test)]
    pub(crate) fn is_quiescent(&self) -> bool {
        self.state(&Guard::new())
            .buckets()
            .iter()
            .all(bucket::Bucket::is_quiescent)
    }

    /// Returns a reference to the current [`State`].
    #[inline]
    fn state<'g>(&self, guard: &'g Guard) -> &'g State<K, V> {
        // The state is detached only when the table is dropped.
        unsafe { self.state.load(Acquire, guard).as_ref().unwrap_unchecked() }
    }
}

impl<K: Clone + Eq + 'static, V: Clone + 'static> HashTable<K, V> {
    /// Sets the value, passing the replaced one to `on_replaced`.
    pub(crate) fn upsert<R, F: FnOnce(&V) -> R>(
        &self,
        hash: u32,
        key: K,
        value: V,
        pool: &EntryPool<K, V>,
        on_replaced: F,
    ) -> Option<R> {
        self.write(hash, pool, |writer| {
            let (mut entry, omitted) = writer.prepare_without(hash, &key);
            let replaced = omitted.map(|item| on_replaced(&item.value));
            entry.push(Item { hash, key, value });
            writer.publish(entry);
            let change = if replaced.is_none() {
                Change::Inserted
            } else {
                Change::Unchanged
            };
            (replaced, change)
        })
    }

    /// Sets the value if the key is absent.
    pub(crate) fn set_absent(&self, hash: u32, key: K, value: V, pool: &EntryPool<K, V>) -> bool {
        self.write(hash, pool, |writer| {
            if writer
                .head()
                .is_some_and(|head| head.search(hash, &key).is_some())
            {
                return (false, Change::Unchanged);
            }
            let mut entry = writer.prepare();
            entry.push(Item { hash, key, value });
            writer.publish(entry);
            (true, Change::Inserted)
        })
    }

    /// Returns the existing value, or sets the supplied one.
    pub(crate) fn get_or_set(
        &self,
        hash: u32,
        key: K,
        value: V,
        pool: &EntryPool<K, V>,
    ) -> (V, bool) {
        self.write(hash, pool, |writer| {
            if let Some(existing) = writer.head().and_then(|head| head.search(hash, &key)) {
                return ((existing.value.clone(), true), Change::Unchanged);
            }
            let mut entry = writer.prepare();
            entry.push(Item {
                hash,
                key,
                value: value.clone(),
            });
            writer.publish(entry);
            ((value, false), Change::Inserted)
        })
    }

    /// Removes the key, returning its value.
    pub(crate) fn remove<Q>(&self, hash: u32, key: &Q, pool: &EntryPool<K, V>) -> Option<V>
    where
        Q: Equivalent<K> + ?Sized,
    {
        self.write(hash, pool, |writer| {
            if !writer
                .head()
                .is_some_and(|head| head.search(hash, key).is_some())
            {
                return (None, Change::Unchanged);
            }
            let (entry, omitted) = writer.prepare_without(hash, key);
            let removed = omitted.map(|item| item.value.clone());
            writer.publish(entry);
            (removed, Change::Removed)
        })
    }

    /// Runs a mutation against the bucket for `hash`, then grows the table if needed.
    fn write<R, F>(&self, hash: u32, pool: &EntryPool<K, V>, mutate: F) -> R
    where
        F: FnOnce(&mut Writer<'_, K, V>) -> (R, Change),
    {
        let resize_guard = self.resize_lock.read();
        let guard = Guard::new();
        let state = self.state(&guard);
        let mut writer = Writer::lock(state.bucket(hash), pool);
        let (result, change) = mutate(&mut writer);

        // The count is updated before the bucket is unlocked so that it never lags behind what
        // a `LockedState` observes.
        let needs_growth = match change {
            Change::Inserted => state.increment(),
            Change::Removed => {
                state.decrement();
                false
            }
            Change::Unchanged => false,
        };
        drop(writer);
        drop(guard);
        drop(resize_guard);

        if needs_growth {
            self.grow(pool);
        }
        result
    }

    /// Replaces the [`State`] with one twice as large.
    fn grow(&self, pool: &EntryPool<K, V>) {
        let _exclusive = self.resize_lock.write();
        let guard = Guard::new();
        let current = self.state(&guard);
        if !current.needs_growth() {
            // Another thread has already grown it.
            return;
        }
        let grown = current.grow(pool);
        debug!(
            from = current.len(),
            to = grown.len(),
            count = grown.count(),
            "grew state"
        );
        self.state.swap((Some(Shared::new(grown)), Tag::None), Release);
    }
}

impl<K, V> Drop for HashTable<K, V> {
    #[inline]
    fn drop(&mut self) {
        if let (Some(state), _) = self.state.swap((None, Tag::None), Relaxed) {
            // No reference to the state can outlive the `HashTable`.
            unsafe {
                state.drop_in_place();
            }
        }
    }
}

impl<K, V> LockedState<'_, K, V> {
    /// Returns the locked [`State`].
    #[inline]
    pub(crate) fn state(&self) -> &State<K, V> {
        &self.state
    }

    /// Returns the current version of the bucket for the hash.
    #[inline]
    pub(crate) fn head(&self, hash: u32) -> Option<&Entry<K, V>> {
        // Every bucket stays locked until `self` is dropped.
        unsafe { self.state.bucket(hash).head_locked() }
    }

    /// Visits every item until `f` returns `false`.
    pub(crate) fn range<F: FnMut(&K, &V) -> bool>(&self, f: &mut F) -> bool {
        for bucket in self.state.buckets() {
            let Some(head) = (unsafe { bucket.head_locked() }) else {
                continue;
            };
            for item in head.iter() {
                if !f(&item.key, &item.value) {
                    return false;
                }
            }
        }
        true
    }

    /// Replaces every bucket's contents with an empty version.
    pub(crate) fn clear(&self) {
        let mut removed = 0;
        for bucket in self.state.buckets() {
            let mut writer = unsafe { Writer::from_locked(bucket, self.pool) };
            if let Some(len) = writer.head().map(Entry::len).filter(|len| *len != 0) {
                removed += len;
                let entry = writer.prepare_empty();
                writer.publish(entry);
            }
            writer.keep_locked();
        }
        self.state.subtract(removed);
    }
}

impl<K, V> Drop for LockedState<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        for bucket in self.state.buckets() {
            unsafe {
                bucket.unlock_exclusive(self.pool);
            }
        }
    }
}

/// Hashes the key into 32 bits.
#[allow(clippy::cast_possible_truncation)]
#[inline]
pub(crate) fn hash32<H: BuildHasher, Q: Hash + ?Sized>(build_hasher: &H, key: &Q) -> u32 {
    let hash = build_hasher.hash_one(key);
    (hash ^ (hash >> 32)) as u32
}
