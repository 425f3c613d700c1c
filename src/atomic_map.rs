//! [`AtomicMap`] is a concurrent hash map with lock-free reads.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::slice;

use equivalent::Equivalent;

use super::hash_table::pool::EntryPool;
use super::hash_table::{hash32, HashTable};
use super::LockedMap;

/// Concurrent hash map with lock-free reads and per-bucket writer locks.
///
/// Each bucket holds a chain of immutable versions of its contents. A read claims the current
/// version with a single atomic increment and never blocks; a write copies the current version,
/// modifies the private copy, and publishes it under the bucket lock. Superseded versions are
/// reclaimed through split reference counting as soon as the last reader holding them lets go.
///
/// ## Locking behavior
///
/// * [`AtomicMap::get`], [`AtomicMap::contains`], [`AtomicMap::read`] and [`AtomicMap::range`]
///   take no lock.
/// * Mutations lock a single bucket and share the resize lock with each other.
/// * Growing the bucket array and [`AtomicMap::clear`] take the resize lock exclusively.
///
/// Operations on the same key are linearizable. [`AtomicMap::range`] observes each bucket
/// atomically, but not the whole map.
///
/// Keys and values are cloned when a bucket is copied; wrap large values in a shared pointer.
///
/// Superseded versions may be dropped by another thread after the operation that replaced them
/// returns, so keys and values must be `'static`.
///
/// ```compile_fail
/// use splitmap::AtomicMap;
///
/// let map: AtomicMap<u64, &str> = AtomicMap::default();
/// let local = String::from("local");
/// map.set(1, local.as_str());
/// ```
pub struct AtomicMap<K, V, H = RandomState>
where
    K: 'static,
    V: 'static,
    H: BuildHasher,
{
    table: HashTable<K, V>,
    pool: EntryPool<K, V>,
    build_hasher: H,
}

impl<K, V, H> AtomicMap<K, V, H>
where
    K: 'static,
    V: 'static,
    H: BuildHasher,
{
    /// Creates an empty [`AtomicMap`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: AtomicMap<u64, u32, RandomState> = AtomicMap::with_hasher(RandomState::new());
    /// assert_eq!(map.capacity(), 16);
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::with_capacity_and_hasher(0, build_hasher)
    }

    /// Creates an empty [`AtomicMap`] with at least `capacity` buckets.
    ///
    /// The number of buckets is a power of two, and no smaller than `16`.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: AtomicMap<u64, u32, RandomState> =
    ///     AtomicMap::with_capacity_and_hasher(1000, RandomState::new());
    /// assert_eq!(map.capacity(), 1024);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: H) -> Self {
        Self {
            table: HashTable::new(capacity),
            pool: EntryPool::default(),
            build_hasher,
        }
    }

    /// Returns the number of entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// map.set(1, 0);
    /// assert_eq!(map.len(), 1);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the [`AtomicMap`] is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Removes every entry.
    ///
    /// The bucket array is replaced by an empty one of the same size; readers that are
    /// concurrently scanning the old one are unaffected.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// map.set(1, 0);
    /// map.clear();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn clear(&self) {
        self.table.clear();
    }

    /// Returns `true` if the key exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<String, u32> = AtomicMap::default();
    /// map.set("one".to_owned(), 1);
    /// assert!(map.contains("one"));
    /// assert!(!map.contains("two"));
    /// ```
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.read(key, |_, _| ()).is_some()
    }

    /// Reads the entry for the key without cloning it.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, String> = AtomicMap::default();
    /// map.set(1, "one".to_owned());
    /// assert_eq!(map.read(&1, |_, v| v.len()), Some(3));
    /// ```
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = hash32(&self.build_hasher, key);
        self.table.read(hash, key, reader, &self.pool)
    }

    /// Returns a clone of the value for the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// assert_eq!(map.get(&1), None);
    /// map.set(1, 10);
    /// assert_eq!(map.get(&1), Some(10));
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
        V: Clone,
    {
        self.read(key, |_, v| v.clone())
    }

    /// Visits every entry until `f` returns `false`.
    ///
    /// Returns `false` if the iteration was stopped by `f`. Entries are visited in bucket order,
    /// and each bucket is observed atomically.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u64> = AtomicMap::default();
    /// for i in 0..4 {
    ///     map.set(i, i);
    /// }
    /// let mut sum = 0;
    /// assert!(map.range(|_, v| {
    ///     sum += *v;
    ///     true
    /// }));
    /// assert_eq!(sum, 6);
    /// assert!(!map.range(|_, _| false));
    /// ```
    #[inline]
    pub fn range<F: FnMut(&K, &V) -> bool>(&self, mut f: F) -> bool {
        self.table.range(&mut f, &self.pool)
    }

    /// Locks every bucket, returning an exclusive view of the [`AtomicMap`].
    ///
    /// No mutation can complete until the [`LockedMap`] is freed. Mutating the [`AtomicMap`]
    /// from the thread holding the [`LockedMap`] deadlocks.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// map.set(1, 1);
    ///
    /// let mut locked = map.lock_map();
    /// assert!(locked.contains(&1));
    /// locked.clear();
    /// locked.free();
    ///
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    pub fn lock_map(&self) -> LockedMap<'_, K, V, H> {
        LockedMap::new(slice::from_ref(&self.table), &self.pool, &self.build_hasher)
    }

    /// Returns `true` if no version other than the current one is retained in any bucket.
    #[cfg(test)]
    pub(crate) fn is_quiescent(&self) -> bool {
        self.table.is_quiescent()
    }
}

impl<K, V, H> AtomicMap<K, V, H>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
    H: BuildHasher,
{
    /// Sets the value for the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// map.set(1, 0);
    /// map.set(1, 1);
    /// assert_eq!(map.get(&1), Some(1));
    /// ```
    #[inline]
    pub fn set(&self, key: K, value: V) {
        let hash = hash32(&self.build_hasher, &key);
        self.table.upsert(hash, key, value, &self.pool, |_| ());
    }

    /// Sets the value for the key, returning the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// assert_eq!(map.swap(1, 0), None);
    /// assert_eq!(map.swap(1, 1), Some(0));
    /// ```
    #[inline]
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        let hash = hash32(&self.build_hasher, &key);
        self.table.upsert(hash, key, value, &self.pool, V::clone)
    }

    /// Sets the value only if the key is absent.
    ///
    /// Returns `true` if the value was set.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// assert!(map.set_absent(1, 0));
    /// assert!(!map.set_absent(1, 1));
    /// assert_eq!(map.get(&1), Some(0));
    /// ```
    #[inline]
    pub fn set_absent(&self, key: K, value: V) -> bool {
        let hash = hash32(&self.build_hasher, &key);
        self.table.set_absent(hash, key, value, &self.pool)
    }

    /// Returns the value for the key, setting it first if the key is absent.
    ///
    /// The returned flag is `true` if the key already existed.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// assert_eq!(map.get_or_set(1, 0), (0, false));
    /// assert_eq!(map.get_or_set(1, 1), (0, true));
    /// ```
    #[inline]
    pub fn get_or_set(&self, key: K, value: V) -> (V, bool) {
        let hash = hash32(&self.build_hasher, &key);
        self.table.get_or_set(hash, key, value, &self.pool)
    }

    /// Removes the key, returning its value.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::default();
    /// map.set(1, 0);
    /// assert_eq!(map.delete(&1), Some(0));
    /// assert_eq!(map.delete(&1), None);
    /// ```
    #[inline]
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = hash32(&self.build_hasher, key);
        self.table.remove(hash, key, &self.pool)
    }

    /// Removes the key, returning its value.
    ///
    /// Same as [`AtomicMap::delete`].
    #[inline]
    pub fn pop<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.delete(key)
    }
}

impl<K: 'static, V: 'static> AtomicMap<K, V, RandomState> {
    /// Creates an empty [`AtomicMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicMap;
    ///
    /// let map: AtomicMap<u64, u32> = AtomicMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`AtomicMap`] with at least `capacity` buckets.
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, H> Debug for AtomicMap<K, V, H>
where
    K: Debug + 'static,
    V: Debug + 'static,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_map();
        self.range(|k, v| {
            d.entry(k, v);
            true
        });
        d.finish()
    }
}

impl<K, V, H> Default for AtomicMap<K, V, H>
where
    K: 'static,
    V: 'static,
    H: BuildHasher + Default,
{
    #[inline]
    fn default() -> Self {
        Self::with_hasher(H::default())
    }
}

impl<K, V, H> Extend<(K, V)> for AtomicMap<K, V, H>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
    H: BuildHasher,
{
    #[inline]
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.set(k, v);
        }
    }
}

impl<K, V, H> FromIterator<(K, V)> for AtomicMap<K, V, H>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
    H: BuildHasher + Default,
{
    #[inline]
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}
