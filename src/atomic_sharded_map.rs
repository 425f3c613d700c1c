//! [`AtomicShardedMap`] splits an [`AtomicMap`](crate::AtomicMap) into independently resized
//! shards.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroUsize;
use std::sync::LazyLock;
use std::thread;

use equivalent::Equivalent;

use super::hash_table::pool::EntryPool;
use super::hash_table::{hash32, HashTable};
use super::LockedMap;

/// The maximum number of shards.
const MAXIMUM_SHARDS: usize = 1 << 16;

/// The default number of shards: the smallest power of two not less than the CPU count.
static DEFAULT_SHARDS: LazyLock<usize> = LazyLock::new(|| {
    thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .next_power_of_two()
        .min(MAXIMUM_SHARDS)
});

/// Concurrent hash map made of cache-line aligned shards.
///
/// A key is hashed once; the low bits of the hash select the shard, and the remaining bits
/// select the bucket inside the shard. Each shard has its own bucket array and resize lock,
/// hence growing one shard does not stall writers on the others.
///
/// Apart from the sharding, it behaves exactly like [`AtomicMap`](crate::AtomicMap). The entry
/// pool is shared by all the shards.
///
/// ```compile_fail
/// use splitmap::AtomicShardedMap;
///
/// let map: AtomicShardedMap<u64, &str> = AtomicShardedMap::default();
/// let local = String::from("local");
/// map.set(1, local.as_str());
/// ```
pub struct AtomicShardedMap<K, V, H = RandomState>
where
    K: 'static,
    V: 'static,
    H: BuildHasher,
{
    shards: Box<[HashTable<K, V>]>,
    pool: EntryPool<K, V>,
    build_hasher: H,
}

impl<K, V, H> AtomicShardedMap<K, V, H>
where
    K: 'static,
    V: 'static,
    H: BuildHasher,
{
    /// Creates an empty [`AtomicShardedMap`] with the given [`BuildHasher`].
    ///
    /// The number of shards is the smallest power of two not less than the number of CPUs.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicShardedMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: AtomicShardedMap<u64, u32, RandomState> =
    ///     AtomicShardedMap::with_hasher(RandomState::new());
    /// assert!(map.shard_count().is_power_of_two());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::with_shards_and_hasher(*DEFAULT_SHARDS, build_hasher)
    }

    /// Creates an empty [`AtomicShardedMap`] with at least `shards` shards.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicShardedMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: AtomicShardedMap<u64, u32, RandomState> =
    ///     AtomicShardedMap::with_shards_and_hasher(3, RandomState::new());
    /// assert_eq!(map.shard_count(), 4);
    /// assert_eq!(map.capacity(), 64);
    /// ```
    #[inline]
    pub fn with_shards_and_hasher(shards: usize, build_hasher: H) -> Self {
        Self::build(shards, 0, build_hasher)
    }

    /// Creates an empty [`AtomicShardedMap`] with at least `capacity` buckets in total.
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: H) -> Self {
        Self::build(*DEFAULT_SHARDS, capacity, build_hasher)
    }

    /// Returns the number of shards.
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.shards.iter().map(HashTable::len).sum()
    }

    /// Returns `true` if the [`AtomicShardedMap`] is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.len() == 0)
    }

    /// Returns the total number of buckets.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(HashTable::capacity).sum()
    }

    /// Removes every entry.
    ///
    /// Shards are cleared one after another.
    #[inline]
    pub fn clear(&self) {
        self.shards.iter().for_each(HashTable::clear);
    }

    /// Returns `true` if the key exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicShardedMap;
    ///
    /// let map: AtomicShardedMap<String, u32> = AtomicShardedMap::default();
    /// map.set("one".to_owned(), 1);
    /// assert!(map.contains("one"));
    /// ```
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.read(key, |_, _| ()).is_some()
    }

    /// Reads the entry for the key without cloning it.
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let (shard, hash) = self.shard(key);
        shard.read(hash, key, reader, &self.pool)
    }

    /// Returns a clone of the value for the key.
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
    /// Returns `false` if the iteration was stopped by `f`.
    #[inline]
    pub fn range<F: FnMut(&K, &V) -> bool>(&self, mut f: F) -> bool {
        self.shards
            .iter()
            .all(|shard| shard.range(&mut f, &self.pool))
    }

    /// Locks every bucket of every shard, returning an exclusive view.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicShardedMap;
    ///
    /// let map: AtomicShardedMap<u64, u32> = AtomicShardedMap::default();
    /// map.set(1, 1);
    ///
    /// let mut locked = map.lock_map();
    /// assert_eq!(locked.get(&1), Some(1));
    /// locked.free();
    /// ```
    #[inline]
    pub fn lock_map(&self) -> LockedMap<'_, K, V, H> {
        LockedMap::new(&self.shards, &self.pool, &self.build_hasher)
    }

    /// Returns `true` if no version other than the current one is retained in any bucket.
    #[cfg(test)]
    pub(crate) fn is_quiescent(&self) -> bool {
        self.shards.iter().all(HashTable::is_quiescent)
    }

    /// Returns the shard for the key along with the shard-local hash.
    #[inline]
    fn shard<Q: Hash + ?Sized>(&self, key: &Q) -> (&HashTable<K, V>, u32) {
        let (index, hash) = shard_hash(hash32(&self.build_hasher, key), self.shards.len());
        (&self.shards[index], hash)
    }

    fn build(shards: usize, capacity: usize, build_hasher: H) -> Self {
        let shard_count = shards.clamp(1, MAXIMUM_SHARDS).next_power_of_two();
        let shard_capacity = capacity.div_ceil(shard_count);
        Self {
            shards: (0..shard_count)
                .map(|_| HashTable::new(shard_capacity))
                .collect(),
            pool: EntryPool::default(),
            build_hasher,
        }
    }
}

impl<K, V, H> AtomicShardedMap<K, V, H>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
    H: BuildHasher,
{
    /// Sets the value for the key.
    #[inline]
    pub fn set(&self, key: K, value: V) {
        let (shard, hash) = self.shard(&key);
        shard.upsert(hash, key, value, &self.pool, |_| ());
    }

    /// Sets the value for the key, returning the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use splitmap::AtomicShardedMap;
    ///
    /// let map: AtomicShardedMap<u64, u32> = AtomicShardedMap::default();
    /// assert_eq!(map.swap(1, 0), None);
    /// assert_eq!(map.swap(1, 1), Some(0));
    /// ```
    #[inline]
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        let (shard, hash) = self.shard(&key);
        shard.upsert(hash, key, value, &self.pool, V::clone)
    }

    /// Sets the value only if the key is absent.
    ///
    /// Returns `true` if the value was set.
    #[inline]
    pub fn set_absent(&self, key: K, value: V) -> bool {
        let (shard, hash) = self.shard(&key);
        shard.set_absent(hash, key, value, &self.pool)
    }

    /// Returns the value for the key, setting it first if the key is absent.
    ///
    /// The returned flag is `true` if the key already existed.
    #[inline]
    pub fn get_or_set(&self, key: K, value: V) -> (V, bool) {
        let (shard, hash) = self.shard(&key);
        shard.get_or_set(hash, key, value, &self.pool)
    }

    /// Removes the key, returning its value.
    #[inline]
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let (shard, hash) = self.shard(key);
        shard.remove(hash, key, &self.pool)
    }

    /// Removes the key, returning its value.
    ///
    /// Same as [`AtomicShardedMap::delete`].
    #[inline]
    pub fn pop<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.delete(key)
    }
}

impl<K: 'static, V: 'static> AtomicShardedMap<K, V, RandomState> {
    /// Creates an empty [`AtomicShardedMap`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`AtomicShardedMap`] with at least `capacity` buckets in total.
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, H> Debug for AtomicShardedMap<K, V, H>
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

impl<K, V, H> Default for AtomicShardedMap<K, V, H>
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

impl<K, V, H> Extend<(K, V)> for AtomicShardedMap<K, V, H>
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

impl<K, V, H> FromIterator<(K, V)> for AtomicShardedMap<K, V, H>
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

/// Splits a hash into a shard index and a shard-local hash.
///
/// The shard index is `hash % shard_count`. Unless the whole hash was consumed selecting the
/// shard, the bits used for the index are shifted out of the shard-local hash so that the buckets
/// of a shard see the remaining entropy.
#[allow(clippy::cast_possible_truncation)]
#[inline]
pub(crate) fn shard_hash(hash: u32, shard_count: usize) -> (usize, u32) {
    debug_assert!(shard_count.is_power_of_two());
    let index = hash as usize % shard_count;
    if (hash as usize) < shard_count {
        return (index, hash);
    }
    let consumed = usize::BITS - (shard_count - 1).leading_zeros();
    (index, hash.checked_shr(consumed).unwrap_or(0))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::shard_hash;

    #[test]
    fn single_shard() {
        assert_eq!(shard_hash(0, 1), (0, 0));
        assert_eq!(shard_hash(u32::MAX, 1), (0, u32::MAX));
    }

    #[test]
    fn small_hash_is_kept() {
        assert_eq!(shard_hash(5, 8), (5, 5));
        assert_eq!(shard_hash(8, 8), (0, 1));
        assert_eq!(shard_hash(0b1011_0110, 16), (0b0110, 0b1011));
    }

    proptest! {
        #[test]
        fn consumed_bits_are_dropped(hash in any::<u32>(), log2 in 0_u32..16) {
            let shard_count = 1_usize << log2;
            let (index, local) = shard_hash(hash, shard_count);
            prop_assert_eq!(index, hash as usize % shard_count);
            if (hash as usize) < shard_count {
                prop_assert_eq!(local, hash);
            } else {
                prop_assert_eq!(local, hash >> log2);
            }
        }
    }
}
