//! [`LockedMap`] is an exclusive view of a map with every bucket locked.

use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};

use equivalent::Equivalent;

use super::atomic_sharded_map::shard_hash;
use super::hash_table::pool::EntryPool;
use super::hash_table::{hash32, HashTable, LockedState};

/// [`LockedMap`] keeps every bucket of an [`AtomicMap`](crate::AtomicMap) or
/// [`AtomicShardedMap`](crate::AtomicShardedMap) locked until freed.
///
/// While a [`LockedMap`] is held, mutations of the map block and the map cannot grow; lock-free
/// reads on the map itself still observe the last published contents.
///
/// Dropping a [`LockedMap`] frees it; calling [`LockedMap::free`] makes the release explicit.
/// Every method panics once the [`LockedMap`] has been freed.
pub struct LockedMap<'m, K, V, H = RandomState>
where
    H: BuildHasher,
{
    shards: Vec<LockedState<'m, K, V>>,
    build_hasher: &'m H,
    freed: bool,
}

impl<'m, K, V, H> LockedMap<'m, K, V, H>
where
    H: BuildHasher,
{
    /// Locks every bucket of every table, in order.
    pub(crate) fn new(
        tables: &'m [HashTable<K, V>],
        pool: &'m EntryPool<K, V>,
        build_hasher: &'m H,
    ) -> Self {
        Self {
            shards: tables.iter().map(|table| table.lock(pool)).collect(),
            build_hasher,
            freed: false,
        }
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.check();
        self.shards.iter().map(|shard| shard.state().count()).sum()
    }

    /// Returns `true` if the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the key exists.
    ///
    /// # Panics
    ///
    /// Panics if the [`LockedMap`] has been freed.
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.read(key, |_, _| ()).is_some()
    }

    /// Reads the entry for the key.
    ///
    /// # Panics
    ///
    /// Panics if the [`LockedMap`] has been freed.
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.check();
        let (index, hash) = shard_hash(hash32(self.build_hasher, key), self.shards.len());
        self.shards[index]
            .head(hash)?
            .search(hash, key)
            .map(|item| reader(&item.key, &item.value))
    }

    /// Returns a clone of the value for the key.
    ///
    /// # Panics
    ///
    /// Panics if the [`LockedMap`] has been freed.
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
    /// # Panics
    ///
    /// Panics if the [`LockedMap`] has been freed.
    #[inline]
    pub fn range<F: FnMut(&K, &V) -> bool>(&self, mut f: F) -> bool {
        self.check();
        self.shards.iter().all(|shard| shard.range(&mut f))
    }

    /// Removes every entry.
    ///
    /// Readers that acquired a bucket before the call keep seeing its former contents.
    ///
    /// # Panics
    ///
    /// Panics if the [`LockedMap`] has been freed.
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
    /// locked.clear();
    /// assert!(locked.is_empty());
    /// locked.free();
    ///
    /// assert!(!map.contains(&1));
    /// ```
    #[inline]
    pub fn clear(&mut self) {
        self.check();
        for shard in &self.shards {
            shard.clear();
        }
    }

    /// Unlocks every bucket.
    ///
    /// # Panics
    ///
    /// Panics if the [`LockedMap`] has already been freed.
    #[inline]
    pub fn free(&mut self) {
        self.check();
        self.freed = true;
        self.shards.clear();
    }

    #[inline]
    fn check(&self) {
        assert!(!self.freed, "the LockedMap has already been freed");
    }
}

impl<K, V, H> Debug for LockedMap<'_, K, V, H>
where
    K: Debug,
    V: Debug,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.freed {
            return f.write_str("LockedMap { freed }");
        }
        let mut d = f.debug_map();
        self.range(|k, v| {
            d.entry(k, v);
            true
        });
        d.finish()
    }
}
