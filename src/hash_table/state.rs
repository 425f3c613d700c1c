use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use super::bucket::{Bucket, Reader};
use super::entry::{Entry, Item};
use super::pool::EntryPool;

/// The minimum number of buckets in a [`State`].
pub(crate) const MINIMUM_BUCKETS: usize = 16;

/// [`State`] is a fixed-size array of [`Bucket`] instances along with sizing metadata.
///
/// A [`State`] is never resized in place; a grown or cleared [`State`] replaces it as a whole.
pub(crate) struct State<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    count: AtomicUsize,
    threshold: usize,
}

impl<K, V> State<K, V> {
    /// Creates an empty [`State`] with at least `capacity` buckets.
    pub(crate) fn new(capacity: usize) -> Self {
        let len = capacity
            .min(1_usize << (usize::BITS - 2))
            .next_power_of_two()
            .max(MINIMUM_BUCKETS);
        Self {
            buckets: (0..len).map(|_| Bucket::new()).collect(),
            count: AtomicUsize::new(0),
            threshold: threshold(len),
        }
    }

    /// Returns the number of buckets.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the number of items.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Relaxed)
    }

    /// Returns the number of items that triggers growth.
    #[cfg(test)]
    pub(crate) const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Returns `true` if the [`State`] should be replaced by a larger one.
    #[inline]
    pub(crate) fn needs_growth(&self) -> bool {
        self.count() >= self.threshold
    }

    /// Adds an item to the count, returning `true` if the [`State`] needs to grow.
    #[inline]
    pub(crate) fn increment(&self) -> bool {
        self.count.fetch_add(1, Relaxed) + 1 >= self.threshold
    }

    /// Removes an item from the count.
    #[inline]
    pub(crate) fn decrement(&self) {
        self.count.fetch_sub(1, Relaxed);
    }

    /// Removes `removed` items from the count.
    #[inline]
    pub(crate) fn subtract(&self, removed: usize) {
        self.count.fetch_sub(removed, Relaxed);
    }

    /// Returns the [`Bucket`] for the hash.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub(crate) fn bucket(&self, hash: u32) -> &Bucket<K, V> {
        &self.buckets[hash as usize & (self.buckets.len() - 1)]
    }

    /// Returns all the buckets.
    #[inline]
    pub(crate) fn buckets(&self) -> &[Bucket<K, V>] {
        &self.buckets
    }

    /// Builds a [`State`] twice as large holding every item of `self`.
    ///
    /// The caller must exclude writers; lock-free readers of `self` are unaffected.
    pub(crate) fn grow(&self, pool: &EntryPool<K, V>) -> Self
    where
        K: Clone,
        V: Clone,
    {
        let mut grown = Self::new(self.len() * 2);
        let mut staged: Vec<Option<Box<Entry<K, V>>>> = (0..grown.len()).map(|_| None).collect();
        let mask = grown.len() - 1;
        let mut count = 0;
        for bucket in self.buckets() {
            let Some(reader) = Reader::acquire(bucket, pool) else {
                continue;
            };
            for item in reader.iter() {
                let index = item.hash as usize & mask;
                staged[index]
                    .get_or_insert_with(|| pool.take())
                    .push(Item::clone(item));
                count += 1;
            }
        }
        for (bucket, entry) in grown.buckets.iter_mut().zip(staged) {
            if let Some(entry) = entry {
                bucket.install(entry);
            }
        }
        *grown.count.get_mut() = count;
        grown
    }
}

/// Returns the item count at which a [`State`] of `len` buckets grows: a load factor of `0.75`.
#[inline]
pub(crate) const fn threshold(len: usize) -> usize {
    len / 4 * 3
}

#[cfg(test)]
mod test {
    use super::{threshold, State, MINIMUM_BUCKETS};
    use crate::hash_table::bucket::{Reader, Writer};
    use crate::hash_table::entry::Item;
    use crate::hash_table::pool::EntryPool;

    #[test]
    fn sizing() {
        assert_eq!(State::<u64, u64>::new(0).len(), MINIMUM_BUCKETS);
        assert_eq!(State::<u64, u64>::new(17).len(), 32);
        assert_eq!(State::<u64, u64>::new(64).len(), 64);
        assert_eq!(threshold(16), 12);
        assert_eq!(State::<u64, u64>::new(16).threshold(), 12);
    }

    #[test]
    fn grow_redistributes() {
        let pool = EntryPool::default();
        let state: State<u64, u64> = State::new(16);
        for key in 0..12_u64 {
            // Keys collide pairwise in the small state and separate in the grown one.
            #[allow(clippy::cast_possible_truncation)]
            let hash = (key % 6 + (key / 6) * 16) as u32;
            let mut writer = Writer::lock(state.bucket(hash), &pool);
            let mut entry = writer.prepare();
            entry.push(Item {
                hash,
                key,
                value: key * 10,
            });
            writer.publish(entry);
            state.increment();
        }
        assert!(state.needs_growth());

        let grown = state.grow(&pool);
        assert_eq!(grown.len(), 32);
        assert_eq!(grown.count(), 12);
        assert_eq!(grown.threshold(), 24);
        for key in 0..12_u64 {
            #[allow(clippy::cast_possible_truncation)]
            let hash = (key % 6 + (key / 6) * 16) as u32;
            let reader = Reader::acquire(grown.bucket(hash), &pool).unwrap();
            assert_eq!(reader.len(), 1);
            assert_eq!(reader.search(hash, &key).map(|i| i.value), Some(key * 10));
        }
    }
}
