use parking_lot::Mutex;

use super::entry::Entry;

/// The maximum number of idle [`Entry`] instances kept by an [`EntryPool`].
pub(crate) const POOL_CAPACITY: usize = 1024;

/// [`EntryPool`] recycles [`Entry`] allocations across every bucket of a map.
///
/// Entries handed out are always empty; entries handed back have their items dropped before
/// they are kept, so the pool never extends the lifetime of keys or values.
pub(crate) struct EntryPool<K, V> {
    free: Mutex<Vec<Box<Entry<K, V>>>>,
    capacity: usize,
}

impl<K, V> EntryPool<K, V> {
    /// Creates an [`EntryPool`] keeping at most `capacity` idle entries.
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Takes an empty [`Entry`] out of the pool, allocating one if none is idle.
    #[inline]
    pub(crate) fn take(&self) -> Box<Entry<K, V>> {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Returns an [`Entry`] to the pool.
    #[inline]
    pub(crate) fn put(&self, mut entry: Box<Entry<K, V>>) {
        // Items are dropped outside the lock.
        entry.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(entry);
        }
    }

    /// Returns the number of idle entries.
    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl<K, V> Default for EntryPool<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use super::EntryPool;
    use crate::hash_table::entry::Item;

    #[test]
    fn bounded_recycling() {
        let pool: EntryPool<u64, String> = EntryPool::new(2);
        let mut entries: Vec<_> = (0..3).map(|_| pool.take()).collect();
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.id = 1;
            entry.push(Item {
                hash: 0,
                key: i as u64,
                value: i.to_string(),
            });
        }
        for entry in entries {
            pool.put(entry);
        }
        assert_eq!(pool.idle(), 2);

        let recycled = pool.take();
        assert_eq!(recycled.id, 0);
        assert_eq!(recycled.len(), 0);
        assert_eq!(pool.idle(), 1);
    }
}
