use std::marker::PhantomData;
use std::mem::forget;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64};

use equivalent::Equivalent;
use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex;
use tracing::trace;

use super::entry::{Entry, Item};
use super::pool::EntryPool;

/// The external count at which readers fold the bulk of it into the internal count.
pub(crate) const OVERFLOW_THRESHOLD: u32 = 1_000_000_000;

/// The amount moved from the external count to the internal count on overflow.
pub(crate) const OVERFLOW_TRANSFER: u32 = 999_000_000;

/// [`Bucket`] is a single hash slot holding a chain of [`Entry`] versions.
///
/// Readers never lock a [`Bucket`]: they claim the current version with a single `fetch_add` on
/// the packed reference word, and release it by decrementing the internal count of the version
/// they claimed. Writers serialize on the bucket lock, prepare a private copy of the current
/// version, and publish it.
///
/// The reference word packs `(id, external_count)` as `id << 32 | external_count`, where `id` is
/// the identifier of the current version and `external_count` is the number of acquisitions made
/// against it since it was published, plus one held by the [`Bucket`] itself.
///
/// A superseded version stays reachable through `prev` links until its internal count reaches
/// zero and every older version has been retired as well; a reader walking from the head towards
/// its own version therefore only ever visits versions that cannot be retired under it.
///
/// Retiring versions requires the lock. A reader that drops the last reference to a version and
/// finds the lock held raises `pending` instead of waiting, and whoever holds the lock serves the
/// request after releasing it.
#[repr(align(64))]
pub(crate) struct Bucket<K, V> {
    /// Writer lock.
    lock: RawMutex,
    /// A reader retired a version while the lock was held.
    pending: AtomicBool,
    /// Packed `(id, external_count)`.
    reference: AtomicU64,
    /// The current version.
    entry: AtomicPtr<Entry<K, V>>,
    _phantom: PhantomData<Box<Entry<K, V>>>,
}

/// [`Reader`] holds one acquisition of a published [`Entry`].
pub(crate) struct Reader<'b, K, V> {
    bucket: &'b Bucket<K, V>,
    entry: NonNull<Entry<K, V>>,
    pool: &'b EntryPool<K, V>,
}

/// [`Writer`] holds the lock of a [`Bucket`].
pub(crate) struct Writer<'b, K, V> {
    bucket: &'b Bucket<K, V>,
    pool: &'b EntryPool<K, V>,
}

impl<K, V> Bucket<K, V> {
    /// Creates an empty [`Bucket`].
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            lock: <RawMutex as RawMutexApi>::INIT,
            pending: AtomicBool::new(false),
            reference: AtomicU64::new(0),
            entry: AtomicPtr::new(ptr::null_mut()),
            _phantom: PhantomData,
        }
    }

    /// Installs the first version of a [`Bucket`] that has not been shared yet.
    pub(crate) fn install(&mut self, mut entry: Box<Entry<K, V>>) {
        debug_assert!(self.entry.get_mut().is_null());
        entry.id = 1;
        *self.entry.get_mut() = Box::into_raw(entry);
        *self.reference.get_mut() = pack(1, 1);
    }

    /// Locks the [`Bucket`] without returning a guard.
    ///
    /// The lock must be released with [`Bucket::unlock_exclusive`].
    #[inline]
    pub(crate) fn lock_exclusive(&self) {
        self.lock.lock();
    }

    /// Releases a lock acquired with [`Bucket::lock_exclusive`].
    ///
    /// # Safety
    ///
    /// The [`Bucket`] must be locked by the caller.
    #[inline]
    pub(crate) unsafe fn unlock_exclusive(&self, pool: &EntryPool<K, V>) {
        self.unlock_and_reclaim(pool);
    }

    /// Releases the lock, then serves reclamation requests raised while it was held.
    ///
    /// # Safety
    ///
    /// The [`Bucket`] must be locked by the caller.
    #[inline]
    unsafe fn unlock_and_reclaim(&self, pool: &EntryPool<K, V>) {
        self.lock.unlock();
        // Pairs with the fence in `request_reclaim`: either the requester takes the lock, or
        // the request is visible here.
        fence(SeqCst);
        self.reclaim_pending(pool);
    }

    /// Retires unreferenced versions now if the lock is free, or hands the work over to the
    /// current lock holder.
    #[inline]
    fn request_reclaim(&self, pool: &EntryPool<K, V>) {
        self.pending.store(true, Release);
        fence(SeqCst);
        self.reclaim_pending(pool);
    }

    /// Serves reclamation requests as long as the lock can be taken without waiting.
    fn reclaim_pending(&self, pool: &EntryPool<K, V>) {
        while self.pending.load(Relaxed) && self.lock.try_lock() {
            if self.pending.swap(false, Acquire) {
                unsafe {
                    self.reclaim_locked(pool);
                }
            }
            unsafe {
                self.lock.unlock();
            }
            fence(SeqCst);
        }
    }

    /// Returns the current version without acquiring it.
    ///
    /// # Safety
    ///
    /// The [`Bucket`] must be locked by the caller for as long as the returned reference lives.
    #[inline]
    pub(crate) unsafe fn head_locked(&self) -> Option<&Entry<K, V>> {
        self.entry.load(Relaxed).as_ref()
    }

    /// Publishes a prepared [`Entry`].
    ///
    /// # Safety
    ///
    /// The [`Bucket`] must be locked by the caller.
    unsafe fn publish_locked(&self, entry: Box<Entry<K, V>>, pool: &EntryPool<K, V>) {
        let id = entry.id;
        let old_ptr = self.entry.swap(Box::into_raw(entry), Release);
        let (old_id, old_count) = unpack(self.reference.swap(pack(id, 1), AcqRel));
        if let Some(old) = old_ptr.as_ref() {
            debug_assert_eq!(old.id, old_id);

            // `old_count` includes the reference the `Bucket` held on the old version.
            #[allow(clippy::cast_possible_wrap)]
            let in_flight = old_count.wrapping_sub(1) as i32;
            if old.internal.fetch_add(in_flight, AcqRel).wrapping_add(in_flight) == 0 {
                self.reclaim_locked(pool);
            }
        }
    }

    /// Retires the oldest superseded versions that nobody holds any longer.
    ///
    /// # Safety
    ///
    /// The [`Bucket`] must be locked by the caller.
    unsafe fn reclaim_locked(&self, pool: &EntryPool<K, V>) {
        let Some(head) = self.entry.load(Relaxed).as_ref() else {
            return;
        };

        // Only the suffix older than every held version may go.
        let mut keep = head;
        let mut current = head.prev.load(Acquire);
        while let Some(entry) = current.as_ref() {
            if entry.internal.load(Acquire) != 0 {
                keep = entry;
            }
            current = entry.prev.load(Acquire);
        }

        let mut retired = keep.prev.swap(ptr::null_mut(), AcqRel);
        while !retired.is_null() {
            let entry = Box::from_raw(retired);
            debug_assert_eq!(entry.internal.load(Relaxed), 0);
            retired = entry.prev.load(Relaxed);
            pool.put(entry);
        }
    }

    /// Moves the bulk of the external count into the internal count of the current version.
    ///
    /// More than one reader may observe the threshold; the re-check under the lock makes sure
    /// the transfer is applied once.
    fn rebalance(&self, pool: &EntryPool<K, V>) {
        let writer = Writer::lock(self, pool);
        let (id, count) = unpack(writer.bucket.reference.load(Relaxed));
        if count < OVERFLOW_THRESHOLD {
            return;
        }
        if let Some(head) = writer.head() {
            debug_assert_eq!(head.id, id);
            writer
                .bucket
                .reference
                .fetch_sub(u64::from(OVERFLOW_TRANSFER), AcqRel);
            #[allow(clippy::cast_possible_wrap)]
            head.internal
                .fetch_add(OVERFLOW_TRANSFER as i32, AcqRel);
            trace!(id, count, "rebalanced bucket reference count");
        }
    }

    /// Returns `true` if no version is held and no superseded version is left.
    #[cfg(test)]
    pub(crate) fn is_quiescent(&self) -> bool {
        let Some(head) = (unsafe { self.entry.load(Acquire).as_ref() }) else {
            return self.reference.load(Acquire) == 0;
        };
        let (id, count) = unpack(self.reference.load(Acquire));
        head.id == id
            && head.prev.load(Acquire).is_null()
            && !self.pending.load(Acquire)
            && i64::from(head.internal.load(Acquire)) + i64::from(count) == 1
    }
}

impl<K, V> Default for Bucket<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        let mut current = *self.entry.get_mut();
        while !current.is_null() {
            let entry = unsafe { Box::from_raw(current) };
            current = entry.prev.load(Relaxed);
        }
    }
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for Bucket<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Bucket<K, V> {}

impl<'b, K, V> Reader<'b, K, V> {
    /// Acquires the current version of the [`Bucket`].
    ///
    /// Returns `None` if nothing has ever been published in the [`Bucket`].
    pub(crate) fn acquire(bucket: &'b Bucket<K, V>, pool: &'b EntryPool<K, V>) -> Option<Self> {
        if bucket.entry.load(Relaxed).is_null() {
            return None;
        }

        let (id, count) = unpack(bucket.reference.fetch_add(1, Acquire).wrapping_add(1));
        if id == 0 {
            // The first version is being published.
            return None;
        }

        // The head is at least as new as `id`; walk back to the claimed version.
        let mut current = bucket.entry.load(Acquire);
        let entry = loop {
            let entry = NonNull::new(current)?;
            let entry_ref = unsafe { entry.as_ref() };
            if entry_ref.id == id {
                break entry;
            }
            current = entry_ref.prev.load(Acquire);
        };

        if count == OVERFLOW_THRESHOLD {
            bucket.rebalance(pool);
        }

        Some(Self {
            bucket,
            entry,
            pool,
        })
    }
}

impl<K, V> Deref for Reader<'_, K, V> {
    type Target = Entry<K, V>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { self.entry.as_ref() }
    }
}

impl<K, V> Drop for Reader<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        // The entry must not be touched after the decrement.
        let internal = unsafe { &self.entry.as_ref().internal };
        if internal.fetch_sub(1, AcqRel) == 1 {
            self.bucket.request_reclaim(self.pool);
        }
    }
}

impl<'b, K, V> Writer<'b, K, V> {
    /// Locks the [`Bucket`].
    #[inline]
    pub(crate) fn lock(bucket: &'b Bucket<K, V>, pool: &'b EntryPool<K, V>) -> Self {
        bucket.lock.lock();
        Self { bucket, pool }
    }

    /// Creates a [`Writer`] out of a [`Bucket`] locked by [`Bucket::lock_exclusive`].
    ///
    /// # Safety
    ///
    /// The [`Bucket`] must be locked by the caller, and no other [`Writer`] may exist for it.
    #[inline]
    pub(crate) unsafe fn from_locked(bucket: &'b Bucket<K, V>, pool: &'b EntryPool<K, V>) -> Self {
        Self { bucket, pool }
    }

    /// Drops the [`Writer`] without releasing the lock.
    #[inline]
    pub(crate) fn keep_locked(self) {
        forget(self);
    }

    /// Returns the current version.
    #[inline]
    pub(crate) fn head(&self) -> Option<&Entry<K, V>> {
        // The head cannot be retired while the lock is held.
        unsafe { self.bucket.entry.load(Relaxed).as_ref() }
    }

    /// Prepares a private copy of the current version.
    pub(crate) fn prepare(&self) -> Box<Entry<K, V>>
    where
        K: Clone,
        V: Clone,
    {
        let mut entry = self.pool.take();
        let head_ptr = self.bucket.entry.load(Relaxed);
        match unsafe { head_ptr.as_ref() } {
            Some(head) => entry.succeed(head, head_ptr),
            None => entry.id = 1,
        }
        entry
    }

    /// Prepares a private copy of the current version without the item matching the key.
    ///
    /// The omitted item of the current version is returned along with the copy.
    pub(crate) fn prepare_without<Q>(
        &self,
        hash: u32,
        key: &Q,
    ) -> (Box<Entry<K, V>>, Option<&Item<K, V>>)
    where
        K: Clone,
        V: Clone,
        Q: Equivalent<K> + ?Sized,
    {
        let mut entry = self.pool.take();
        let head_ptr = self.bucket.entry.load(Relaxed);
        let omitted = match unsafe { head_ptr.as_ref() } {
            Some(head) => entry.succeed_without(head, head_ptr, hash, key),
            None => {
                entry.id = 1;
                None
            }
        };
        (entry, omitted)
    }

    /// Prepares an empty successor of the current version.
    pub(crate) fn prepare_empty(&self) -> Box<Entry<K, V>> {
        let mut entry = self.pool.take();
        let head_ptr = self.bucket.entry.load(Relaxed);
        match unsafe { head_ptr.as_ref() } {
            Some(head) => entry.supersede(head, head_ptr),
            None => entry.id = 1,
        }
        entry
    }

    /// Publishes a prepared [`Entry`].
    ///
    /// Takes `&mut self` so that no reference obtained from [`Writer::head`] outlives the
    /// publication.
    #[inline]
    pub(crate) fn publish(&mut self, entry: Box<Entry<K, V>>) {
        unsafe {
            self.bucket.publish_locked(entry, self.pool);
        }
    }
}

impl<K, V> Drop for Writer<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            self.bucket.unlock_and_reclaim(self.pool);
        }
    }
}

/// Packs a version identifier and an external count.
#[inline]
const fn pack(id: u32, count: u32) -> u64 {
    ((id as u64) << 32) | count as u64
}

/// Splits a packed reference word into `(id, external_count)`.
#[allow(clippy::cast_possible_truncation)]
#[inline]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

#[cfg(test)]
mod test {
    use std::rc::Rc;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{pack, unpack, Bucket, Reader, Writer, OVERFLOW_THRESHOLD};
    use crate::hash_table::entry::Item;
    use crate::hash_table::pool::EntryPool;

    static_assertions::assert_eq_size!(Bucket<String, String>, [u8; 64]);
    static_assertions::assert_impl_all!(Bucket<String, String>: Send, Sync);
    static_assertions::assert_not_impl_any!(Bucket<Rc<String>, String>: Send, Sync);

    fn set(bucket: &Bucket<u64, u64>, pool: &EntryPool<u64, u64>, key: u64, value: u64) {
        let mut writer = Writer::lock(bucket, pool);
        let (mut entry, _) = writer.prepare_without(0, &key);
        entry.push(Item {
            hash: 0,
            key,
            value,
        });
        writer.publish(entry);
    }

    fn get(bucket: &Bucket<u64, u64>, pool: &EntryPool<u64, u64>, key: u64) -> Option<u64> {
        Reader::acquire(bucket, pool).and_then(|r| r.search(0, &key).map(|i| i.value))
    }

    fn chain_len(bucket: &Bucket<u64, u64>) -> usize {
        let mut len = 0;
        let mut current = bucket.entry.load(Relaxed);
        while let Some(entry) = unsafe { current.as_ref() } {
            len += 1;
            current = entry.prev.load(Relaxed);
        }
        len
    }

    fn head_internal(bucket: &Bucket<u64, u64>, pool: &EntryPool<u64, u64>) -> i32 {
        let writer = Writer::lock(bucket, pool);
        writer.head().map_or(0, |head| head.internal.load(Relaxed))
    }

    #[test]
    fn packing() {
        assert_eq!(unpack(pack(7, 3)), (7, 3));
        assert_eq!(unpack(pack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
        assert_eq!(unpack(pack(2, u32::MAX) + 1), (3, 0));
    }

    #[test]
    fn empty_bucket() {
        let pool = EntryPool::default();
        let bucket: Bucket<u64, u64> = Bucket::new();
        assert!(Reader::acquire(&bucket, &pool).is_none());
        assert_eq!(bucket.reference.load(Relaxed), 0);
        assert!(bucket.is_quiescent());
    }

    #[test]
    fn publish_replaces_head() {
        let pool = EntryPool::default();
        let bucket = Bucket::new();
        set(&bucket, &pool, 1, 10);
        assert_eq!(unpack(bucket.reference.load(Relaxed)), (1, 1));
        set(&bucket, &pool, 2, 20);
        assert_eq!(unpack(bucket.reference.load(Relaxed)), (2, 1));
        assert_eq!(chain_len(&bucket), 1);
        assert_eq!(get(&bucket, &pool, 1), Some(10));
        assert_eq!(get(&bucket, &pool, 2), Some(20));
        assert_eq!(get(&bucket, &pool, 3), None);
        assert_eq!(pool.idle(), 1);
        assert!(bucket.is_quiescent());
    }

    #[test]
    fn replace_in_place() {
        let pool = EntryPool::default();
        let bucket = Bucket::new();
        set(&bucket, &pool, 1, 10);
        set(&bucket, &pool, 2, 20);
        set(&bucket, &pool, 1, 11);
        let reader = Reader::acquire(&bucket, &pool).unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.search(0, &1).map(|i| i.value), Some(11));
        assert_eq!(reader.search(0, &2).map(|i| i.value), Some(20));
    }

    #[test]
    fn reader_keeps_superseded_version() {
        let pool = EntryPool::default();
        let bucket = Bucket::new();
        set(&bucket, &pool, 1, 10);
        let reader = Reader::acquire(&bucket, &pool).unwrap();
        set(&bucket, &pool, 1, 11);

        assert_eq!(chain_len(&bucket), 2);
        assert_eq!(reader.internal.load(Relaxed), 1);
        assert_eq!(reader.search(0, &1).map(|i| i.value), Some(10));
        assert_eq!(get(&bucket, &pool, 1), Some(11));

        let idle = pool.idle();
        drop(reader);
        assert_eq!(chain_len(&bucket), 1);
        assert_eq!(pool.idle(), idle + 1);
        assert!(bucket.is_quiescent());
    }

    #[test]
    fn older_versions_retire_first() {
        let pool = EntryPool::default();
        let bucket = Bucket::new();
        set(&bucket, &pool, 1, 1);
        let oldest = Reader::acquire(&bucket, &pool).unwrap();
        set(&bucket, &pool, 1, 2);
        let middle = Reader::acquire(&bucket, &pool).unwrap();
        set(&bucket, &pool, 1, 3);
        assert_eq!(chain_len(&bucket), 3);

        drop(middle);
        assert_eq!(chain_len(&bucket), 3);
        assert_eq!(oldest.search(0, &1).map(|i| i.value), Some(1));

        drop(oldest);
        assert_eq!(chain_len(&bucket), 1);
        assert_eq!(get(&bucket, &pool, 1), Some(3));
    }

    #[test]
    fn release_under_lock_is_deferred() {
        let pool = EntryPool::default();
        let bucket = Bucket::new();
        set(&bucket, &pool, 1, 1);
        let reader = Reader::acquire(&bucket, &pool).unwrap();
        set(&bucket, &pool, 1, 2);
        assert_eq!(chain_len(&bucket), 2);

        // The release does not wait for the lock; the lock holder reclaims on its way out.
        let writer = Writer::lock(&bucket, &pool);
        drop(reader);
        assert_eq!(chain_len(&bucket), 2);
        assert!(bucket.pending.load(Relaxed));
        drop(writer);
        assert_eq!(chain_len(&bucket), 1);
        assert!(bucket.is_quiescent());

        let reader = Reader::acquire(&bucket, &pool).unwrap();
        set(&bucket, &pool, 1, 3);
        bucket.lock_exclusive();
        drop(reader);
        assert_eq!(chain_len(&bucket), 2);
        unsafe {
            bucket.unlock_exclusive(&pool);
        }
        assert_eq!(chain_len(&bucket), 1);
        assert_eq!(get(&bucket, &pool, 1), Some(3));
    }

    #[test]
    fn overflow_rebalance() {
        let pool = EntryPool::default();
        let bucket = Bucket::new();
        set(&bucket, &pool, 1, 1);
        bucket
            .reference
            .store(pack(1, OVERFLOW_THRESHOLD - 1), Relaxed);
        {
            let writer = Writer::lock(&bucket, &pool);
            writer.head().unwrap().internal.store(-999_999_998, Relaxed);
        }

        assert_eq!(get(&bucket, &pool, 1), Some(1));
        assert_eq!(unpack(bucket.reference.load(Relaxed)), (1, 1_000_000));
        assert_eq!(head_internal(&bucket, &pool), -999_999);
        assert!(bucket.is_quiescent());

        // The sum is preserved across a later publish.
        set(&bucket, &pool, 1, 2);
        assert_eq!(chain_len(&bucket), 1);
        assert_eq!(head_internal(&bucket, &pool), 0);
    }

    #[test]
    fn quiescence() {
        let num_threads = 8;
        let pool = Arc::new(EntryPool::default());
        let bucket: Arc<Bucket<u64, u64>> = Arc::new(Bucket::new());
        let barrier = Arc::new(Barrier::new(num_threads));
        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let (pool, bucket, barrier) = (pool.clone(), bucket.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..4096_u64 {
                        if t % 2 == 0 {
                            set(&bucket, &pool, t as u64, i);
                        } else {
                            let r = Reader::acquire(&bucket, &pool);
                            let s = Reader::acquire(&bucket, &pool);
                            assert!(r.is_none() || r.unwrap().len() <= num_threads);
                            drop(s);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(chain_len(&bucket), 1);
        assert!(bucket.is_quiescent());
        for t in (0..num_threads).step_by(2) {
            assert_eq!(get(&bucket, &pool, t as u64), Some(4095));
        }
    }
}
