use std::ptr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicI32, AtomicPtr};

use equivalent::Equivalent;

/// [`Item`] is a single key-value pair stored in an [`Entry`].
///
/// The 32-bit hash is kept alongside the key so that resizing can redistribute items without
/// access to the hasher.
#[derive(Clone, Debug)]
pub(crate) struct Item<K, V> {
    pub(crate) hash: u32,
    pub(crate) key: K,
    pub(crate) value: V,
}

/// [`Entry`] is one version of the contents of a bucket.
///
/// An [`Entry`] is private to the writer that prepared it until it is published; once published
/// its items never change, and only `internal` and `prev` are updated.
pub(crate) struct Entry<K, V> {
    /// Version identifier, `1` for the first version of a bucket and never `0`.
    pub(crate) id: u32,
    /// Reference count that gates reclamation.
    ///
    /// It may be negative while the [`Entry`] is the bucket head since readers release against
    /// it before the external count is folded in.
    pub(crate) internal: AtomicI32,
    /// The version this [`Entry`] superseded.
    pub(crate) prev: AtomicPtr<Entry<K, V>>,
    /// Inline slot; a bucket usually holds a single item.
    item: Option<Item<K, V>>,
    /// Colliding items.
    overflow: Vec<Item<K, V>>,
}

impl<K, V> Entry<K, V> {
    /// Creates an empty, unpublished [`Entry`].
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            id: 0,
            internal: AtomicI32::new(0),
            prev: AtomicPtr::new(ptr::null_mut()),
            item: None,
            overflow: Vec::new(),
        }
    }

    /// Returns the number of items.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        usize::from(self.item.is_some()) + self.overflow.len()
    }

    /// Iterates over the items.
    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Item<K, V>> {
        self.item.iter().chain(self.overflow.iter())
    }

    /// Searches for the item matching the key.
    #[inline]
    pub(crate) fn search<Q>(&self, hash: u32, key: &Q) -> Option<&Item<K, V>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        self.iter()
            .find(|item| item.hash == hash && key.equivalent(&item.key))
    }

    /// Appends an item that is known not to be present.
    #[inline]
    pub(crate) fn push(&mut self, item: Item<K, V>) {
        if self.item.is_none() {
            self.item = Some(item);
        } else {
            self.overflow.push(item);
        }
    }

    /// Turns `self` into an empty successor of `head`.
    pub(crate) fn supersede(&mut self, head: &Entry<K, V>, head_ptr: *mut Entry<K, V>) {
        debug_assert_eq!(self.len(), 0);
        self.id = next_id(head.id);
        self.prev.store(head_ptr, Relaxed);
    }

    /// Turns `self` into the successor of `head`.
    ///
    /// Items are cloned from `head`, and `head` becomes the `prev` link.
    pub(crate) fn succeed(&mut self, head: &Entry<K, V>, head_ptr: *mut Entry<K, V>)
    where
        K: Clone,
        V: Clone,
    {
        self.supersede(head, head_ptr);
        self.item.clone_from(&head.item);
        self.overflow.extend(head.overflow.iter().cloned());
    }

    /// Turns `self` into the successor of `head` without the item matching the key.
    ///
    /// Returns the omitted item of `head`, which is left uncloned.
    pub(crate) fn succeed_without<'h, Q>(
        &mut self,
        head: &'h Entry<K, V>,
        head_ptr: *mut Entry<K, V>,
        hash: u32,
        key: &Q,
    ) -> Option<&'h Item<K, V>>
    where
        K: Clone,
        V: Clone,
        Q: Equivalent<K> + ?Sized,
    {
        self.supersede(head, head_ptr);
        let mut omitted = None;
        for item in head.iter() {
            if omitted.is_none() && item.hash == hash && key.equivalent(&item.key) {
                omitted = Some(item);
            } else {
                self.push(item.clone());
            }
        }
        omitted
    }

    /// Drops all the items and resets the [`Entry`] so that it can be reused.
    pub(crate) fn reset(&mut self) {
        self.id = 0;
        *self.internal.get_mut() = 0;
        *self.prev.get_mut() = ptr::null_mut();
        self.item = None;
        self.overflow.clear();
    }
}

impl<K, V> Default for Entry<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the identifier following `id`, skipping `0` on wrap-around.
#[inline]
pub(crate) const fn next_id(id: u32) -> u32 {
    match id.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}
