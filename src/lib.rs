//! Concurrent hash maps with lock-free reads.
//!
//! # splitmap::AtomicMap
//! A concurrent hash map whose buckets hold immutable versions of their contents. Readers claim
//! the current version of a bucket with a single atomic increment and never block; writers
//! serialize per bucket and publish a new version.
//!
//! # splitmap::AtomicShardedMap
//! An [`AtomicMap`] split into independently resized shards.
//!
//! # splitmap::LockedMap
//! An exclusive view of either map with every bucket locked.

mod atomic_map;
mod atomic_sharded_map;
mod hash_table;
mod locked_map;

// splitmap::AtomicMap
pub use atomic_map::AtomicMap;

// splitmap::AtomicShardedMap
pub use atomic_sharded_map::AtomicShardedMap;

// splitmap::LockedMap
pub use locked_map::LockedMap;

pub use equivalent::Equivalent;
