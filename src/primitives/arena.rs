#![forbid(unsafe_code)]
//! Append-only concurrent arena addressed by `u32` index.
//!
//! Storage grows in buckets of doubling size, so an element never moves once
//! published and `get` hands out plain shared references. Nothing is removed
//! until the arena itself is dropped, which is what lets lock-free structures
//! link entries by index instead of by pointer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::types::{Result, SombraError};

/// Index value meaning "no entry".
pub const NIL: u32 = u32::MAX;

const FIRST_BUCKET: usize = 32;
const BUCKETS: usize = 26;

/// Append-only arena of `T`.
pub struct Arena<T> {
    len: AtomicU32,
    buckets: [OnceLock<Box<[OnceLock<T>]>>; BUCKETS],
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn locate(idx: u32) -> (usize, usize) {
    let scaled = idx as usize / FIRST_BUCKET + 1;
    let bucket = (usize::BITS - 1 - scaled.leading_zeros()) as usize;
    let start = FIRST_BUCKET * ((1usize << bucket) - 1);
    (bucket, idx as usize - start)
}

impl<T> Arena<T> {
    /// Creates an empty arena; no storage is allocated until the first push.
    pub fn new() -> Self {
        Self {
            len: AtomicU32::new(0),
            buckets: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Appends `value` and returns its index.
    pub fn push(&self, value: T) -> Result<u32> {
        let idx = self.len.fetch_add(1, Ordering::AcqRel);
        if idx >= NIL {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(SombraError::Invalid("arena exhausted"));
        }
        let (bucket, slot) = locate(idx);
        if bucket >= BUCKETS {
            return Err(SombraError::Invalid("arena exhausted"));
        }
        let cells = self.buckets[bucket].get_or_init(|| {
            (0..FIRST_BUCKET << bucket)
                .map(|_| OnceLock::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        cells[slot]
            .set(value)
            .map_err(|_| SombraError::Corruption("arena slot written twice"))?;
        Ok(idx)
    }

    /// Returns the entry at `idx` once its push has completed.
    pub fn get(&self, idx: u32) -> Option<&T> {
        if idx == NIL {
            return None;
        }
        let (bucket, slot) = locate(idx);
        self.buckets.get(bucket)?.get()?.get(slot)?.get()
    }

    /// Number of indexes handed out so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(NIL) as usize
    }

    /// Returns true when nothing was ever pushed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over published entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        (0..self.len() as u32).filter_map(move |idx| self.get(idx).map(|v| (idx, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bucket_boundaries_map_contiguously() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
    }

    #[test]
    fn push_get_across_buckets() -> Result<()> {
        let arena = Arena::new();
        for i in 0..1_000u32 {
            assert_eq!(arena.push(i * 2)?, i);
        }
        assert_eq!(arena.len(), 1_000);
        assert_eq!(arena.get(0), Some(&0));
        assert_eq!(arena.get(999), Some(&1_998));
        assert_eq!(arena.get(1_000), None);
        assert_eq!(arena.get(NIL), None);
        assert_eq!(arena.iter().count(), 1_000);
        Ok(())
    }

    #[test]
    fn concurrent_pushes_are_all_visible() {
        let arena = Arc::new(Arena::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    (0..500u64)
                        .map(|i| arena.push(t * 1_000 + i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut indexes: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        assert_eq!(indexes.len(), 2_000);
        assert!(indexes.iter().all(|&i| arena.get(i).is_some()));
    }
}
