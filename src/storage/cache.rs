use std::sync::atomic::{AtomicU64, Ordering};

/// Cache accounting hooks called by the page engine.
///
/// The engine reports pages entering and leaving memory and the byte
/// footprint of images and update records. It never reads the counters
/// back; sizing and eviction policy belong to whoever owns the cache.
pub trait CacheAccounting: Send + Sync {
    /// A page became resident with an in-memory footprint of `bytes`.
    fn page_created(&self, bytes: usize);

    /// A resident page footprint of `bytes` was released.
    fn page_released(&self, bytes: usize);

    /// Resident memory grew by `bytes` (update records, insert nodes).
    fn bytes_inc(&self, bytes: usize);

    /// Resident memory shrank by `bytes`.
    fn bytes_dec(&self, bytes: usize);
}

/// A no-op implementation of [`CacheAccounting`].
#[derive(Default, Debug)]
pub struct NoopCache;

impl CacheAccounting for NoopCache {
    fn page_created(&self, _bytes: usize) {}
    fn page_released(&self, _bytes: usize) {}
    fn bytes_inc(&self, _bytes: usize) {}
    fn bytes_dec(&self, _bytes: usize) {}
}

/// Counter-based implementation of [`CacheAccounting`].
#[derive(Default, Debug)]
pub struct CacheStats {
    /// Pages currently resident.
    pub pages: AtomicU64,
    /// Bytes currently resident.
    pub bytes: AtomicU64,
    /// Pages brought into memory since creation.
    pub pages_created: AtomicU64,
    /// Pages released since creation.
    pub pages_released: AtomicU64,
}

impl CacheStats {
    /// Number of resident pages.
    pub fn resident_pages(&self) -> u64 {
        self.pages.load(Ordering::Relaxed)
    }

    /// Number of resident bytes.
    pub fn resident_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
        Some(cur.saturating_sub(n))
    });
}

impl CacheAccounting for CacheStats {
    fn page_created(&self, bytes: usize) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.pages_created.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn page_released(&self, bytes: usize) {
        saturating_sub(&self.pages, 1);
        self.pages_released.fetch_add(1, Ordering::Relaxed);
        saturating_sub(&self.bytes, bytes as u64);
    }

    fn bytes_inc(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn bytes_dec(&self, bytes: usize) {
        saturating_sub(&self.bytes, bytes as u64);
    }
}
