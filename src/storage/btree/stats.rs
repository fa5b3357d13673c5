use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct BTreeStatsSnapshot {
    /// Insert-list searches restarted after a level-0 race
    pub insert_restarts: u64,
    /// Pages read from the block manager
    pub pages_read: u64,
    /// Page images written by reconciliation
    pub pages_written: u64,
    /// Pages discarded or replaced by eviction
    pub pages_evicted: u64,
    /// Eviction attempts abandoned because the page was busy
    pub evict_busy: u64,
    /// Pages split into their parent
    pub splits: u64,
    /// Leaf pages deleted without being read
    pub fast_deletes: u64,
    /// Fast-deleted pages instantiated for a reader
    pub instantiations: u64,
    /// Obsolete child pages marked deleted by the sweep
    pub pages_swept: u64,
    /// Overflow blocks written
    pub overflow_written: u64,
    /// Overflow blocks reused from an earlier reconciliation
    pub overflow_reused: u64,
    /// Update chains saved during eviction
    pub saved_updates: u64,
    /// Update chains restored from the lookaside table
    pub lookaside_restored: u64,
    /// Rows skipped by cursors because they were deleted or not yet visible
    pub cursor_skipped: u64,
    /// Completed checkpoints
    pub checkpoints: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default, Debug)]
pub struct BTreeStats {
    insert_restarts: AtomicU64,
    pages_read: AtomicU64,
    pages_written: AtomicU64,
    pages_evicted: AtomicU64,
    evict_busy: AtomicU64,
    splits: AtomicU64,
    fast_deletes: AtomicU64,
    instantiations: AtomicU64,
    pages_swept: AtomicU64,
    overflow_written: AtomicU64,
    overflow_reused: AtomicU64,
    saved_updates: AtomicU64,
    lookaside_restored: AtomicU64,
    cursor_skipped: AtomicU64,
    checkpoints: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl BTreeStats {
            $(
                pub(crate) fn $inc(&self, n: u64) {
                    self.$field.fetch_add(n, AtomicOrdering::Relaxed);
                }
            )*

            /// Creates a snapshot of all current statistics.
            pub fn snapshot(&self) -> BTreeStatsSnapshot {
                BTreeStatsSnapshot {
                    $($field: self.$field.load(AtomicOrdering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    insert_restarts => add_insert_restarts,
    pages_read => add_pages_read,
    pages_written => add_pages_written,
    pages_evicted => add_pages_evicted,
    evict_busy => add_evict_busy,
    splits => add_splits,
    fast_deletes => add_fast_deletes,
    instantiations => add_instantiations,
    pages_swept => add_pages_swept,
    overflow_written => add_overflow_written,
    overflow_reused => add_overflow_reused,
    saved_updates => add_saved_updates,
    lookaside_restored => add_lookaside_restored,
    cursor_skipped => add_cursor_skipped,
    checkpoints => add_checkpoints,
}

impl BTreeStats {
    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "sombra_engine::stats",
            insert_restarts = snapshot.insert_restarts,
            pages_read = snapshot.pages_read,
            pages_written = snapshot.pages_written,
            pages_evicted = snapshot.pages_evicted,
            evict_busy = snapshot.evict_busy,
            splits = snapshot.splits,
            fast_deletes = snapshot.fast_deletes,
            instantiations = snapshot.instantiations,
            pages_swept = snapshot.pages_swept,
            overflow_written = snapshot.overflow_written,
            overflow_reused = snapshot.overflow_reused,
            saved_updates = snapshot.saved_updates,
            lookaside_restored = snapshot.lookaside_restored,
            cursor_skipped = snapshot.cursor_skipped,
            checkpoints = snapshot.checkpoints,
            "tree stats snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::BTreeStats;

    #[test]
    fn counters_accumulate() {
        let stats = BTreeStats::default();
        stats.add_splits(2);
        stats.add_splits(1);
        stats.add_pages_evicted(4);
        let snap = stats.snapshot();
        assert_eq!(snap.splits, 3);
        assert_eq!(snap.pages_evicted, 4);
        assert_eq!(snap.fast_deletes, 0);
    }
}
