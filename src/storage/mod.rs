//! Storage layer of the engine.
//!
//! The B-tree page engine, the options a tree is configured with and the
//! cache accounting hooks it reports memory use through.

/// B-tree page engine.
///
/// Trees, cursors, reconciliation, eviction and checkpoint.
pub mod btree;

/// Cache accounting hooks.
pub mod cache;

/// Tree configuration.
pub mod options;

pub use btree::{
    BTreeStats, BTreeStatsSnapshot, BulkLoader, ColCursor, Cursor, Direction, ModifyEntry, Tree,
    TreeEnv, TreeKind, TruncateStats,
};
pub use cache::{CacheAccounting, CacheStats, NoopCache};
pub use options::TreeOptions;
