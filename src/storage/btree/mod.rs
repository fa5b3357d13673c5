#![forbid(unsafe_code)]

//! Transactional page engine of the B-tree.
//!
//! Pages live in memory behind atomically managed references, collect
//! modifications in update chains and insert lists, and are turned back
//! into page images by reconciliation during eviction and checkpoint.

/// Private page image format: cells, headers and the image writer.
pub mod cell;

/// Lock-free ordered insert index.
pub mod insert;

/// In-memory pages and their modify structures.
pub mod page;

/// Page references and their state machine.
pub mod reference;

/// Update records and per-key update chains.
pub mod update;

/// Choosing the version of a value a reader or a reconciliation sees.
pub mod visibility;

mod checkpoint;
mod col_cursor;
mod cursor;
pub(crate) mod delete;
mod evict;
mod reconcile;
mod stats;
mod sweep;
mod tree;
mod walk;

pub use col_cursor::ColCursor;
pub use cursor::Cursor;
pub use reconcile::bulk::BulkLoader;
pub use reconcile::{RecBlock, RecResult, SavedKey, SavedUpdate};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{Tree, TreeEnv, TreeKind, TruncateStats};
pub use update::{ModifyEntry, UpdateKind};
pub use walk::Direction;
