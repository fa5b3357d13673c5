//! Transactional page engine of an embedded key/value B-tree store.
//!
//! Row-store and column-store trees keep recent modifications in memory,
//! resolve them against MVCC snapshots and write them back as page images
//! through reconciliation, eviction and checkpoint.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod txn;
pub mod types;

pub use storage::{Tree, TreeEnv, TreeKind, TreeOptions};
pub use txn::{Snapshot, Txn, TxnManager};
pub use types::{Recno, Result, SombraError};
