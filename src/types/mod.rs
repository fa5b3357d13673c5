#![forbid(unsafe_code)]
//! Shared identifiers, error type and on-disk metadata used across the engine.

/// Block image checksums.
pub mod checksum;
/// Fixed header carried by every page image handed to the block manager.
pub mod page;
/// Transaction ids, timestamps and validity intervals.
pub mod time;

pub use checksum::block_crc32;
pub use time::{TimeAggregate, TimePoint, TimeWindow, Timestamp, TxnId};

/// Record number used to address column-store rows (1-based).
pub type Recno = u64;

/// Error type shared by every engine operation.
///
/// Variants fall into the classes the engine reasons about: structural races
/// (`Restart`, `Busy`) that the immediate caller retries, logical end
/// conditions (`NotFound`), transactional outcomes (`WriteConflict`,
/// `PrepareConflict`) and fatal states (`Visibility`, `Corruption`, `Panic`)
/// that leave the tree unusable.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Error bubbled up from the underlying file or device.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// An on-disk structure or reference state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the engine cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// Normal traversal terminus: no (more) matching rows.
    #[error("not found")]
    NotFound,
    /// A structural race was detected; the operation must be restarted from its root.
    #[error("restart")]
    Restart,
    /// A resource is transiently held elsewhere; try again or pick another target.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// The newest update on a chain is not visible to the writing transaction.
    #[error("write conflict")]
    WriteConflict,
    /// A reader met a prepared update it would otherwise be able to see.
    #[error("prepare conflict")]
    PrepareConflict,
    /// An update that must be visible was not; continuing would persist wrong data.
    #[error("visibility invariant violated: {0}")]
    Visibility(&'static str),
    /// The engine hit a fatal error earlier and refuses further work.
    #[error("engine panicked; restart required")]
    Panic,
}

impl SombraError {
    /// Returns true for errors the immediate caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SombraError::Restart | SombraError::Busy(_))
    }

    /// Returns true for errors that must put the engine into its failed state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SombraError::Corruption(_) | SombraError::Visibility(_) | SombraError::Panic
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SombraError>;
