//! Low-level building blocks for the page engine.
//!
//! Includes byte utilities, the index-addressed arena behind the lock-free
//! structures, concurrency helpers, positional file I/O and the block
//! manager that stores page images.

/// Append-only arena addressed by `u32` index.
pub mod arena;

/// Block manager interface and in-memory/file implementations.
pub mod block;

/// Varint encoding and key-prefix helpers.
pub mod bytes;

/// Hazard counters, backoff and split generations.
pub mod concurrency;

/// Positional file I/O.
pub mod io;
