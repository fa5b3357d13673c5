//! Overflow value placement during reconciliation.

use bytes::Bytes;

use super::RecCtx;
use crate::primitives::block::BlockAddr;
use crate::storage::btree::cell::ImageValue;
use crate::storage::btree::page::{DiskValue, OverflowTrack};
use crate::types::Result;

/// Tracks which overflow blocks the images being built reference.
#[derive(Debug, Default)]
pub(crate) struct OverflowWriter {
    max_inline: usize,
    old: OverflowTrack,
    fresh: OverflowTrack,
    used: Vec<(Bytes, BlockAddr)>,
    reused: u64,
}

impl OverflowWriter {
    pub(crate) fn new(max_inline: usize) -> Self {
        Self {
            max_inline,
            ..Self::default()
        }
    }

    pub(crate) fn seed(&mut self, track: &OverflowTrack) {
        self.old = track.clone();
    }

    fn lookup(&mut self, value: &Bytes) -> Option<BlockAddr> {
        if let Some(addr) = self.fresh.lookup(value) {
            return Some(addr);
        }
        let addr = self.old.lookup(value)?;
        self.reused += 1;
        self.keep(value, addr);
        Some(addr)
    }

    fn keep(&mut self, value: &Bytes, addr: BlockAddr) {
        if self.fresh.lookup(value) != Some(addr) {
            self.fresh.remember(value, addr);
            self.used.push((value.clone(), addr));
        }
    }

    /// Replaces `track` with the blocks the new images use; returns the
    /// blocks nothing references any more and the reuse count.
    pub(crate) fn finish(&mut self, track: &mut OverflowTrack) -> (Vec<BlockAddr>, u64) {
        let used: Vec<BlockAddr> = self.used.iter().map(|(_, addr)| *addr).collect();
        let unused = track
            .blocks()
            .into_iter()
            .filter(|addr| !used.contains(addr))
            .collect();
        track.reset(self.used.drain(..));
        (unused, std::mem::take(&mut self.reused))
    }
}

impl RecCtx<'_> {
    /// Chooses how `value` is stored: inline, in a reused overflow block or
    /// in a newly written one. The flag reports overflow storage.
    pub(crate) fn place_value(&mut self, value: &Bytes) -> Result<(ImageValue, bool)> {
        if value.len() <= self.ovfl.max_inline {
            return Ok((ImageValue::Inline(value.clone()), false));
        }
        if let Some(addr) = self.ovfl.lookup(value) {
            return Ok((ImageValue::Overflow(addr), true));
        }
        let addr = self.write_overflow(value)?;
        self.ovfl.keep(value, addr);
        Ok((ImageValue::Overflow(addr), true))
    }

    /// Keeps an on-page value where it already lives.
    pub(crate) fn place_disk(&mut self, value: &DiskValue) -> Result<(ImageValue, bool)> {
        match value {
            DiskValue::Inline(bytes) => self.place_value(bytes),
            DiskValue::Overflow { addr, value } => {
                self.ovfl.keep(value, *addr);
                Ok((ImageValue::Overflow(*addr), true))
            }
        }
    }
}
