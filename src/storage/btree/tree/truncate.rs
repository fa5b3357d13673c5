//! Range truncation.
//!
//! Leaf pages that lie entirely inside the range and are still on disk are
//! deleted without being read; whatever remains visible in the range is
//! removed row by row through a bounded cursor.

use std::ops::{Bound, RangeInclusive};

use tracing::info;

use super::{PageIn, PageInFlags, Tree, TreeInner, WriteMode};
use crate::storage::btree::delete;
use crate::storage::btree::page::PageHandle;
use crate::storage::btree::reference::{RefKey, RefState};
use crate::storage::btree::update::UpdateKind;
use crate::txn::{Snapshot, Txn};
use crate::types::{Recno, Result, SombraError};

/// What a truncate did.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TruncateStats {
    /// Leaf pages deleted without being read.
    pub pages_deleted: u64,
    /// Rows (or records) removed individually.
    pub rows_removed: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Cover {
    Disjoint,
    Partial,
    Full,
}

enum Span<'a> {
    Row(Bound<&'a [u8]>, Bound<&'a [u8]>),
    Recno(Recno, Recno),
}

impl Span<'_> {
    /// How the span relates to a child holding `[lo, hi)`.
    fn cover(&self, lo: &RefKey, hi: Option<&RefKey>) -> Cover {
        match self {
            Span::Row(lower, upper) => {
                let lo = lo.row();
                let hi = hi.map(RefKey::row);
                let before = match upper {
                    Bound::Included(end) => *end < lo,
                    Bound::Excluded(end) => *end <= lo,
                    Bound::Unbounded => false,
                };
                let after = match (lower, hi) {
                    (Bound::Included(start) | Bound::Excluded(start), Some(hi)) => *start >= hi,
                    _ => false,
                };
                if before || after {
                    return Cover::Disjoint;
                }
                let from = match lower {
                    Bound::Unbounded => true,
                    Bound::Included(start) => *start <= lo,
                    Bound::Excluded(start) => *start < lo,
                };
                let to = match (upper, hi) {
                    (Bound::Unbounded, _) => true,
                    (_, None) => false,
                    (Bound::Included(end) | Bound::Excluded(end), Some(hi)) => hi <= *end,
                };
                if from && to {
                    Cover::Full
                } else {
                    Cover::Partial
                }
            }
            Span::Recno(start, end) => {
                let lo = lo.recno();
                let hi = hi.map(RefKey::recno);
                if *end < lo || hi.is_some_and(|hi| hi <= *start) {
                    return Cover::Disjoint;
                }
                let to = match hi {
                    Some(hi) => hi.saturating_sub(1) <= *end,
                    None => *end == Recno::MAX,
                };
                if *start <= lo && to {
                    Cover::Full
                } else {
                    Cover::Partial
                }
            }
        }
    }
}

impl TreeInner {
    fn fast_delete_under(
        &self,
        txn: &mut Txn,
        snap: &Snapshot,
        page: &PageHandle,
        hi: Option<RefKey>,
        span: &Span<'_>,
    ) -> Result<u64> {
        let refs = page.index()?.load();
        let mut deleted = 0;
        for (i, child) in refs.iter().enumerate() {
            let child_hi = refs.get(i + 1).map(|r| r.key().clone()).or_else(|| hi.clone());
            let cover = span.cover(child.key(), child_hi.as_ref());
            if cover == Cover::Disjoint {
                continue;
            }
            let disk_leaf = child.state() == RefState::Disk && child.addr().is_some_and(|a| a.is_leaf());
            if cover == Cover::Full && disk_leaf && delete::fast_delete(self, txn, child, page)? {
                deleted += 1;
                continue;
            }
            let internal = match child.state() {
                RefState::Disk => child.addr().is_some_and(|a| !a.is_leaf()),
                RefState::Resident => child.page().is_some_and(|p| !p.is_leaf()),
                _ => false,
            };
            if !internal {
                continue;
            }
            match self.page_in(child, snap, PageInFlags::default()) {
                Ok(PageIn::Page(handle)) => {
                    deleted += self.fast_delete_under(txn, snap, &handle, child_hi, span)?;
                }
                Ok(PageIn::Skip) | Err(SombraError::Restart) | Err(SombraError::Busy(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }

    fn fast_delete_span(&self, txn: &mut Txn, span: &Span<'_>) -> Result<u64> {
        let snap = txn.snapshot().clone();
        let _generation = self.splits.enter();
        let root = match self.page_in(&self.root, &snap, PageInFlags::default())? {
            PageIn::Page(handle) => handle,
            PageIn::Skip => return Ok(0),
        };
        self.fast_delete_under(txn, &snap, &root, None, span)
    }
}

impl Tree {
    pub(super) fn truncate_rows(&self, txn: &mut Txn, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<TruncateStats> {
        self.inner.check()?;
        if txn.is_prepared() {
            return Err(SombraError::Invalid("write after prepare"));
        }
        let pages_deleted = self.inner.fast_delete_span(txn, &Span::Row(lower, upper))?;
        let mut cursor = self.cursor(&txn.snapshot().clone())?;
        cursor.set_bounds(lower, upper);
        cursor.keys_only(true);
        let mut rows_removed = 0;
        while let Some((key, _)) = cursor.next()? {
            match self
                .inner
                .row_write(txn, &key, UpdateKind::Tombstone, WriteMode::Existing)
            {
                Ok(()) => rows_removed += 1,
                Err(SombraError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        info!(target: "sombra_engine::delete", pages_deleted, rows_removed, "range truncated");
        Ok(TruncateStats {
            pages_deleted,
            rows_removed,
        })
    }

    pub(super) fn truncate_records(&self, txn: &mut Txn, range: RangeInclusive<Recno>) -> Result<TruncateStats> {
        self.inner.check()?;
        if txn.is_prepared() {
            return Err(SombraError::Invalid("write after prepare"));
        }
        let (start, end) = (*range.start(), *range.end());
        if start > end {
            return Ok(TruncateStats::default());
        }
        let pages_deleted = self.inner.fast_delete_span(txn, &Span::Recno(start, end))?;
        let mut cursor = self.col_cursor(&txn.snapshot().clone())?;
        cursor.set_bounds(Bound::Included(start), Bound::Included(end));
        let mut rows_removed = 0;
        while let Some((recno, _)) = cursor.next()? {
            match self
                .inner
                .col_write(txn, recno, UpdateKind::Tombstone, WriteMode::Existing)
            {
                Ok(()) => rows_removed += 1,
                Err(SombraError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        info!(target: "sombra_engine::delete", pages_deleted, rows_removed, "records truncated");
        Ok(TruncateStats {
            pages_deleted,
            rows_removed,
        })
    }
}
