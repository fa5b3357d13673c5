//! Column-store cursor.
//!
//! Records are visited by number. Inside a leaf a record is a candidate
//! when an on-page run with a value covers it, when an update node exists
//! for it, or when it sits in the append list past the last run. Deleted
//! runs without updates are stepped over without resolving anything.

use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::page::{Page, PageHandle};
use super::reference::RefKey;
use super::tree::{col_value, PageInFlags, TreeInner};
use super::walk::{Direction, Target, Walk};
use crate::txn::Snapshot;
use crate::types::{Recno, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Pos {
    Before,
    After,
    At(Recno),
}

/// Smallest candidate record of `page` at or above `from`.
fn next_candidate(page: &Page, from: Recno) -> Result<Option<Recno>> {
    let modify = page.modify();
    let runs = page.runs();
    let start = runs.partition_point(|run| run.end() <= from);
    for (idx, run) in runs.iter().enumerate().skip(start) {
        let lo = from.max(run.recno);
        if run.value.is_some() {
            return Ok(Some(lo));
        }
        if let Some(list) = modify.and_then(|m| m.col_update(idx)) {
            if let Some(node) = list.next_of_key(&lo)?.and_then(|i| list.node(i)) {
                return Ok(Some(*node.key()));
            }
        }
    }
    let Some(list) = modify.and_then(|m| m.col_append()) else {
        return Ok(None);
    };
    Ok(list.next_of_key(&from)?.and_then(|i| list.node(i)).map(|n| *n.key()))
}

/// Largest candidate record of `page` below `before` (`None`: no limit).
fn prev_candidate(page: &Page, before: Option<Recno>) -> Result<Option<Recno>> {
    let modify = page.modify();
    if let Some(list) = modify.and_then(|m| m.col_append()) {
        let idx = match before {
            Some(before) => list.prev_of_key(&before)?,
            None => list.last()?,
        };
        if let Some(node) = idx.and_then(|i| list.node(i)) {
            if *node.key() >= page.runs_end() {
                return Ok(Some(*node.key()));
            }
        }
    }
    let runs = page.runs();
    let stop = before.map_or(runs.len(), |b| runs.partition_point(|run| run.recno < b));
    for idx in (0..stop).rev() {
        let run = &runs[idx];
        let end = before.map_or(run.end(), |b| b.min(run.end()));
        if end <= run.recno {
            continue;
        }
        if run.value.is_some() {
            return Ok(Some(end - 1));
        }
        if let Some(list) = modify.and_then(|m| m.col_update(idx)) {
            if let Some(node) = list.prev_of_key(&end)?.and_then(|i| list.node(i)) {
                if *node.key() >= run.recno {
                    return Ok(Some(*node.key()));
                }
            }
        }
    }
    Ok(None)
}

fn step_in_leaf(page: &Page, pos: Pos, dir: Direction) -> Result<Option<Recno>> {
    match (dir, pos) {
        (Direction::Next, Pos::Before) => next_candidate(page, page.recno()),
        (Direction::Next, Pos::At(r)) => match r.checked_add(1) {
            Some(from) => next_candidate(page, from),
            None => Ok(None),
        },
        (Direction::Prev, Pos::After) => prev_candidate(page, None),
        (Direction::Prev, Pos::At(r)) => prev_candidate(page, Some(r)),
        (Direction::Next, Pos::After) | (Direction::Prev, Pos::Before) => Ok(None),
    }
}

/// Inclusive record range of a pair of bounds, `None` when empty.
fn inclusive(lower: Bound<Recno>, upper: Bound<Recno>) -> Option<(Recno, Recno)> {
    let lo = match lower {
        Bound::Unbounded => 0,
        Bound::Included(r) => r,
        Bound::Excluded(r) => r.checked_add(1)?,
    };
    let hi = match upper {
        Bound::Unbounded => Recno::MAX,
        Bound::Included(r) => r,
        Bound::Excluded(r) => r.checked_sub(1)?,
    };
    (lo <= hi).then_some((lo, hi))
}

/// Cursor over a column-store tree.
pub struct ColCursor {
    tree: Arc<TreeInner>,
    snap: Snapshot,
    walk: Walk,
    leaf: Option<PageHandle>,
    pos: Pos,
    range: Option<(Recno, Recno)>,
    bounded: bool,
    skipped: usize,
}

impl ColCursor {
    pub(crate) fn new(tree: Arc<TreeInner>, snap: Snapshot) -> Self {
        Self {
            tree,
            snap,
            walk: Walk::new(PageInFlags::default()),
            leaf: None,
            pos: Pos::Before,
            range: Some((0, Recno::MAX)),
            bounded: false,
            skipped: 0,
        }
    }

    /// Restricts iteration to a record range; resets the cursor.
    pub fn set_bounds(&mut self, lower: Bound<Recno>, upper: Bound<Recno>) {
        self.range = inclusive(lower, upper);
        self.bounded = !matches!((lower, upper), (Bound::Unbounded, Bound::Unbounded));
        self.reset();
    }

    /// Releases the current position.
    pub fn reset(&mut self) {
        self.leaf = None;
        self.pos = Pos::Before;
        self.walk.reset();
        self.skipped = 0;
    }

    /// Record the cursor sits on.
    pub fn recno(&self) -> Option<Recno> {
        match (self.leaf.as_ref(), self.pos) {
            (Some(_), Pos::At(r)) => Some(r),
            _ => None,
        }
    }

    /// Next visible record.
    pub fn next(&mut self) -> Result<Option<(Recno, Bytes)>> {
        self.tree.check()?;
        if self.leaf.is_none() && !self.start(Direction::Next)? {
            return Ok(None);
        }
        self.advance(Direction::Next)
    }

    /// Previous visible record.
    pub fn prev(&mut self) -> Result<Option<(Recno, Bytes)>> {
        self.tree.check()?;
        if self.leaf.is_none() && !self.start(Direction::Prev)? {
            return Ok(None);
        }
        self.advance(Direction::Prev)
    }

    /// Positions on `recno` and returns its value when visible.
    pub fn search(&mut self, recno: Recno) -> Result<Option<Bytes>> {
        self.tree.check()?;
        self.reset();
        let target = Target::At(RefKey::Recno(recno));
        let Some(leaf) = self.walk.seek(&self.tree, &self.snap, target, Direction::Next)? else {
            return Ok(None);
        };
        match col_value(&leaf, &self.snap, recno)? {
            Some(value) => {
                self.leaf = Some(leaf);
                self.pos = Pos::At(recno);
                Ok(Some(value))
            }
            None => {
                self.reset();
                Ok(None)
            }
        }
    }

    fn start(&mut self, dir: Direction) -> Result<bool> {
        let Some((lo, hi)) = self.range else {
            return Ok(false);
        };
        let leaf = if self.bounded {
            let (at, pos) = match dir {
                Direction::Next => (lo, lo.checked_sub(1).map_or(Pos::Before, Pos::At)),
                Direction::Prev => (hi, hi.checked_add(1).map_or(Pos::After, Pos::At)),
            };
            let target = Target::At(RefKey::Recno(at));
            let leaf = self.walk.seek(&self.tree, &self.snap, target, dir)?;
            self.pos = pos;
            leaf
        } else {
            let leaf = self.walk.first(&self.tree, &self.snap, dir)?;
            self.pos = edge(dir);
            leaf
        };
        match leaf {
            Some(leaf) => {
                self.leaf = Some(leaf);
                Ok(true)
            }
            None => {
                self.reset();
                Ok(false)
            }
        }
    }

    fn advance(&mut self, dir: Direction) -> Result<Option<(Recno, Bytes)>> {
        let (lo, hi) = self.range.unwrap_or((1, 0));
        loop {
            let Some(leaf) = self.leaf.as_ref() else {
                return Ok(None);
            };
            let Some(recno) = step_in_leaf(leaf, self.pos, dir)? else {
                let next = self.walk.step(&self.tree, &self.snap, dir)?;
                self.skipped = 0;
                match next {
                    Some(leaf) => {
                        // A leaf entered from the side keeps the position
                        // so records already passed are not revisited.
                        if matches!(self.pos, Pos::Before | Pos::After) {
                            self.pos = edge(dir);
                        }
                        self.leaf = Some(leaf);
                        continue;
                    }
                    None => {
                        self.reset();
                        return Ok(None);
                    }
                }
            };
            self.pos = Pos::At(recno);
            let beyond = match dir {
                Direction::Next => recno > hi,
                Direction::Prev => recno < lo,
            };
            if beyond {
                self.reset();
                return Ok(None);
            }
            if recno < lo || recno > hi {
                continue;
            }
            match col_value(leaf, &self.snap, recno)? {
                Some(value) => return Ok(Some((recno, value))),
                None => self.note_skip(),
            }
        }
    }

    fn note_skip(&mut self) {
        self.skipped += 1;
        self.tree.stats.add_cursor_skipped(1);
        if self.skipped == self.tree.options.delete_skip_threshold {
            if let Some(leaf) = &self.leaf {
                leaf.set_evict_soon();
                trace!(target: "sombra_engine::cursor", skipped = self.skipped, "column leaf flagged for early eviction");
            }
        }
    }
}

impl Drop for ColCursor {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for ColCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColCursor")
            .field("recno", &self.recno())
            .field("range", &self.range)
            .finish()
    }
}

fn edge(dir: Direction) -> Pos {
    match dir {
        Direction::Next => Pos::Before,
        Direction::Prev => Pos::After,
    }
}
