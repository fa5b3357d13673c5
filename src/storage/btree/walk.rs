//! Leaf-to-leaf tree walk.
//!
//! The walk keeps one frame per internal level: the hazard-protected page,
//! the child array it loaded and the index of the child it descended into.
//! Holding the internal pages keeps them from being evicted, so only the
//! children can change underneath. A child replaced by a split is found
//! again by re-descending from the root towards the key range the walk was
//! about to enter.

use std::sync::Arc;

use tracing::trace;

use super::page::PageHandle;
use super::reconcile::stop_visible;
use super::reference::{PageRef, RefKey, RefState};
use super::tree::{PageIn, PageInFlags, TreeInner};
use crate::txn::Visibility;
use crate::types::{Result, SombraError};

/// Walk direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Towards larger keys.
    Next,
    /// Towards smaller keys.
    Prev,
}

impl Direction {
    fn edge(self, len: usize) -> usize {
        match self {
            Direction::Next => 0,
            Direction::Prev => len.saturating_sub(1),
        }
    }
}

/// Where a descent heads.
#[derive(Clone, Debug)]
pub(crate) enum Target {
    /// The child whose range holds this key.
    At(RefKey),
    /// The last child starting below this key (`None`: the last child).
    Before(Option<RefKey>),
}

impl Target {
    fn index(&self, refs: &[Arc<PageRef>]) -> usize {
        match self {
            Target::At(key) => refs.partition_point(|r| r.key() <= key).saturating_sub(1),
            Target::Before(Some(key)) => refs.partition_point(|r| r.key() < key).saturating_sub(1),
            Target::Before(None) => refs.len().saturating_sub(1),
        }
    }
}

struct Frame {
    /// Held so the page cannot be evicted under the walk.
    _page: PageHandle,
    refs: Arc<Vec<Arc<PageRef>>>,
    idx: usize,
    hi: Option<RefKey>,
}

impl Frame {
    fn child_hi(&self) -> Option<RefKey> {
        self.refs
            .get(self.idx + 1)
            .map(|r| r.key().clone())
            .or_else(|| self.hi.clone())
    }
}

/// Position of a walk between leaves.
pub(crate) struct Walk {
    frames: Vec<Frame>,
    flags: PageInFlags,
}

impl Walk {
    pub(crate) fn new(flags: PageInFlags) -> Self {
        Self {
            frames: Vec::new(),
            flags,
        }
    }

    /// Forgets the position and releases every held page.
    pub(crate) fn reset(&mut self) {
        self.frames.clear();
    }

    /// Leaf at the `dir` edge of the tree.
    pub(crate) fn first(
        &mut self,
        tree: &TreeInner,
        snap: &dyn Visibility,
        dir: Direction,
    ) -> Result<Option<PageHandle>> {
        self.root_frame(tree, snap, None, dir)?;
        match self.descend(tree, snap, dir, None)? {
            Some(leaf) => Ok(Some(leaf)),
            None => self.step(tree, snap, dir),
        }
    }

    /// Leaf `target` leads to; when it holds nothing visible, the next leaf
    /// in `dir`.
    pub(crate) fn seek(
        &mut self,
        tree: &TreeInner,
        snap: &dyn Visibility,
        target: Target,
        dir: Direction,
    ) -> Result<Option<PageHandle>> {
        self.root_frame(tree, snap, Some(&target), dir)?;
        match self.descend(tree, snap, dir, Some(target))? {
            Some(leaf) => Ok(Some(leaf)),
            None => self.step(tree, snap, dir),
        }
    }

    /// Leaf after the current one in `dir`; `None` at the end of the tree.
    pub(crate) fn step(
        &mut self,
        tree: &TreeInner,
        snap: &dyn Visibility,
        dir: Direction,
    ) -> Result<Option<PageHandle>> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(None);
            };
            let next = match dir {
                Direction::Next => Some(frame.idx + 1).filter(|&i| i < frame.refs.len()),
                Direction::Prev => frame.idx.checked_sub(1),
            };
            match next {
                None => {
                    self.frames.pop();
                }
                Some(idx) => {
                    frame.idx = idx;
                    if let Some(leaf) = self.descend(tree, snap, dir, None)? {
                        return Ok(Some(leaf));
                    }
                }
            }
        }
    }

    fn root_frame(
        &mut self,
        tree: &TreeInner,
        snap: &dyn Visibility,
        target: Option<&Target>,
        dir: Direction,
    ) -> Result<()> {
        self.frames.clear();
        let page = match tree.page_in(&tree.root, snap, PageInFlags::default())? {
            PageIn::Page(handle) => handle,
            PageIn::Skip => return Err(SombraError::Corruption("root reference skipped")),
        };
        let refs = page.index()?.load();
        if refs.is_empty() {
            return Err(SombraError::Corruption("internal page without children"));
        }
        let idx = match target {
            Some(target) => target.index(&refs),
            None => dir.edge(refs.len()),
        };
        self.frames.push(Frame {
            _page: page,
            refs,
            idx,
            hi: None,
        });
        Ok(())
    }

    /// A disk child whose every value was deleted for every reader.
    fn skip_unread(tree: &TreeInner, child: &PageRef) -> bool {
        if child.state() != RefState::Disk {
            return false;
        }
        match child.addr() {
            Some(addr) => {
                stop_visible(&tree.txns.global(), &addr)
                    && !tree.lookaside.lock().contains_key(&addr.block.offset)
            }
            None => false,
        }
    }

    /// Enters the child the top frame points at and goes down to a leaf.
    ///
    /// Internal levels pick their child by `target`, or by the `dir` edge.
    /// `None` means the child holds nothing visible.
    fn descend(
        &mut self,
        tree: &TreeInner,
        snap: &dyn Visibility,
        dir: Direction,
        mut target: Option<Target>,
    ) -> Result<Option<PageHandle>> {
        loop {
            let frame = self
                .frames
                .last()
                .ok_or(SombraError::Corruption("walk without frames"))?;
            let child = frame
                .refs
                .get(frame.idx)
                .cloned()
                .ok_or(SombraError::Corruption("walk index out of range"))?;
            let child_hi = frame.child_hi();
            if Self::skip_unread(tree, &child) {
                return Ok(None);
            }
            match tree.page_in(&child, snap, self.flags) {
                Ok(PageIn::Skip) => return Ok(None),
                Ok(PageIn::Page(handle)) => {
                    if handle.is_leaf() {
                        return Ok(Some(handle));
                    }
                    let refs = handle.index()?.load();
                    if refs.is_empty() {
                        return Err(SombraError::Corruption("internal page without children"));
                    }
                    let idx = match &target {
                        Some(target) => target.index(&refs),
                        None => dir.edge(refs.len()),
                    };
                    self.frames.push(Frame {
                        _page: handle,
                        refs,
                        idx,
                        hi: child_hi,
                    });
                }
                Err(SombraError::Restart) => {
                    let again = match dir {
                        Direction::Next => Target::At(child.key().clone()),
                        Direction::Prev => Target::Before(child_hi),
                    };
                    trace!(target: "sombra_engine::cursor", key = ?child.key(), "walk restarted after split");
                    self.root_frame(tree, snap, Some(&again), dir)?;
                    target = Some(again);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
