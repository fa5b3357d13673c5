//! Choosing which version of a value a reader sees or a page image stores.

use std::sync::Arc;

use bytes::Bytes;

use super::update::{apply_modify, ModifyEntry, PrepareState, Update, UpdateKind};
use crate::txn::{GlobalVisibility, Visibility};
use crate::types::{Result, SombraError, TimePoint, TimeWindow};

/// What the selection is for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SelectMode {
    /// A cursor or point read.
    Read,
    /// Checkpoint reconciliation; the page stays in memory.
    Checkpoint,
    /// Eviction reconciliation; unstable chains must be saved somewhere.
    Evict {
        /// The page may be rebuilt from its image plus saved chains.
        restore: bool,
        /// Saved chains may be parked in the lookaside table.
        lookaside: bool,
    },
    /// Every update must be visible; anything else is a fatal inconsistency.
    Strict,
}

/// Inputs of a selection.
pub struct SelectCtx<'a> {
    /// Snapshot of the reader (or of the reconciliation).
    pub snap: &'a dyn Visibility,
    /// Global visibility horizon.
    pub global: &'a GlobalVisibility,
    /// Purpose.
    pub mode: SelectMode,
}

/// The on-page cell of a key, when one exists.
#[derive(Copy, Clone, Debug)]
pub struct OnDisk<'a> {
    /// Value, `None` for a deleted column run.
    pub value: Option<&'a Bytes>,
    /// Validity window of the cell.
    pub tw: TimeWindow,
}

/// Selected version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Selected {
    /// No version exists.
    None,
    /// The on-page value.
    OnDisk,
    /// A value from the update chain (modify deltas applied).
    Value(Bytes),
    /// The key is deleted.
    Deleted,
}

/// Result of a selection.
#[derive(Clone, Debug)]
pub struct Selection {
    /// Chosen version.
    pub value: Selected,
    /// Validity window of the chosen version.
    pub tw: TimeWindow,
    /// Every non-aborted update was visible and nothing remains to write later.
    pub stable: bool,
    /// The chain must survive eviction.
    pub save: bool,
    /// Some reader may still need a version older than the chosen one.
    pub history: bool,
    /// A prepared, unresolved update was skipped.
    pub prepared: bool,
    /// The update the chosen version came from.
    pub onpage: Option<Arc<Update>>,
}

impl Selection {
    fn nothing() -> Self {
        Self {
            value: Selected::None,
            tw: TimeWindow::default(),
            stable: true,
            save: false,
            history: false,
            prepared: false,
            onpage: None,
        }
    }

    /// Value bytes when the selection produced one.
    pub fn bytes<'a>(&'a self, on_disk: Option<&OnDisk<'a>>) -> Option<&'a Bytes> {
        match &self.value {
            Selected::Value(value) => Some(value),
            Selected::OnDisk => on_disk.and_then(|d| d.value),
            Selected::None | Selected::Deleted => None,
        }
    }
}

/// Materialises the value of a modify chain: `deltas` (newest first) are
/// applied on top of the first complete value found in `older`.
fn materialize<'a>(
    deltas: &[&'a [ModifyEntry]],
    older: impl Iterator<Item = &'a Arc<Update>>,
    on_disk: Option<&OnDisk<'_>>,
) -> Bytes {
    let mut base: Option<Bytes> = None;
    for upd in older.filter(|u| !u.is_aborted()) {
        match upd.kind() {
            UpdateKind::Standard(value) => {
                base = Some(value.clone());
                break;
            }
            UpdateKind::Tombstone => {
                base = Some(Bytes::new());
                break;
            }
            UpdateKind::Birthmark => break,
            UpdateKind::Modify(_) => {}
        }
    }
    // Deltas stacked between the chosen update and the base are applied too.
    let base = base.unwrap_or_else(|| on_disk.and_then(|d| d.value.cloned()).unwrap_or_default());
    let ordered: Vec<&[ModifyEntry]> = deltas.iter().rev().copied().collect();
    apply_modify(&base, &ordered)
}

/// Collects every modify delta from `start` down to the first complete value.
fn delta_run<'a>(chain: &[&'a Arc<Update>], start: usize) -> (Vec<&'a [ModifyEntry]>, usize) {
    let mut deltas = Vec::new();
    let mut idx = start;
    while let Some(&upd) = chain.get(idx) {
        if upd.is_aborted() {
            idx += 1;
            continue;
        }
        match upd.kind() {
            UpdateKind::Modify(entries) => {
                deltas.push(entries.as_slice());
                idx += 1;
            }
            _ => break,
        }
    }
    (deltas, idx)
}

fn resolve_value(
    chain: &[&Arc<Update>],
    idx: usize,
    on_disk: Option<&OnDisk<'_>>,
) -> (Selected, TimePoint) {
    let upd = chain[idx];
    match upd.kind() {
        UpdateKind::Standard(value) => (Selected::Value(value.clone()), upd.start()),
        UpdateKind::Birthmark => (Selected::OnDisk, upd.start()),
        UpdateKind::Tombstone => (Selected::Deleted, upd.start()),
        UpdateKind::Modify(_) => {
            let (deltas, rest) = delta_run(chain, idx);
            let value = materialize(&deltas, chain[rest.min(chain.len())..].iter().copied(), on_disk);
            (Selected::Value(value), upd.start())
        }
    }
}

/// Selects the version of a key for `ctx`.
///
/// `chain` yields updates newest first (aborted ones included).
pub fn select<'a>(
    chain: impl Iterator<Item = &'a Arc<Update>>,
    on_disk: Option<OnDisk<'_>>,
    ctx: &SelectCtx<'_>,
) -> Result<Selection> {
    let chain: Vec<&Arc<Update>> = chain.collect();
    match ctx.mode {
        SelectMode::Read => select_read(&chain, on_disk, ctx),
        _ => select_reconcile(&chain, on_disk, ctx),
    }
}

fn select_read(
    chain: &[&Arc<Update>],
    on_disk: Option<OnDisk<'_>>,
    ctx: &SelectCtx<'_>,
) -> Result<Selection> {
    let snap = ctx.snap;
    let mut sel = Selection::nothing();
    let mut read_stop: Option<TimePoint> = None;
    for (idx, upd) in chain.iter().enumerate() {
        if upd.is_aborted() {
            continue;
        }
        let txn = upd.txn();
        if upd.prepare_state() == PrepareState::InProgress && !snap.visible_id(txn) {
            sel.prepared = true;
            let read_ts = snap.read_ts();
            if !read_ts.is_none() && upd.start_ts() <= read_ts {
                return Err(SombraError::PrepareConflict);
            }
            continue;
        }
        if !snap.visible(txn, upd.start_ts()) {
            if snap.visible_id(txn) {
                read_stop = Some(upd.start());
            }
            continue;
        }
        let (value, start) = resolve_value(chain, idx, on_disk.as_ref());
        sel.onpage = Some(Arc::clone(upd));
        match value {
            Selected::Deleted => {
                sel.value = Selected::Deleted;
                sel.tw = TimeWindow {
                    start,
                    stop: start,
                    prepare: false,
                };
            }
            Selected::OnDisk => {
                sel.value = match on_disk.as_ref().and_then(|d| d.value) {
                    Some(_) => Selected::OnDisk,
                    None => Selected::Deleted,
                };
                sel.tw = TimeWindow::starting_at(start);
            }
            other => {
                sel.value = other;
                sel.tw = TimeWindow::starting_at(start);
            }
        }
        if let Some(stop) = read_stop {
            sel.tw.stop = stop;
        }
        return Ok(sel);
    }

    let Some(disk) = on_disk else {
        return Ok(sel);
    };
    let tw = disk.tw;
    let start_visible = snap.visible(tw.start.txn, tw.start.ts);
    let stop_visible = tw.has_stop() && snap.visible(tw.stop.txn, tw.stop.ts);
    sel.value = if disk.value.is_none() || !start_visible || stop_visible {
        Selected::Deleted
    } else {
        Selected::OnDisk
    };
    sel.tw = tw;
    if let Some(stop) = read_stop {
        sel.tw.stop = stop;
    }
    Ok(sel)
}

fn select_reconcile(
    chain: &[&Arc<Update>],
    on_disk: Option<OnDisk<'_>>,
    ctx: &SelectCtx<'_>,
) -> Result<Selection> {
    let strict = ctx.mode == SelectMode::Strict;
    let mut sel = Selection::nothing();
    let mut stop: Option<TimePoint> = None;
    let mut stop_upd: Option<Arc<Update>> = None;
    let mut found: Option<(Selected, TimePoint, Arc<Update>)> = None;
    let mut any_update = false;

    for (idx, upd) in chain.iter().enumerate() {
        if upd.is_aborted() {
            continue;
        }
        any_update = true;
        let txn = upd.txn();
        let ts = upd.start_ts();
        if upd.prepare_state() == PrepareState::InProgress {
            if strict {
                return Err(SombraError::Visibility("prepared update during strict reconcile"));
            }
            sel.prepared = true;
            sel.stable = false;
            continue;
        }
        if !ctx.snap.visible(txn, ts) {
            if strict {
                return Err(SombraError::Visibility("invisible update during strict reconcile"));
            }
            sel.stable = false;
            continue;
        }
        if upd.is_tombstone() {
            // An older tombstone is the real end of the value below it.
            stop = Some(upd.start());
            stop_upd = Some(Arc::clone(upd));
            continue;
        }
        let (value, start) = resolve_value(chain, idx, on_disk.as_ref());
        found = Some((value, start, Arc::clone(upd)));
        break;
    }

    let mut tw = TimeWindow::default();
    match found {
        Some((Selected::OnDisk, start, upd)) => {
            tw.start = start;
            sel.value = match on_disk.as_ref().and_then(|d| d.value) {
                Some(_) => Selected::OnDisk,
                None => Selected::Deleted,
            };
            sel.onpage = Some(upd);
        }
        Some((value, start, upd)) => {
            tw.start = start;
            sel.value = value;
            sel.onpage = Some(upd);
        }
        None => match on_disk.as_ref() {
            Some(disk) if disk.value.is_some() => {
                tw = disk.tw;
                sel.value = Selected::OnDisk;
            }
            _ => {
                sel.value = if stop.is_some() || on_disk.is_some() {
                    Selected::Deleted
                } else {
                    Selected::None
                };
            }
        },
    }
    if let Some(stop) = stop {
        tw.stop = stop;
        if sel.onpage.is_none() {
            sel.onpage = stop_upd;
        }
    }
    sel.tw = tw;

    if matches!(sel.value, Selected::Value(_) | Selected::OnDisk)
        && tw.has_stop()
        && ctx.global.visible(tw.stop.txn, tw.stop.ts)
    {
        sel.value = Selected::Deleted;
    }

    sel.history = any_update
        && match &sel.value {
            Selected::None => false,
            Selected::Deleted => !tw.has_stop() || !ctx.global.visible(tw.stop.txn, tw.stop.ts),
            Selected::OnDisk | Selected::Value(_) => !ctx.global.visible(tw.start.txn, tw.start.ts),
        };
    if let SelectMode::Evict { restore, lookaside } = ctx.mode {
        sel.save = !sel.stable || sel.history;
        if sel.save && !restore && !lookaside {
            return Err(SombraError::Busy("update save not permitted"));
        }
    }
    Ok(sel)
}

/// Refuses a write whose target is not visible to the writer.
///
/// `newest` is the newest non-aborted update of the chain; when the chain is
/// empty the on-page window decides.
pub fn write_check(
    snap: &dyn Visibility,
    newest: Option<&Arc<Update>>,
    on_disk: Option<&TimeWindow>,
) -> Result<()> {
    match newest {
        Some(upd) => {
            if upd.prepare_state() == PrepareState::InProgress && !snap.visible_id(upd.txn()) {
                return Err(SombraError::WriteConflict);
            }
            if !snap.visible_id(upd.txn()) {
                return Err(SombraError::WriteConflict);
            }
            Ok(())
        }
        None => match on_disk {
            Some(tw) if !snap.visible_id(tw.start.txn) => Err(SombraError::WriteConflict),
            Some(tw) if tw.has_stop() && !snap.visible_id(tw.stop.txn) => {
                Err(SombraError::WriteConflict)
            }
            _ => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Snapshot;
    use crate::types::{Timestamp, TxnId};

    fn committed(txn: u64, ts: u64, kind: UpdateKind) -> Arc<Update> {
        Update::committed(TimePoint::new(TxnId(txn), Timestamp(ts)), kind)
    }

    fn value(v: &'static str) -> UpdateKind {
        UpdateKind::Standard(Bytes::from_static(v.as_bytes()))
    }

    fn reader(read_ts: u64) -> Snapshot {
        Snapshot::new(TxnId(100), TxnId(100), TxnId(100), Vec::new(), Timestamp(read_ts))
    }

    fn global_all() -> GlobalVisibility {
        GlobalVisibility {
            oldest_id: TxnId(100),
            pinned_ts: Timestamp::MAX,
        }
    }

    fn ctx<'a>(snap: &'a dyn Visibility, global: &'a GlobalVisibility, mode: SelectMode) -> SelectCtx<'a> {
        SelectCtx { snap, global, mode }
    }

    #[test]
    fn read_picks_version_at_timestamp_with_stop() -> Result<()> {
        let chain = [
            committed(3, 30, value("v3")),
            committed(2, 20, value("v2")),
            committed(1, 10, value("v1")),
        ];
        let snap = reader(20);
        let global = global_all();
        let sel = select(chain.iter(), None, &ctx(&snap, &global, SelectMode::Read))?;
        assert_eq!(sel.value, Selected::Value(Bytes::from_static(b"v2")));
        assert_eq!(sel.tw.start.ts, Timestamp(20));
        assert_eq!(sel.tw.stop.ts, Timestamp(30));
        Ok(())
    }

    #[test]
    fn read_skips_aborted_and_falls_back_to_disk() -> Result<()> {
        let aborted = Update::new(TxnId(5), value("gone"));
        aborted.abort();
        let chain = [aborted];
        let disk_value = Bytes::from_static(b"disk");
        let on_disk = OnDisk {
            value: Some(&disk_value),
            tw: TimeWindow::default(),
        };
        let snap = reader(0);
        let global = global_all();
        let sel = select(chain.iter(), Some(on_disk), &ctx(&snap, &global, SelectMode::Read))?;
        assert_eq!(sel.value, Selected::OnDisk);
        assert_eq!(sel.bytes(Some(&on_disk)).map(|b| &b[..]), Some(&b"disk"[..]));
        Ok(())
    }

    #[test]
    fn read_reports_prepare_conflict_only_at_covering_timestamp() {
        let prepared = Update::new(TxnId(150), value("p"));
        prepared.stamp_prepare(Timestamp(40));
        let chain = [prepared];
        let global = global_all();
        let early = reader(30);
        let sel = select(chain.iter(), None, &ctx(&early, &global, SelectMode::Read)).unwrap();
        assert_eq!(sel.value, Selected::None);
        assert!(sel.prepared);
        let late = reader(45);
        let err = select(chain.iter(), None, &ctx(&late, &global, SelectMode::Read)).unwrap_err();
        assert!(matches!(err, SombraError::PrepareConflict));
    }

    #[test]
    fn modify_chain_materializes_against_base() -> Result<()> {
        let chain = [
            committed(
                3,
                0,
                UpdateKind::Modify(vec![ModifyEntry {
                    offset: 5,
                    size: 1,
                    data: Bytes::from_static(b"!"),
                }]),
            ),
            committed(
                2,
                0,
                UpdateKind::Modify(vec![ModifyEntry {
                    offset: 0,
                    size: 1,
                    data: Bytes::from_static(b"J"),
                }]),
            ),
            committed(1, 0, value("hello?")),
        ];
        let snap = reader(0);
        let global = global_all();
        let sel = select(chain.iter(), None, &ctx(&snap, &global, SelectMode::Read))?;
        assert_eq!(sel.value, Selected::Value(Bytes::from_static(b"Jello!")));
        Ok(())
    }

    #[test]
    fn reconcile_uses_tombstone_as_stop() -> Result<()> {
        let chain = [
            committed(4, 40, UpdateKind::Tombstone),
            committed(3, 30, value("v3")),
        ];
        let snap = reader(0);
        let global = GlobalVisibility {
            oldest_id: TxnId(4),
            pinned_ts: Timestamp::MAX,
        };
        let sel = select(chain.iter(), None, &ctx(&snap, &global, SelectMode::Checkpoint))?;
        assert_eq!(sel.value, Selected::Value(Bytes::from_static(b"v3")));
        assert_eq!(sel.tw.start.ts, Timestamp(30));
        assert_eq!(sel.tw.stop.ts, Timestamp(40));
        assert!(sel.stable);

        // Once the tombstone is visible to everyone the row disappears.
        let everyone = global_all();
        let sel = select(chain.iter(), None, &ctx(&snap, &everyone, SelectMode::Checkpoint))?;
        assert_eq!(sel.value, Selected::Deleted);
        Ok(())
    }

    #[test]
    fn eviction_requires_somewhere_to_save_unstable_chains() {
        let running = Update::new(TxnId(150), value("new"));
        let chain = [running, committed(1, 10, value("old"))];
        let snap = reader(0);
        let global = global_all();
        let err = select(
            chain.iter(),
            None,
            &ctx(
                &snap,
                &global,
                SelectMode::Evict {
                    restore: false,
                    lookaside: false,
                },
            ),
        )
        .unwrap_err();
        assert!(matches!(err, SombraError::Busy(_)));

        let sel = select(
            chain.iter(),
            None,
            &ctx(
                &snap,
                &global,
                SelectMode::Evict {
                    restore: true,
                    lookaside: false,
                },
            ),
        )
        .unwrap();
        assert!(sel.save);
        assert!(!sel.stable);
        assert_eq!(sel.value, Selected::Value(Bytes::from_static(b"old")));

        let err = select(chain.iter(), None, &ctx(&snap, &global, SelectMode::Strict)).unwrap_err();
        assert!(matches!(err, SombraError::Visibility(_)));
    }

    #[test]
    fn write_check_detects_invisible_head() {
        let snap = Snapshot::new(TxnId(10), TxnId(8), TxnId(10), vec![TxnId(8)], Timestamp::NONE);
        let concurrent = Update::new(TxnId(8), value("x"));
        assert!(matches!(
            write_check(&snap, Some(&concurrent), None),
            Err(SombraError::WriteConflict)
        ));
        let old = committed(3, 0, value("y"));
        assert!(write_check(&snap, Some(&old), None).is_ok());
        let disk_tw = TimeWindow::starting_at(TimePoint::new(TxnId(12), Timestamp::NONE));
        assert!(write_check(&snap, None, Some(&disk_tw)).is_err());
    }
}
