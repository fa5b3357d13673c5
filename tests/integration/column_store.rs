#![allow(missing_docs)]

use std::ops::Bound;

use sombra_engine::types::{Recno, Result, SombraError, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeKind, TreeOptions};

fn options() -> TreeOptions {
    TreeOptions::default()
        .leaf_page_max(1024)
        .internal_page_max(1024)
        .max_inline_value(128)
}

fn scan(tree: &Tree) -> Result<Vec<(Recno, Vec<u8>)>> {
    let reader = tree.txns().begin()?;
    let mut cursor = tree.col_cursor(reader.snapshot())?;
    let mut out = Vec::new();
    while let Some((recno, value)) = cursor.next()? {
        out.push((recno, value.to_vec()));
    }
    Ok(out)
}

#[test]
fn appends_hand_out_consecutive_records() -> Result<()> {
    let tree = Tree::create_column(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 1..=50u64 {
        assert_eq!(tree.append(&mut txn, format!("r{i}").as_bytes())?, i);
    }
    txn.commit(Timestamp(1))?;
    assert_eq!(tree.last_recno(), 50);
    let rows = scan(&tree)?;
    assert_eq!(rows.len(), 50);
    assert_eq!(rows[9], (10, b"r10".to_vec()));
    Ok(())
}

#[test]
fn repeated_values_survive_reconciliation_as_runs() -> Result<()> {
    let env = TreeEnv::in_memory();
    let tree = Tree::create_column(env.clone(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 0..3_000u64 {
        let value: &[u8] = if i % 1_000 < 990 { b"same" } else { b"different" };
        tree.append(&mut txn, value)?;
    }
    txn.commit(Timestamp(1))?;
    let root = tree.checkpoint()?;
    tree.evict_pass()?;

    let reopened = Tree::open(env, TreeKind::Column, options(), root)?;
    assert_eq!(reopened.last_recno(), 3_000);
    let reader = reopened.txns().begin()?;
    assert_eq!(reopened.get_recno(reader.snapshot(), 1)?.as_deref(), Some(&b"same"[..]));
    assert_eq!(reopened.get_recno(reader.snapshot(), 991)?.as_deref(), Some(&b"different"[..]));
    assert_eq!(reopened.get_recno(reader.snapshot(), 3_000)?.as_deref(), Some(&b"different"[..]));
    assert_eq!(reopened.get_recno(reader.snapshot(), 3_001)?, None);
    assert_eq!(scan(&reopened)?.len(), 3_000);
    Ok(())
}

#[test]
fn updating_inside_a_run_splits_it() -> Result<()> {
    let tree = Tree::create_column(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for _ in 0..100 {
        tree.append(&mut txn, b"fill")?;
    }
    txn.commit(Timestamp(1))?;
    tree.evict_pass()?;

    let mut txn = tree.txns().begin()?;
    tree.put_recno(&mut txn, 40, b"patched")?;
    tree.remove_recno(&mut txn, 41)?;
    txn.commit(Timestamp(2))?;
    tree.evict_pass()?;

    let rows = scan(&tree)?;
    assert_eq!(rows.len(), 99);
    assert_eq!(rows[38], (39, b"fill".to_vec()));
    assert_eq!(rows[39], (40, b"patched".to_vec()));
    assert_eq!(rows[40], (42, b"fill".to_vec()));

    let mut txn = tree.txns().begin()?;
    assert!(matches!(tree.remove_recno(&mut txn, 41), Err(SombraError::NotFound)));
    Ok(())
}

#[test]
fn writing_past_the_end_leaves_a_gap() -> Result<()> {
    let tree = Tree::create_column(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    tree.append(&mut txn, b"one")?;
    tree.put_recno(&mut txn, 10, b"ten")?;
    assert_eq!(tree.append(&mut txn, b"eleven")?, 11);
    txn.commit(Timestamp(1))?;
    tree.checkpoint()?;
    tree.evict_pass()?;

    let rows = scan(&tree)?;
    let recnos: Vec<Recno> = rows.iter().map(|(r, _)| *r).collect();
    assert_eq!(recnos, vec![1, 10, 11]);
    Ok(())
}

#[test]
fn column_cursor_moves_both_ways_within_bounds() -> Result<()> {
    let tree = Tree::create_column(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 1..=400u64 {
        tree.append(&mut txn, &i.to_be_bytes())?;
    }
    txn.commit(Timestamp(1))?;
    tree.evict_pass()?;

    let reader = tree.txns().begin()?;
    let mut cursor = tree.col_cursor(reader.snapshot())?;
    cursor.set_bounds(Bound::Included(100), Bound::Excluded(300));
    let mut forward = Vec::new();
    while let Some((recno, _)) = cursor.next()? {
        forward.push(recno);
    }
    assert_eq!(forward, (100..300).collect::<Vec<_>>());

    cursor.reset();
    let mut backward = Vec::new();
    while let Some((recno, _)) = cursor.prev()? {
        backward.push(recno);
    }
    assert_eq!(backward, (100..300).rev().collect::<Vec<_>>());

    assert_eq!(cursor.search(250)?.as_deref(), Some(&250u64.to_be_bytes()[..]));
    assert_eq!(cursor.recno(), Some(250));
    assert_eq!(cursor.next()?.map(|(r, _)| r), Some(251));
    Ok(())
}

#[test]
fn truncating_records_removes_a_range() -> Result<()> {
    let tree = Tree::create_column(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 0..2_000u64 {
        tree.append(&mut txn, format!("value-{i}").as_bytes())?;
    }
    txn.commit(Timestamp(1))?;
    tree.evict_pass()?;

    let mut txn = tree.txns().begin()?;
    let stats = tree.truncate_recno(&mut txn, 101..=1_900)?;
    assert!(stats.pages_deleted + stats.rows_removed > 0);
    txn.commit(Timestamp(2))?;

    let rows = scan(&tree)?;
    assert_eq!(rows.len(), 200);
    assert_eq!(rows[99].0, 100);
    assert_eq!(rows[100].0, 1_901);
    Ok(())
}

#[test]
fn bulk_loaded_column_tree_reads_back() -> Result<()> {
    let tree = Tree::create_column(TreeEnv::in_memory(), options())?;
    let mut loader = tree.bulk_loader()?;
    for i in 0..5_000u64 {
        loader.append(if i < 4_000 { b"cold" } else { b"warm" })?;
    }
    assert_eq!(loader.finish()?, 5_000);
    assert_eq!(tree.last_recno(), 5_000);

    let mut txn = tree.txns().begin()?;
    assert_eq!(tree.append(&mut txn, b"hot")?, 5_001);
    txn.commit(Timestamp(1))?;
    let rows = scan(&tree)?;
    assert_eq!(rows.len(), 5_001);
    assert_eq!(rows[3_999].1, b"cold");
    assert_eq!(rows[4_000].1, b"warm");
    assert_eq!(rows[5_000].1, b"hot");
    Ok(())
}
