#![allow(missing_docs)]

use std::ops::Bound;

use sombra_engine::types::{Result, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeOptions};

fn options() -> TreeOptions {
    TreeOptions::default()
        .leaf_page_max(1024)
        .internal_page_max(512)
        .max_inline_value(256)
}

fn key(i: u32) -> Vec<u8> {
    format!("row{i:06}").into_bytes()
}

fn loaded(count: u32) -> Result<Tree> {
    let tree = Tree::create_row(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 0..count {
        tree.put(&mut txn, &key(i), &i.to_le_bytes())?;
    }
    txn.commit(Timestamp(1))?;
    Ok(tree)
}

fn forward(tree: &Tree) -> Result<Vec<Vec<u8>>> {
    let reader = tree.txns().begin()?;
    let mut cursor = tree.cursor(reader.snapshot())?;
    let mut keys = Vec::new();
    while let Some((k, _)) = cursor.next()? {
        keys.push(k.to_vec());
    }
    Ok(keys)
}

fn backward(tree: &Tree) -> Result<Vec<Vec<u8>>> {
    let reader = tree.txns().begin()?;
    let mut cursor = tree.cursor(reader.snapshot())?;
    let mut keys = Vec::new();
    while let Some((k, _)) = cursor.prev()? {
        keys.push(k.to_vec());
    }
    Ok(keys)
}

#[test]
fn traversal_crosses_leaf_boundaries_both_ways() -> Result<()> {
    let tree = loaded(1_500)?;
    tree.evict_pass()?;
    assert!(tree.stats().splits > 0, "the loaded leaf split on eviction");

    let expected: Vec<Vec<u8>> = (0..1_500).map(key).collect();
    assert_eq!(forward(&tree)?, expected);
    let mut reversed = expected.clone();
    reversed.reverse();
    assert_eq!(backward(&tree)?, reversed);
    Ok(())
}

#[test]
fn inserts_between_image_rows_are_merged_in_order() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in (0..400).step_by(2) {
        tree.put(&mut txn, &key(i), b"even")?;
    }
    txn.commit(Timestamp(1))?;
    tree.evict_pass()?;

    let mut txn = tree.txns().begin()?;
    for i in (1..400).step_by(2) {
        tree.put(&mut txn, &key(i), b"odd")?;
    }
    txn.commit(Timestamp(2))?;

    assert_eq!(forward(&tree)?, (0..400).map(key).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn bounded_cursor_stops_at_the_bounds() -> Result<()> {
    let tree = loaded(800)?;
    tree.evict_pass()?;
    let reader = tree.txns().begin()?;
    let mut cursor = tree.cursor(reader.snapshot())?;
    let lower = key(100);
    let upper = key(600);
    cursor.set_bounds(Bound::Excluded(lower.as_slice()), Bound::Excluded(upper.as_slice()));
    let mut count = 0;
    let mut first = None;
    let mut last = None;
    while let Some((k, _)) = cursor.next()? {
        first.get_or_insert_with(|| k.to_vec());
        last = Some(k.to_vec());
        count += 1;
    }
    assert_eq!(count, 499);
    assert_eq!(first, Some(key(101)));
    assert_eq!(last, Some(key(599)));
    Ok(())
}

#[test]
fn deleted_rows_are_skipped() -> Result<()> {
    let tree = loaded(300)?;
    tree.evict_pass()?;
    let mut txn = tree.txns().begin()?;
    for i in (0..300).filter(|i| i % 3 == 0) {
        tree.remove(&mut txn, &key(i))?;
    }
    txn.commit(Timestamp(2))?;

    let expected: Vec<Vec<u8>> = (0..300).filter(|i| i % 3 != 0).map(key).collect();
    assert_eq!(forward(&tree)?, expected);
    assert!(tree.stats().cursor_skipped > 0);
    Ok(())
}

#[test]
fn keys_only_cursor_still_reports_keys() -> Result<()> {
    let tree = loaded(50)?;
    let reader = tree.txns().begin()?;
    let mut cursor = tree.cursor(reader.snapshot())?;
    cursor.keys_only(true);
    let mut seen = 0;
    while let Some((k, _)) = cursor.next()? {
        assert_eq!(k.as_ref(), key(seen).as_slice());
        seen += 1;
    }
    assert_eq!(seen, 50);
    Ok(())
}
