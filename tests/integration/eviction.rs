#![allow(missing_docs)]

use std::sync::{Arc, Barrier, Once};
use std::thread;

use sombra_engine::storage::CacheStats;
use sombra_engine::types::{Result, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeOptions};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_engine::evict=debug,sombra_engine::reconcile=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn options() -> TreeOptions {
    TreeOptions::default()
        .leaf_page_max(2048)
        .max_inline_value(256)
}

fn key(i: u32) -> Vec<u8> {
    format!("item-{i:06}").into_bytes()
}

fn fill(tree: &Tree, rows: u32, ts: u64) -> Result<()> {
    let mut txn = tree.txns().begin()?;
    for i in 0..rows {
        tree.put(&mut txn, &key(i), format!("v{ts}-{i}").as_bytes())?;
    }
    txn.commit(Timestamp(ts))
}

#[test]
fn clean_pages_leave_memory() -> Result<()> {
    let cache = Arc::new(CacheStats::default());
    let tree = Tree::create_row(TreeEnv::in_memory().with_cache(cache.clone()), options())?;
    fill(&tree, 1_000, 1)?;
    tree.txns().set_oldest_timestamp(Timestamp(1))?;
    tree.checkpoint()?;
    let resident = cache.resident_pages();

    let evicted = tree.evict_pass()?;
    assert!(evicted > 0);
    assert!(cache.resident_pages() < resident, "{} >= {resident}", cache.resident_pages());
    assert_eq!(tree.stats().pages_evicted, evicted as u64);

    // Reading brings pages back.
    let reader = tree.txns().begin()?;
    assert!(tree.get(reader.snapshot(), &key(10))?.is_some());
    assert!(tree.stats().pages_read > 0);
    Ok(())
}

#[test]
fn running_updates_are_restored_after_eviction() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), options())?;
    fill(&tree, 200, 1)?;
    let mut running = tree.txns().begin()?;
    tree.put(&mut running, &key(7), b"uncommitted")?;

    tree.evict_pass()?;
    assert!(tree.stats().saved_updates > 0, "the running update was saved");

    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), &key(7))?.as_deref(), Some(&b"v1-7"[..]));
    assert_eq!(tree.get(running.snapshot(), &key(7))?.as_deref(), Some(&b"uncommitted"[..]));
    running.commit(Timestamp(2))?;

    let after = tree.txns().begin()?;
    assert_eq!(tree.get(after.snapshot(), &key(7))?.as_deref(), Some(&b"uncommitted"[..]));
    Ok(())
}

#[test]
fn lookaside_parks_chains_until_the_page_is_read() -> Result<()> {
    init_tracing();
    let tree = Tree::create_row(TreeEnv::in_memory(), options().update_restore(false).lookaside(true))?;
    fill(&tree, 200, 1)?;
    let mut running = tree.txns().begin()?;
    tree.put(&mut running, &key(3), b"parked")?;

    let evicted = tree.evict_pass()?;
    assert!(evicted > 0);
    assert_eq!(tree.stats().lookaside_restored, 0);

    assert_eq!(tree.get(running.snapshot(), &key(3))?.as_deref(), Some(&b"parked"[..]));
    assert!(tree.stats().lookaside_restored > 0);
    running.commit(Timestamp(2))?;

    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), &key(3))?.as_deref(), Some(&b"parked"[..]));
    Ok(())
}

#[test]
fn pages_needing_history_stay_when_saving_is_off() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), options().update_restore(false))?;
    fill(&tree, 100, 1)?;
    tree.txns().set_oldest_timestamp(Timestamp(1))?;
    let mut running = tree.txns().begin()?;
    tree.put(&mut running, &key(1), b"pinned")?;

    tree.evict_pass()?;
    assert!(tree.stats().evict_busy > 0);
    assert_eq!(tree.get(running.snapshot(), &key(1))?.as_deref(), Some(&b"pinned"[..]));
    running.rollback()?;

    // With the writer gone the page goes.
    assert!(tree.evict_pass()? > 0);
    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), &key(1))?.as_deref(), Some(&b"v1-1"[..]));
    Ok(())
}

#[test]
fn unsettled_timestamps_keep_history_across_checkpoint() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), options().update_restore(false))?;
    fill(&tree, 100, 1)?;
    tree.checkpoint()?;

    // Nothing timestamped is settled until the oldest timestamp moves.
    tree.evict_pass()?;
    assert!(tree.stats().evict_busy > 0);
    assert_eq!(tree.stats().pages_evicted, 0);

    tree.txns().set_oldest_timestamp(Timestamp(1))?;
    assert!(tree.evict_pass()? > 0);
    let reader = tree.txns().begin_at(Timestamp(1))?;
    assert_eq!(tree.get(reader.snapshot(), &key(42))?.as_deref(), Some(&b"v1-42"[..]));
    Ok(())
}

#[test]
fn eviction_races_with_readers_and_writers() -> Result<()> {
    const READERS: usize = 4;
    init_tracing();
    let tree = Tree::create_row(TreeEnv::in_memory(), options())?;
    fill(&tree, 2_000, 1)?;
    let barrier = Arc::new(Barrier::new(READERS + 2));

    let mut handles = Vec::new();
    for r in 0..READERS {
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for round in 0..200u32 {
                let reader = tree.txns().begin()?;
                let i = (round * 7 + r as u32 * 131) % 2_000;
                assert!(tree.get(reader.snapshot(), &key(i))?.is_some(), "key {i} vanished");
            }
            Ok(())
        }));
    }
    {
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for ts in 2..40u64 {
                let mut txn = tree.txns().begin()?;
                for i in (0..2_000).step_by(97) {
                    tree.put(&mut txn, &key(i), format!("w{ts}").as_bytes())?;
                }
                txn.commit(Timestamp(ts))?;
            }
            Ok(())
        }));
    }
    barrier.wait();
    for _ in 0..20 {
        tree.evict_pass()?;
    }
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), &key(97))?.as_deref(), Some(&b"w39"[..]));
    assert!(!tree.is_panicked());
    Ok(())
}
