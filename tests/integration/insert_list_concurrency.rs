#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sombra_engine::storage::btree::insert::{self, InsertList, MAX_DEPTH};
use sombra_engine::storage::btree::update::UpdateChain;
use sombra_engine::types::Result;

const NUM_THREADS: usize = 8;
const KEYS_PER_THREAD: u64 = 2_000;
const SHARED_KEYS: u64 = 256;

fn insert_all(list: &InsertList<u64>, keys: &[u64]) -> Result<(usize, usize)> {
    let mut won = 0;
    let mut restarts = 0;
    for key in keys {
        match insert::insert_key(list, key, || Ok(UpdateChain::default()), || restarts += 1)? {
            Ok(_) => won += 1,
            Err(_) => {}
        }
    }
    Ok((won, restarts))
}

#[test]
fn concurrent_inserts_keep_every_key_once() -> Result<()> {
    let list = Arc::new(InsertList::<u64>::new(MAX_DEPTH));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let list = Arc::clone(&list);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<(usize, usize)> {
            // Private keys interleave with every other thread; the shared
            // prefix makes every thread race for the same keys.
            let mut keys: Vec<u64> = (0..KEYS_PER_THREAD)
                .map(|i| SHARED_KEYS + i * NUM_THREADS as u64 + thread_id as u64)
                .chain(0..SHARED_KEYS)
                .collect();
            keys.shuffle(&mut ChaCha8Rng::seed_from_u64(thread_id as u64));
            barrier.wait();
            insert_all(&list, &keys)
        }));
    }

    let mut won = 0;
    for handle in handles {
        let (w, _restarts) = handle.join().expect("insert thread panicked")?;
        won += w;
    }

    let expected = SHARED_KEYS + KEYS_PER_THREAD * NUM_THREADS as u64;
    assert_eq!(won as u64, expected, "each key is inserted by exactly one thread");
    assert_eq!(list.len() as u64, expected);
    let keys = insert::keys(&list);
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "level 0 is strictly ordered");
    assert_eq!(keys, (0..expected).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn upper_levels_stay_subsets_under_contention() -> Result<()> {
    let list = Arc::new(InsertList::<u64>::new(MAX_DEPTH));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|thread_id| {
            let list = Arc::clone(&list);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                let keys: Vec<u64> = (0..1_000u64).map(|i| i * NUM_THREADS as u64 + thread_id as u64).collect();
                barrier.wait();
                insert_all(&list, &keys).map(|_| ())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("insert thread panicked")?;
    }

    let levels = insert::level_members(&list)?;
    for pair in levels.windows(2) {
        let below: BTreeSet<u32> = pair[0].iter().copied().collect();
        assert!(pair[1].iter().all(|idx| below.contains(idx)), "node linked above a level it is missing from");
        let upper_keys: Vec<u64> = pair[1]
            .iter()
            .filter_map(|idx| list.node(*idx).map(|n| *n.key()))
            .collect();
        assert!(upper_keys.windows(2).all(|w| w[0] < w[1]));
    }
    Ok(())
}

#[test]
fn readers_never_see_a_torn_list() -> Result<()> {
    let list = Arc::new(InsertList::<u64>::new(MAX_DEPTH));
    let writer = {
        let list = Arc::clone(&list);
        thread::spawn(move || -> Result<()> {
            let mut keys: Vec<u64> = (0..20_000).collect();
            keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xC0FFEE));
            insert_all(&list, &keys).map(|_| ())
        })
    };
    let reader = {
        let list = Arc::clone(&list);
        thread::spawn(move || {
            let mut passes = 0;
            while passes < 200 {
                let mut last = None;
                for (_, node) in list.iter() {
                    let key = *node.key();
                    assert!(last.map_or(true, |l| l < key), "iteration went backwards");
                    last = Some(key);
                }
                passes += 1;
            }
        })
    };
    writer.join().expect("writer panicked")?;
    reader.join().expect("reader panicked");
    assert_eq!(list.len(), 20_000);
    Ok(())
}
