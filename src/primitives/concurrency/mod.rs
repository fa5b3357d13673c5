#![forbid(unsafe_code)]
//! Hazard counters, backoff and split generations.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Count of readers currently holding a page.
///
/// Readers increment before re-checking the reference state and decrement
/// when their guard drops; the evictor locks the reference first and only
/// then looks at the count. Both sides use `SeqCst` so that at least one of
/// them observes the other.
#[derive(Debug, Default)]
pub struct HazardCount(AtomicU32);

impl HazardCount {
    /// Publishes one more reader.
    pub fn acquire(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Withdraws a reader.
    pub fn release(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns true when no reader holds the page.
    pub fn is_clear(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 0
    }

    /// Current number of readers.
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spin, then yield, then sleep with an escalating delay.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const MAX_SLEEP_MICROS: u64 = 10_000;

impl Backoff {
    /// Fresh backoff state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits one round.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let exp = (self.step - YIELD_LIMIT).min(10);
            let micros = (10u64 << exp).min(MAX_SLEEP_MICROS);
            std::thread::sleep(Duration::from_micros(micros));
        }
        self.step = self.step.saturating_add(1);
    }

    /// Returns true once the backoff has escalated to sleeping.
    pub fn is_sleeping(&self) -> bool {
        self.step > YIELD_LIMIT
    }

    /// Number of rounds waited so far.
    pub fn rounds(&self) -> u32 {
        self.step
    }
}

/// Split generation tracking.
///
/// Threads that publish a split enter the current generation for the
/// duration of the parent update. Checkpoint bumps the generation and drains
/// the previous one before it trusts the shape of the tree.
#[derive(Debug)]
pub struct Generations {
    current: AtomicU64,
    active: Mutex<Vec<(u64, u32)>>,
}

impl Default for Generations {
    fn default() -> Self {
        Self {
            current: AtomicU64::new(1),
            active: Mutex::new(Vec::new()),
        }
    }
}

/// Membership in a split generation; leaving happens on drop.
#[must_use]
pub struct GenerationGuard<'a> {
    owner: &'a Generations,
    generation: u64,
}

impl GenerationGuard<'_> {
    /// Generation this guard belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.owner.active.lock();
        if let Some(pos) = active.iter().position(|(g, _)| *g == self.generation) {
            active[pos].1 -= 1;
            if active[pos].1 == 0 {
                active.swap_remove(pos);
            }
        }
    }
}

impl Generations {
    /// Current generation number.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Enters the current generation.
    pub fn enter(&self) -> GenerationGuard<'_> {
        let mut active = self.active.lock();
        let generation = self.current.load(Ordering::Acquire);
        match active.iter_mut().find(|(g, _)| *g == generation) {
            Some(entry) => entry.1 += 1,
            None => active.push((generation, 1)),
        }
        GenerationGuard {
            owner: self,
            generation,
        }
    }

    /// Advances the generation, returning the previous value.
    pub fn bump(&self) -> u64 {
        let _active = self.active.lock();
        self.current.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns true while any thread is inside a generation `<= generation`.
    pub fn is_active(&self, generation: u64) -> bool {
        self.active.lock().iter().any(|(g, _)| *g <= generation)
    }

    /// Waits until every thread inside a generation `<= generation` has left.
    pub fn drain(&self, generation: u64) {
        let mut backoff = Backoff::new();
        while self.is_active(generation) {
            backoff.snooze();
        }
    }
}
