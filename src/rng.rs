//! Process-wide pseudo-random source.
//!
//! Every rank must draw the same sequence: any code whose control flow has to
//! stay rank-consistent snapshots the generator before running and restores
//! the snapshot on all ranks afterwards.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

static GENERATOR: Mutex<Option<SmallRng>> = Mutex::new(None);

pub fn init(seed: u64) {
    *GENERATOR.lock().unwrap() = Some(SmallRng::seed_from_u64(seed));
}

pub fn teardown() {
    *GENERATOR.lock().unwrap() = None;
}

fn with<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    let mut guard = GENERATOR.lock().unwrap();
    let rng = guard.get_or_insert_with(|| SmallRng::seed_from_u64(42));
    f(rng)
}

pub fn next_u64() -> u64 {
    with(|rng| rng.gen())
}

pub fn uniform() -> f64 {
    with(|rng| rng.gen::<f64>())
}

pub fn gen_range(n: usize) -> usize {
    with(|rng| rng.gen_range(0..n))
}

/// Draw a fresh seed to be restored after a block whose number of draws is
/// not rank-consistent.
pub fn snapshot() -> u64 {
    next_u64()
}

pub fn restore(seed: u64) {
    init(seed);
}

/// Fingerprint of the generator state, compared across ranks at major
/// boundaries. Consumes one draw, so it must be called on every rank.
pub fn fingerprint() -> u64 {
    let probe = next_u64();
    restore(probe);
    probe
}
