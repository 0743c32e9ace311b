//! Rank-level collective primitives.
//!
//! Workers communicate exclusively through these collectives; there is no
//! shared mutable memory across ranks. The in-process implementation is a
//! fleet of one: every collective keeps its call discipline (so the search
//! and scheduler code is written once against this surface) and degenerates
//! to the identity.

use crate::rng;
use log::*;

#[derive(Clone, Debug)]
pub struct Comm {
    rank: usize,
    size: usize,
    allow_split: bool,
}

impl Comm {
    pub fn serial() -> Self {
        Comm { rank: 0, size: 1, allow_split: false }
    }

    pub fn with_split(mut self, allow: bool) -> Self {
        self.allow_split = allow;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Whether the scheduler may launch heterogeneous per-family sub-jobs.
    pub fn allow_split(&self) -> bool {
        self.allow_split
    }

    /// All ranks block until every rank reached the same barrier.
    pub fn barrier(&self) {}

    /// Deterministically tears the whole fleet down.
    pub fn abort(&self, code: i32) -> ! {
        error!("aborting run with code {}", code);
        std::process::exit(code)
    }

    pub fn sum_double(&self, x: f64) -> f64 {
        x
    }

    pub fn sum_u64(&self, x: u64) -> u64 {
        x
    }

    /// Global maximum and the rank owning it.
    pub fn max_double(&self, x: f64) -> (f64, usize) {
        (x, self.rank)
    }

    pub fn broadcast_usize(&self, _owner: usize, x: &mut usize) {
        let _ = x;
    }

    pub fn broadcast_double(&self, _owner: usize, x: &mut f64) {
        let _ = x;
    }

    /// Contiguous slice of `n` jobs assigned to this rank.
    pub fn begin_end(&self, n: usize) -> (usize, usize) {
        let per_rank = n.div_ceil(self.size.max(1));
        let begin = (self.rank * per_rank).min(n);
        let end = ((self.rank + 1) * per_rank).min(n);
        (begin, end)
    }

    /// The PRNG must be in the same state on all ranks; a mismatch means a
    /// rank diverged and the run is no longer reproducible.
    pub fn is_rand_consistent(&self) -> bool {
        let local = rng::fingerprint();
        let global = self.sum_u64(local);
        global == local.wrapping_mul(self.size as u64)
    }

    pub fn assert_rand_consistent(&self) {
        if !self.is_rand_consistent() {
            error!("random seed is not consistent across ranks");
            self.abort(30);
        }
    }
}
