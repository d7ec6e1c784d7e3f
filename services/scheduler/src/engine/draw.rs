//! Uniform draws for `decide`, reseeded every evaluation cycle.
//!
//! The event loop mints a fresh seed at every evaluation and publishes it
//! with the snapshot. Each thread keeps its own generator and reseeds it
//! (salted per thread) the first time it sees a new seed, so concurrent
//! callers never share generator state.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

static NEXT_SALT: AtomicU64 = AtomicU64::new(GOLDEN_GAMMA);

thread_local! {
    static THREAD_SALT: u64 = NEXT_SALT.fetch_add(GOLDEN_GAMMA, Ordering::Relaxed);
    static GENERATOR: RefCell<Option<(u64, StdRng)>> = const { RefCell::new(None) };
}

/// Draw a value in `[0, 1)` from this thread's generator for `seed`.
pub fn uniform(seed: u64) -> f64 {
    let salt = THREAD_SALT.with(|s| *s);
    GENERATOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let stale = !matches!(slot.as_ref(), Some((current, _)) if *current == seed);
        if stale {
            *slot = Some((seed, StdRng::seed_from_u64(seed ^ salt)));
        }
        match slot.as_mut() {
            Some((_, rng)) => rng.random::<f64>(),
            None => rand::rng().random::<f64>(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draws_are_in_unit_interval() {
        for _ in 0..1000 {
            let u = uniform(42);
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_new_seed_restarts_sequence() {
        let first = uniform(7);
        let second = uniform(7);
        let _ = uniform(8);
        assert_eq!(uniform(7), first);
        assert_eq!(uniform(7), second);
    }

    #[test]
    fn test_threads_are_decorrelated() {
        let here: Vec<f64> = (0..4).map(|_| uniform(99)).collect();
        let there = std::thread::spawn(|| (0..4).map(|_| uniform(99)).collect::<Vec<f64>>())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }
}
