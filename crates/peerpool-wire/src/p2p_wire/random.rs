//! Randomness used by the pool: picking a peer, sampling peers for consensus and shuffling
//! discovered addresses.
//!
//! It sits behind a trait so tests can use a seeded generator and get the same choices every
//! run.

use std::sync::Mutex;
use std::sync::PoisonError;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::Rng;
use rand::SeedableRng;

pub trait RandomSource: Send + Sync + 'static {
    /// A uniformly random index in `0..len`. `len` must not be zero.
    fn index(&self, len: usize) -> usize;

    /// `amount` distinct indexes in `0..len`, in random order. `amount` must not exceed `len`.
    fn sample(&self, len: usize, amount: usize) -> Vec<usize>;
}

/// Reorders `items` uniformly at random
pub fn shuffle<T>(random: &dyn RandomSource, items: Vec<T>) -> Vec<T> {
    let order = random.sample(items.len(), items.len());
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
/// Production source, backed by the thread-local rng
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn index(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }

    fn sample(&self, len: usize, amount: usize) -> Vec<usize> {
        index::sample(&mut rand::thread_rng(), len, amount).into_vec()
    }
}

#[derive(Debug)]
/// A deterministic source, for tests and reproducible runs
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        SeededRandom {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn index(&self, len: usize) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_range(0..len)
    }

    fn sample(&self, len: usize, amount: usize) -> Vec<usize> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        index::sample(&mut *rng, len, amount).into_vec()
    }
}
