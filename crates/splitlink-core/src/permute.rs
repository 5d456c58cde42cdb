//! Deterministic element permutation.
//!
//! Producer and consumer each derive the table independently — same seed,
//! same algorithm, same table — so only the seed travels on the wire. The
//! RNG is pinned to ChaCha8 because its stream is stable across rand
//! releases; a silent shuffle change would desynchronize the two sides.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::settings::SplitMode;

/// Bijection over `0..n`: identity for sequential mode, a seeded
/// Fisher-Yates shuffle for random mode.
pub fn permutation(mode: SplitMode, seed: u64, n: usize) -> Vec<usize> {
    let mut table: Vec<usize> = (0..n).collect();
    if mode == SplitMode::Random {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        table.shuffle(&mut rng);
    }
    table
}
