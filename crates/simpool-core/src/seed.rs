//! Deterministic per-job seed derivation

use crate::ids::JobId;
use crate::types::{Job, Seed};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

/// Derive the seed of job `index` under `base_seed`.
///
/// Uses stream `index` of a ChaCha8 generator keyed by the base seed, so the
/// mapping does not depend on scheduling order or worker count.
pub fn derive_seed(base_seed: u64, index: u64) -> Seed {
    let mut rng = ChaCha8Rng::seed_from_u64(base_seed);
    rng.set_stream(index);
    Seed::from(rng.next_u64())
}

/// Draw a fresh base seed for runs that did not specify one
pub fn random_base_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Build the job list for `count` iterations under `base_seed`
pub fn derive_jobs(base_seed: u64, count: u64) -> Vec<Job> {
    (0..count)
        .map(|index| Job::new(JobId::new(index), derive_seed(base_seed, index)))
        .collect()
}

/// Build jobs from explicit seeds, indexed in the given order
pub fn explicit_jobs(seeds: impl IntoIterator<Item = Seed>) -> Vec<Job> {
    seeds
        .into_iter()
        .enumerate()
        .map(|(index, seed)| Job::new(JobId::new(index as u64), seed))
        .collect()
}
