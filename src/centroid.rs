//! Representative vectors for groups, exact or sampled.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

use crate::path::TreePath;

/// Default cap on the number of vectors averaged per group.
pub const DEFAULT_CENTROID_SAMPLE: usize = 100;

/// Computes element-wise means, subsampling groups larger than `sample_size`.
///
/// Sampling is driven by an RNG derived from the configured seed and the
/// group's location, so the same seed yields the same centroids no matter in
/// which order concurrent subtrees are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentroidSampler {
    sample_size: usize,
    seed: u64,
}

impl CentroidSampler {
    /// Builds a sampler; `sample_size` is clamped to at least 1.
    pub fn new(sample_size: usize, seed: u64) -> Self {
        Self {
            sample_size: sample_size.max(1),
            seed,
        }
    }

    /// Maximum number of vectors averaged per group.
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Base seed mixed with each location.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Mean of `vectors`, or of a uniform sample of `sample_size` of them.
    ///
    /// Returns an empty vector for an empty group.
    pub fn centroid<V: AsRef<[f32]>>(&self, vectors: &[V], location: &TreePath) -> Vec<f32> {
        if vectors.len() <= self.sample_size {
            return mean(vectors.iter().map(|v| v.as_ref()));
        }
        let mut rng = StdRng::seed_from_u64(location_seed(self.seed, location));
        let picked = index::sample(&mut rng, vectors.len(), self.sample_size);
        mean(picked.iter().map(|idx| vectors[idx].as_ref()))
    }
}

fn mean<'a, I>(vectors: I) -> Vec<f32>
where
    I: Iterator<Item = &'a [f32]>,
{
    let mut sums: Vec<f64> = Vec::new();
    let mut count = 0usize;
    for vector in vectors {
        if sums.is_empty() {
            sums.resize(vector.len(), 0.0);
        }
        for (sum, value) in sums.iter_mut().zip(vector) {
            *sum += f64::from(*value);
        }
        count += 1;
    }
    if count == 0 {
        return Vec::new();
    }
    let inv = 1.0 / count as f64;
    sums.into_iter().map(|sum| (sum * inv) as f32).collect()
}

/// Mixes the base seed with every branch of `location`.
fn location_seed(seed: u64, location: &TreePath) -> u64 {
    let mut hash = seed ^ location.depth() as u64;
    for &branch in location.branches() {
        hash ^= u64::from(branch).wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        hash = hash.rotate_left(27).wrapping_mul(0xff51_afd7_ed55_8ccd);
    }
    hash ^ (hash >> 33)
}
