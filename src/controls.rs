//! Partitioning knobs shared by the library and its binaries.

use clap::Args;

use crate::centroid::DEFAULT_CENTROID_SAMPLE;

/// Default upper bound for a finished leaf.
pub const DEFAULT_MAX_CLUSTER_SIZE: usize = 10;
/// Default lower bound below which a group is dropped.
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 1;
/// Default number of groups produced per split.
pub const DEFAULT_BRANCHES: usize = 2;
/// Default number of node tasks allowed to run at once.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlsError {
    /// `max_cluster_size` was zero; single-item groups could never finish.
    #[error("max_cluster_size must be at least 1")]
    MaxClusterSize,
    /// Fewer than two branches cannot shrink a group.
    #[error("branches must be at least 2, got {0}")]
    Branches(usize),
    /// The centroid sample must hold at least one vector.
    #[error("centroid sample size must be at least 1")]
    CentroidSample,
    /// At least one worker is required to make progress.
    #[error("max_workers must be at least 1")]
    Workers,
    /// The branch index would not fit in a stored path element.
    #[error("branches must not exceed {max}, got {got}")]
    TooManyBranches {
        /// Largest supported branch count.
        max: usize,
        /// Requested branch count.
        got: usize,
    },
}

/// Tunable knobs that bound the recursive partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterControls {
    max_cluster_size: usize,
    min_cluster_size: usize,
    branches: usize,
    centroid_sample: usize,
    seed: Option<u64>,
    max_workers: usize,
    leaf_centroids: bool,
}

impl ClusterControls {
    /// Validates and constructs a set of controls.
    pub fn new(
        max_cluster_size: usize,
        min_cluster_size: usize,
        branches: usize,
        centroid_sample: usize,
    ) -> Result<Self, ControlsError> {
        if max_cluster_size == 0 {
            return Err(ControlsError::MaxClusterSize);
        }
        if branches < 2 {
            return Err(ControlsError::Branches(branches));
        }
        let max_branches = usize::from(u16::MAX) + 1;
        if branches > max_branches {
            return Err(ControlsError::TooManyBranches {
                max: max_branches,
                got: branches,
            });
        }
        if centroid_sample == 0 {
            return Err(ControlsError::CentroidSample);
        }
        Ok(Self {
            max_cluster_size,
            min_cluster_size,
            branches,
            centroid_sample,
            ..Self::default()
        })
    }

    /// Fixes the sampling seed so centroids are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Bounds the number of node tasks running concurrently.
    pub fn with_max_workers(mut self, max_workers: usize) -> Result<Self, ControlsError> {
        if max_workers == 0 {
            return Err(ControlsError::Workers);
        }
        self.max_workers = max_workers;
        Ok(self)
    }

    /// Also records centroids for children that finish as leaves.
    pub fn with_leaf_centroids(mut self, enabled: bool) -> Self {
        self.leaf_centroids = enabled;
        self
    }

    /// Upper bound for a finished leaf.
    pub fn max_cluster_size(&self) -> usize {
        self.max_cluster_size
    }

    /// Lower bound below which a group is dropped.
    pub fn min_cluster_size(&self) -> usize {
        self.min_cluster_size
    }

    /// Groups produced per split.
    pub fn branches(&self) -> usize {
        self.branches
    }

    /// Largest group averaged without sampling.
    pub fn centroid_sample(&self) -> usize {
        self.centroid_sample
    }

    /// Configured sampling seed, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Maximum concurrent node tasks.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Whether leaf children get their own tree node.
    pub fn leaf_centroids(&self) -> bool {
        self.leaf_centroids
    }

    /// Decides what happens to a group of `size` items.
    pub fn classify(&self, size: usize) -> GroupFate {
        if size < self.min_cluster_size {
            GroupFate::Dropped
        } else if size <= self.max_cluster_size {
            GroupFate::Leaf
        } else {
            GroupFate::Split
        }
    }
}

impl Default for ClusterControls {
    fn default() -> Self {
        Self {
            max_cluster_size: DEFAULT_MAX_CLUSTER_SIZE,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
            branches: DEFAULT_BRANCHES,
            centroid_sample: DEFAULT_CENTROID_SAMPLE,
            seed: None,
            max_workers: DEFAULT_MAX_WORKERS,
            leaf_centroids: false,
        }
    }
}

/// Stopping decision for one group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupFate {
    /// Smaller than `min_cluster_size`; left untouched.
    Dropped,
    /// Within bounds; no further split.
    Leaf,
    /// Larger than `max_cluster_size`; split into branches.
    Split,
}

/// Command-line arguments shared by binaries that run a partition.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Largest group left unsplit
    #[arg(long, env = "CLUSTER_TREE_MAX_CLUSTER", default_value_t = DEFAULT_MAX_CLUSTER_SIZE)]
    pub max_cluster_size: usize,

    /// Groups smaller than this are dropped from further structure
    #[arg(long, env = "CLUSTER_TREE_MIN_CLUSTER", default_value_t = DEFAULT_MIN_CLUSTER_SIZE)]
    pub min_cluster_size: usize,

    /// Number of contiguous groups produced per split
    #[arg(long, env = "CLUSTER_TREE_BRANCHES", default_value_t = DEFAULT_BRANCHES)]
    pub branches: usize,

    /// Groups larger than this are sampled before averaging
    #[arg(long, env = "CLUSTER_TREE_CENTROID_SAMPLE", default_value_t = DEFAULT_CENTROID_SAMPLE)]
    pub centroid_sample: usize,

    /// Seed for centroid sampling (random when omitted)
    #[arg(long, env = "CLUSTER_TREE_SEED")]
    pub seed: Option<u64>,

    /// Node tasks allowed to run (and hold a store connection) at once
    #[arg(long, env = "CLUSTER_TREE_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Also record a centroid row for each child that finishes as a leaf.
    /// Split children write their own row either way, so with this on every
    /// non-dropped child of a split gets exactly one row
    #[arg(long, env = "CLUSTER_TREE_LEAF_CENTROIDS", default_value_t = false)]
    pub leaf_centroids: bool,
}

impl ClusterArgs {
    /// Converts the parsed arguments into validated `ClusterControls`.
    pub fn build_controls(&self) -> Result<ClusterControls, ControlsError> {
        let controls = ClusterControls::new(
            self.max_cluster_size,
            self.min_cluster_size,
            self.branches,
            self.centroid_sample,
        )?
        .with_max_workers(self.max_workers)?
        .with_leaf_centroids(self.leaf_centroids);
        Ok(match self.seed {
            Some(seed) => controls.with_seed(seed),
            None => controls,
        })
    }
}
