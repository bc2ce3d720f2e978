//! Positional splitter used to fan a group out into child branches.
//!
//! The splitter is deliberately positional: it slices the input into
//! contiguous runs without looking at the vectors. A similarity-based
//! splitter changes which items land together and belongs in its own type.

/// Splits a group into a fixed number of contiguous, order-preserving slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousPartitioner {
    branches: usize,
}

impl ContiguousPartitioner {
    /// Builds a partitioner producing `branches` groups (clamped to at least 2).
    pub fn new(branches: usize) -> Self {
        Self {
            branches: branches.max(2),
        }
    }

    /// Number of groups produced per split.
    pub fn branches(&self) -> usize {
        self.branches
    }

    /// Slices `items` into exactly `branches` groups.
    ///
    /// Group `i` holds `items[i * n / k .. (i + 1) * n / k]`, so every input
    /// lands in exactly one group and later groups absorb the remainder.
    /// Groups may be empty when `n < k`.
    pub fn partition<T>(&self, items: Vec<T>) -> Vec<Vec<T>> {
        let total = items.len();
        let bounds: Vec<usize> = (0..=self.branches)
            .map(|i| i * total / self.branches)
            .collect();

        let mut remaining = items.into_iter();
        bounds
            .windows(2)
            .map(|w| remaining.by_ref().take(w[1] - w[0]).collect())
            .collect()
    }
}

impl Default for ContiguousPartitioner {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn binary_split_matches_half_slices() {
        let groups = ContiguousPartitioner::new(2).partition((0..25).collect::<Vec<_>>());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], (0..12).collect::<Vec<_>>());
        assert_eq!(groups[1], (12..25).collect::<Vec<_>>());
    }

    #[test]
    fn three_way_split_covers_every_item_once() {
        let groups = ContiguousPartitioner::new(3).partition((0..10).collect::<Vec<_>>());
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]]);
        let flattened: Vec<_> = groups.into_iter().flatten().collect();
        assert_eq!(flattened, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn small_inputs_produce_empty_groups() {
        let groups = ContiguousPartitioner::new(3).partition(vec!['a', 'b']);
        assert_eq!(groups, vec![vec![], vec!['a'], vec!['b']]);

        let empty = ContiguousPartitioner::new(2).partition(Vec::<u8>::new());
        assert_eq!(empty, vec![Vec::<u8>::new(), Vec::new()]);
    }

    #[test]
    fn branch_count_is_clamped() {
        assert_eq!(ContiguousPartitioner::new(0).branches(), 2);
        assert_eq!(ContiguousPartitioner::new(1).branches(), 2);
        assert_eq!(ContiguousPartitioner::default().branches(), 2);
    }
}
