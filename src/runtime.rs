//! Recursive partitioner coordinating node tasks over a shared store.
//!
//! Every tree node is processed by one task: acquire a store handle, fetch
//! the group at the node's path, apply the stopping rules, and for groups that
//! are too large record the node's centroid and push each slice onto its own
//! child branch. A task returns the child paths it created and the scheduler
//! spawns their tasks only then, so a child never reads its group before the
//! parent's branch assignment has committed. Sibling subtrees own disjoint
//! items and run concurrently, bounded by `max_workers`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::centroid::CentroidSampler;
use crate::controls::{ClusterControls, GroupFate};
use crate::item::{Item, ItemId, TreeNode};
use crate::partition::ContiguousPartitioner;
use crate::path::TreePath;
use crate::store::{Backend, PathStore, StoreError, TreeStore};

/// What a single node task did with its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// The group was smaller than `min_cluster_size` and left untouched.
    Dropped {
        /// Items in the group.
        size: usize,
    },
    /// The group was within bounds and became a finished leaf.
    Leaf {
        /// Items in the group.
        size: usize,
    },
    /// The group was split; each child path has committed its items.
    Split {
        /// Items in the group.
        size: usize,
        /// Non-empty child branches in branch order.
        children: Vec<TreePath>,
        /// Node rows written by this task.
        nodes_written: usize,
    },
}

/// A node whose task failed; branches it had not committed were never visited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtreeFailure {
    /// Path of the node whose task failed.
    pub path: TreePath,
    /// Rendered store error.
    pub error: String,
}

/// Summary of one partition run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Seed used for centroid sampling.
    pub seed: u64,
    /// Node rows written to the tree store.
    pub nodes_written: usize,
    /// Groups that were split.
    pub splits: usize,
    /// Groups that finished as leaves.
    pub leaves: usize,
    /// Items held by finished leaves.
    pub leaf_items: usize,
    /// Groups dropped for being smaller than `min_cluster_size`.
    pub dropped_groups: usize,
    /// Items held by dropped groups.
    pub dropped_items: usize,
    /// Deepest path visited.
    pub max_depth: usize,
    /// Subtrees aborted by store errors.
    pub failures: Vec<SubtreeFailure>,
    /// Wall-clock duration of the run in milliseconds.
    pub elapsed_ms: u64,
}

impl BuildReport {
    /// Whether every subtree completed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, path: &TreePath, outcome: &NodeOutcome) {
        self.max_depth = self.max_depth.max(path.depth());
        match outcome {
            NodeOutcome::Dropped { size } => {
                self.dropped_groups += 1;
                self.dropped_items += size;
            }
            NodeOutcome::Leaf { size } => {
                self.leaves += 1;
                self.leaf_items += size;
            }
            NodeOutcome::Split { nodes_written, .. } => {
                self.splits += 1;
                self.nodes_written += nodes_written;
            }
        }
    }
}

/// A node task that stopped on a store error.
///
/// Children whose branch assignment committed before the error are still
/// handed back so the scheduler can build them.
struct NodeFailure {
    error: StoreError,
    children: Vec<TreePath>,
    nodes_written: usize,
}

impl From<StoreError> for NodeFailure {
    fn from(error: StoreError) -> Self {
        Self {
            error,
            children: Vec::new(),
            nodes_written: 0,
        }
    }
}

/// Immutable per-run state shared by every node task.
struct NodeContext<B> {
    backend: Arc<B>,
    controls: ClusterControls,
    partitioner: ContiguousPartitioner,
    sampler: CentroidSampler,
}

/// Builds the cluster tree for a backend.
pub struct TreeBuilder<B: Backend> {
    context: Arc<NodeContext<B>>,
}

impl<B: Backend> TreeBuilder<B> {
    /// Creates a builder; a random sampling seed is drawn when none is set.
    pub fn new(backend: Arc<B>, controls: ClusterControls) -> Self {
        let seed = controls.seed().unwrap_or_else(rand::random);
        let partitioner = ContiguousPartitioner::new(controls.branches());
        let sampler = CentroidSampler::new(controls.centroid_sample(), seed);
        Self {
            context: Arc::new(NodeContext {
                backend,
                controls,
                partitioner,
                sampler,
            }),
        }
    }

    /// Controls this builder runs with.
    pub fn controls(&self) -> &ClusterControls {
        &self.context.controls
    }

    /// Effective centroid sampling seed.
    pub fn seed(&self) -> u64 {
        self.context.sampler.seed()
    }

    /// Partitions the whole dataset starting from the root.
    pub async fn build(&self) -> BuildReport {
        self.build_from(TreePath::root()).await
    }

    /// Partitions the subtree rooted at `start`.
    ///
    /// Store failures abort only the affected subtree and are listed in the
    /// report; everything already written stays in place.
    pub async fn build_from(&self, start: TreePath) -> BuildReport {
        let started = Instant::now();
        let controls = &self.context.controls;
        tracing::info!(
            start = %start,
            max_cluster_size = controls.max_cluster_size(),
            min_cluster_size = controls.min_cluster_size(),
            branches = controls.branches(),
            max_workers = controls.max_workers(),
            seed = self.seed(),
            "starting partition"
        );

        let permits = Arc::new(Semaphore::new(controls.max_workers()));
        let mut tasks = JoinSet::new();
        let mut report = BuildReport {
            seed: self.seed(),
            ..BuildReport::default()
        };
        self.spawn_node(&mut tasks, &permits, start);

        while let Some(joined) = tasks.join_next().await {
            let (path, result) = match joined {
                Ok(done) => done,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => {
                    tracing::error!(error = %err, "node task cancelled");
                    continue;
                }
            };
            match result {
                Ok(outcome) => {
                    report.record(&path, &outcome);
                    if let NodeOutcome::Split { children, .. } = outcome {
                        for child in children {
                            self.spawn_node(&mut tasks, &permits, child);
                        }
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        path = %path,
                        error = %failure.error,
                        committed_children = failure.children.len(),
                        "subtree aborted"
                    );
                    report.max_depth = report.max_depth.max(path.depth());
                    report.nodes_written += failure.nodes_written;
                    report.failures.push(SubtreeFailure {
                        path,
                        error: failure.error.to_string(),
                    });
                    for child in failure.children {
                        self.spawn_node(&mut tasks, &permits, child);
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            nodes = report.nodes_written,
            splits = report.splits,
            leaves = report.leaves,
            dropped_groups = report.dropped_groups,
            failures = report.failures.len(),
            elapsed = ?elapsed,
            "partition finished"
        );
        report
    }

    fn spawn_node(
        &self,
        tasks: &mut JoinSet<(TreePath, Result<NodeOutcome, NodeFailure>)>,
        permits: &Arc<Semaphore>,
        path: TreePath,
    ) {
        let context = Arc::clone(&self.context);
        let permits = Arc::clone(permits);
        tasks.spawn(async move {
            // The semaphore is never closed, so acquisition cannot fail.
            let _permit = permits.acquire_owned().await.ok();
            let result = context.expand(&path).await;
            (path, result)
        });
    }
}

impl<B: Backend> NodeContext<B> {
    /// Processes one node with a handle scoped to this call.
    async fn expand(&self, path: &TreePath) -> Result<NodeOutcome, NodeFailure> {
        let store = self.backend.acquire().await?;
        let items = if path.is_root() {
            store.fetch_all().await?
        } else {
            store.fetch_by_path(path).await?
        };
        let size = items.len();

        match self.controls.classify(size) {
            GroupFate::Dropped => {
                tracing::debug!(path = %path, size, "dropping undersized group");
                return Ok(NodeOutcome::Dropped { size });
            }
            GroupFate::Leaf => {
                tracing::debug!(path = %path, size, "leaf reached");
                return Ok(NodeOutcome::Leaf { size });
            }
            GroupFate::Split => {}
        }

        tracing::debug!(path = %path, size, branches = self.partitioner.branches(), "splitting");
        let node = TreeNode::new(self.sampler.centroid(&items, path), path.clone());
        store.insert_node(&node).await?;
        let mut nodes_written = 1usize;

        let mut children = Vec::new();
        for (idx, group) in self.partitioner.partition(items).into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            // Branch counts are capped to the u16 range when controls are built.
            let branch = u16::try_from(idx).unwrap_or(u16::MAX);
            let ids: Vec<ItemId> = group.iter().map(|item| item.id).collect();
            if let Err(error) = store.append_branch(&ids, path, branch).await {
                return Err(NodeFailure {
                    error,
                    children,
                    nodes_written,
                });
            }

            let child = path.child(branch);
            children.push(child.clone());
            if self.records_leaf(&group) {
                let leaf = TreeNode::new(self.sampler.centroid(&group, &child), child);
                if let Err(error) = store.insert_node(&leaf).await {
                    return Err(NodeFailure {
                        error,
                        children,
                        nodes_written,
                    });
                }
                nodes_written += 1;
            }
        }

        Ok(NodeOutcome::Split {
            size,
            children,
            nodes_written,
        })
    }

    fn records_leaf(&self, group: &[Item]) -> bool {
        self.controls.leaf_centroids() && self.controls.classify(group.len()) == GroupFate::Leaf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    async fn store_with(count: usize) -> Arc<MemoryStore> {
        let store = MemoryStore::new(2);
        store
            .insert_many((0..count).map(|i| vec![i as f32, 1.0]).collect())
            .await
            .expect("insert");
        Arc::new(store)
    }

    fn controls(max: usize, min: usize) -> ClusterControls {
        ClusterControls::new(max, min, 2, 100)
            .expect("valid controls")
            .with_seed(5)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn root_split_records_root_centroid_first() {
        let store = store_with(4).await;
        let builder = TreeBuilder::new(Arc::clone(&store), controls(2, 1));
        let report = builder.build().await;

        assert!(report.is_complete());
        let nodes = store.nodes().await;
        assert_eq!(nodes[0].location, TreePath::root());
        assert_eq!(nodes[0].centroid, vec![1.5, 1.0]);
        assert_eq!(report.nodes_written, 1);
        assert_eq!(report.leaves, 2);
        assert_eq!(report.leaf_items, 4);
        assert_eq!(report.max_depth, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn undersized_children_are_dropped_with_paths_kept() {
        // 5 items, max 2, min 3: the root splits into 2 + 3, the 2-group is
        // dropped and the 3-group splits again into 1 + 2, both dropped.
        let store = store_with(5).await;
        let report = TreeBuilder::new(Arc::clone(&store), controls(2, 3))
            .build()
            .await;

        assert_eq!(report.splits, 2);
        assert_eq!(report.dropped_groups, 3);
        assert_eq!(report.dropped_items, 5);
        let paths: Vec<_> = store
            .items()
            .await
            .into_iter()
            .map(|item| item.path.expect("assigned").to_string())
            .collect();
        assert_eq!(paths, vec!["/0", "/0", "/1/0", "/1/1", "/1/1"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn leaf_centroids_are_optional() {
        let store = store_with(4).await;
        let report = TreeBuilder::new(
            Arc::clone(&store),
            controls(2, 1).with_leaf_centroids(true),
        )
        .build()
        .await;

        let locations: Vec<_> = store
            .nodes()
            .await
            .into_iter()
            .map(|node| node.location.to_string())
            .collect();
        assert_eq!(locations, vec!["/", "/0", "/1"]);
        assert_eq!(report.nodes_written, 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_slices_get_no_branch() {
        // Two items over three branches slice into [], [a], [b].
        let store = store_with(2).await;
        let controls = ClusterControls::new(1, 1, 3, 100)
            .expect("valid controls")
            .with_seed(5);
        let report = TreeBuilder::new(Arc::clone(&store), controls).build().await;

        assert!(report.is_complete());
        assert_eq!(report.leaves, 2);
        let paths: Vec<_> = store
            .items()
            .await
            .into_iter()
            .map(|item| item.path.expect("assigned").to_string())
            .collect();
        assert_eq!(paths, vec!["/1", "/2"]);
        let root = TreePath::root();
        assert!(store
            .fetch_by_path(&root.child(0))
            .await
            .expect("fetch")
            .is_empty());
        let nodes = store.nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].location, root);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn build_from_subtree_only_touches_that_subtree() {
        let store = store_with(6).await;
        let ids: Vec<ItemId> = store.items().await.iter().map(|item| item.id).collect();
        let root = TreePath::root();
        store.append_branch(&ids[..3], &root, 0).await.unwrap();
        store.append_branch(&ids[3..], &root, 1).await.unwrap();

        let report = TreeBuilder::new(Arc::clone(&store), controls(2, 1))
            .build_from(root.child(1))
            .await;

        assert_eq!(report.splits, 1);
        let items = store.items().await;
        assert!(items[..3].iter().all(|item| item.is_at(&root.child(0))));
        assert_eq!(items[3].path, Some(TreePath::from_branches([1, 0])));
        assert_eq!(store.nodes().await[0].location, root.child(1));
    }

    #[test]
    fn report_serializes_paths_as_arrays() {
        let report = BuildReport {
            failures: vec![SubtreeFailure {
                path: TreePath::from_branches([1, 0]),
                error: "boom".into(),
            }],
            ..BuildReport::default()
        };
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["failures"][0]["path"], serde_json::json!([1, 0]));
        assert!(json["elapsed_ms"].is_u64());
        assert!(!report.is_complete());
    }
}
