//! In-process backend keeping items and nodes behind one async mutex.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{distinct_ids, Backend, PathStore, StoreError, StoreResult, TreeStore};
use crate::item::{Item, ItemId, TreeNode};
use crate::path::TreePath;

#[derive(Default)]
struct MemoryState {
    items: Vec<Item>,
    nodes: Vec<TreeNode>,
    next_id: ItemId,
}

/// Shared in-memory path and tree store.
///
/// Clones share the same state, so the store doubles as its own [`Backend`]:
/// every acquired handle is a cheap clone.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    dims: usize,
}

impl MemoryStore {
    /// Creates an empty store accepting `dims`-wide embeddings.
    pub fn new(dims: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            dims,
        }
    }

    /// Embedding width accepted by this store.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Inserts one embedding with an unset path and returns its id.
    pub async fn insert(&self, embedding: Vec<f32>) -> StoreResult<ItemId> {
        let mut ids = self.insert_many(vec![embedding]).await?;
        Ok(ids.remove(0))
    }

    /// Inserts embeddings in order; rejects the whole batch on a width mismatch.
    pub async fn insert_many(&self, embeddings: Vec<Vec<f32>>) -> StoreResult<Vec<ItemId>> {
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dims) {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                got: bad.len(),
            });
        }
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let id = state.next_id;
            state.next_id += 1;
            state.items.push(Item::new(id, embedding));
            ids.push(id);
        }
        Ok(ids)
    }

    /// Snapshot of every item in insertion order.
    pub async fn items(&self) -> Vec<Item> {
        self.state.lock().await.items.clone()
    }

    /// Snapshot of every node in insertion order.
    pub async fn nodes(&self) -> Vec<TreeNode> {
        self.state.lock().await.nodes.clone()
    }
}

#[async_trait]
impl PathStore for MemoryStore {
    async fn fetch_all(&self) -> StoreResult<Vec<Item>> {
        Ok(self.items().await)
    }

    async fn fetch_by_path(&self, path: &TreePath) -> StoreResult<Vec<Item>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .filter(|item| item.is_at(path))
            .cloned()
            .collect())
    }

    async fn append_branch(
        &self,
        ids: &[ItemId],
        parent: &TreePath,
        branch: u16,
    ) -> StoreResult<()> {
        let target = parent.child(branch);
        let mut state = self.state.lock().await;
        let positions: HashMap<ItemId, usize> = state
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.id, pos))
            .collect();

        let ids = distinct_ids(ids);
        let mut pending = Vec::with_capacity(ids.len());
        let mut matched = 0usize;
        for id in &ids {
            let Some(&pos) = positions.get(id) else {
                continue;
            };
            let item = &state.items[pos];
            if item.is_at(parent) {
                pending.push(pos);
                matched += 1;
            } else if item.is_at(&target) {
                matched += 1;
            }
        }
        if matched != ids.len() {
            return Err(StoreError::BranchConflict {
                parent: parent.clone(),
                branch,
                expected: ids.len(),
                matched,
            });
        }

        for pos in pending {
            state.items[pos].path = Some(target.clone());
        }
        Ok(())
    }

    async fn reset_paths(&self) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut cleared = 0u64;
        for item in state.items.iter_mut() {
            if item.path.take().is_some() {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    async fn insert_node(&self, node: &TreeNode) -> StoreResult<()> {
        if node.centroid.len() != self.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                got: node.centroid.len(),
            });
        }
        self.state.lock().await.nodes.push(node.clone());
        Ok(())
    }

    async fn clear_nodes(&self) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let removed = state.nodes.len() as u64;
        state.nodes.clear();
        Ok(removed)
    }
}

#[async_trait]
impl Backend for MemoryStore {
    type Handle = MemoryStore;

    async fn acquire(&self) -> StoreResult<Self::Handle> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(count: usize) -> (MemoryStore, Vec<ItemId>) {
        let store = MemoryStore::new(2);
        let ids = store
            .insert_many((0..count).map(|i| vec![i as f32, 0.0]).collect())
            .await
            .expect("insert");
        (store, ids)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fetch_by_path_is_exact_match() {
        let (store, ids) = seeded(4).await;
        let root = TreePath::root();
        store.append_branch(&ids[..2], &root, 0).await.unwrap();
        store.append_branch(&ids[2..], &root, 1).await.unwrap();
        store
            .append_branch(&ids[..1], &root.child(0), 1)
            .await
            .unwrap();

        let at_zero = store.fetch_by_path(&root.child(0)).await.unwrap();
        assert_eq!(at_zero.iter().map(|i| i.id).collect::<Vec<_>>(), vec![ids[1]]);
        let nowhere = store.fetch_by_path(&root.child(7)).await.unwrap();
        assert!(nowhere.is_empty());
        assert_eq!(store.fetch_all().await.unwrap().len(), 4);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_branch_retry_is_idempotent() {
        let (store, ids) = seeded(3).await;
        let root = TreePath::root();
        store.append_branch(&ids, &root, 1).await.unwrap();
        store.append_branch(&ids, &root, 1).await.unwrap();

        for item in store.items().await {
            assert_eq!(item.path, Some(root.child(1)));
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_branch_with_other_index_conflicts_without_writes() {
        let (store, ids) = seeded(3).await;
        let root = TreePath::root();
        store.append_branch(&ids[..2], &root, 0).await.unwrap();

        let err = store
            .append_branch(&ids, &root, 1)
            .await
            .expect_err("items already moved to branch 0");
        match err {
            StoreError::BranchConflict {
                expected, matched, ..
            } => {
                assert_eq!(expected, 3);
                assert_eq!(matched, 1);
            }
            other => panic!("expected branch conflict, got {other:?}"),
        }
        let items = store.items().await;
        assert_eq!(items[2].path, None);
        assert_eq!(items[0].path, Some(root.child(0)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repeated_ids_count_once() {
        let (store, ids) = seeded(3).await;
        let root = TreePath::root();
        store
            .append_branch(&[ids[0], ids[0], ids[1]], &root, 0)
            .await
            .unwrap();

        let err = store
            .append_branch(&[ids[2], ids[0], ids[2]], &root, 1)
            .await
            .expect_err("ids[0] already on branch 0");
        assert!(matches!(
            err,
            StoreError::BranchConflict {
                expected: 2,
                matched: 1,
                ..
            }
        ));
        let at_zero = store.fetch_by_path(&root.child(0)).await.unwrap();
        assert_eq!(at_zero.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_ids_conflict() {
        let (store, _) = seeded(1).await;
        let err = store
            .append_branch(&[999], &TreePath::root(), 0)
            .await
            .expect_err("unknown id");
        assert!(matches!(err, StoreError::BranchConflict { matched: 0, .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_and_clear() {
        let (store, ids) = seeded(2).await;
        store
            .append_branch(&ids, &TreePath::root(), 0)
            .await
            .unwrap();
        store
            .insert_node(&TreeNode::new(vec![0.0, 0.0], TreePath::root()))
            .await
            .unwrap();

        assert_eq!(store.reset_paths().await.unwrap(), 2);
        assert_eq!(store.clear_nodes().await.unwrap(), 1);
        assert!(store.items().await.iter().all(|item| item.path.is_none()));
        assert!(store.nodes().await.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejects_wrong_width() {
        let store = MemoryStore::new(3);
        let err = store.insert(vec![1.0]).await.expect_err("too narrow");
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                got: 1
            }
        ));
    }
}
