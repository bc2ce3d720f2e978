//! Shared item and tree node records used by stores and the partitioner.

use serde::{Deserialize, Serialize};

use crate::path::TreePath;

/// Embedding width of the default schema.
pub const EMBEDDING_DIM: usize = 768;

/// Stable identity of an item inside a path store.
pub type ItemId = i64;

/// One embedded record as seen by the partitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Store-assigned identifier, increasing in insertion order.
    pub id: ItemId,
    /// Embedding vector produced upstream.
    pub embedding: Vec<f32>,
    /// Tree address; `None` until the first split assigns a branch.
    pub path: Option<TreePath>,
}

impl Item {
    /// Builds an item with an unset path.
    pub fn new(id: ItemId, embedding: Vec<f32>) -> Self {
        Self {
            id,
            embedding,
            path: None,
        }
    }

    /// Whether the item currently sits exactly at `path`.
    ///
    /// Unset paths count as sitting at the root.
    pub fn is_at(&self, path: &TreePath) -> bool {
        match &self.path {
            Some(current) => current == path,
            None => path.is_root(),
        }
    }
}

impl AsRef<[f32]> for Item {
    fn as_ref(&self) -> &[f32] {
        &self.embedding
    }
}

/// Persisted centroid row keyed by its tree location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Representative vector of the group at `location`.
    pub centroid: Vec<f32>,
    /// Address of the group; the root uses the empty path.
    pub location: TreePath,
}

impl TreeNode {
    /// Creates a node record.
    pub fn new(centroid: Vec<f32>, location: TreePath) -> Self {
        Self { centroid, location }
    }
}

/// Loader input row: one pre-embedded source record per JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedItemRecord {
    /// Unique source identifier used for upserts.
    pub key: String,
    /// Text the embedding was computed from.
    #[serde(default)]
    pub text: String,
    /// Model embedding vector.
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_path_sits_at_root() {
        let mut item = Item::new(7, vec![0.5; 4]);
        assert!(item.is_at(&TreePath::root()));
        assert!(!item.is_at(&TreePath::root().child(0)));

        item.path = Some(TreePath::from_branches([0, 1]));
        assert!(item.is_at(&TreePath::from_branches([0, 1])));
        assert!(!item.is_at(&TreePath::root()));
    }

    #[test]
    fn record_text_defaults_to_empty() {
        let record: EmbeddedItemRecord =
            serde_json::from_str(r#"{"key":"arxiv:1","embedding":[0.25,0.5]}"#)
                .expect("valid record");
        assert_eq!(record.key, "arxiv:1");
        assert!(record.text.is_empty());
        assert_eq!(record.embedding, vec![0.25, 0.5]);
    }
}
