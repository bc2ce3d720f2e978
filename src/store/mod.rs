//! Storage seams for item paths and tree nodes.
//!
//! The partitioner talks to storage only through these traits. A [`Backend`]
//! hands out scoped handles: every node task acquires its own handle on entry
//! and drops it when the task ends, so no connection state is shared between
//! subtrees.

use async_trait::async_trait;

use crate::item::{Item, ItemId, TreeNode};
use crate::path::{PathError, TreePath};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgBackend, PgStore, PgTables};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures surfaced by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The Postgres backend rejected a query or dropped the connection.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// Some items were neither at the expected parent path nor already on
    /// the requested branch.
    #[error(
        "branch conflict under {parent}: {expected} item(s) expected on branch {branch}, {matched} matched"
    )]
    BranchConflict {
        /// Path the items were expected to sit at.
        parent: TreePath,
        /// Branch index being appended.
        branch: u16,
        /// Number of ids passed in.
        expected: usize,
        /// Number of ids at the parent or already on the branch.
        matched: usize,
    },
    /// An embedding does not have the store's configured width.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Width configured for the store.
        expected: usize,
        /// Width of the rejected vector.
        got: usize,
    },
    /// A stored path value could not be decoded.
    #[error("invalid stored path: {0}")]
    InvalidPath(#[from] PathError),
}

/// Sorted, deduplicated copy of `ids`; repeated ids name the same item.
pub(crate) fn distinct_ids(ids: &[ItemId]) -> Vec<ItemId> {
    let mut distinct = ids.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    distinct
}

/// Persisted mapping from item identity to its tree path.
#[async_trait]
pub trait PathStore: Send + Sync {
    /// Every item regardless of path, in insertion order.
    async fn fetch_all(&self) -> StoreResult<Vec<Item>>;

    /// Items whose path equals `path` exactly, in insertion order.
    ///
    /// For the root path this returns items whose path is unset or empty.
    async fn fetch_by_path(&self, path: &TreePath) -> StoreResult<Vec<Item>>;

    /// Appends `branch` to the path of exactly the items in `ids`.
    ///
    /// Every id must currently sit at `parent` or already sit at
    /// `parent.child(branch)`; the latter makes a retry a no-op. Any other
    /// state fails with [`StoreError::BranchConflict`] and nothing changes.
    /// Repeated ids count once.
    async fn append_branch(&self, ids: &[ItemId], parent: &TreePath, branch: u16)
        -> StoreResult<()>;

    /// Clears every item path back to unset; returns the affected row count.
    async fn reset_paths(&self) -> StoreResult<u64>;
}

/// Append-only table of centroid rows keyed by location.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Appends one node row. Duplicate locations are not rejected.
    async fn insert_node(&self, node: &TreeNode) -> StoreResult<()>;

    /// Deletes every node row; returns the removed row count.
    async fn clear_nodes(&self) -> StoreResult<u64>;
}

/// Source of scoped store handles shared by all node tasks.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Handle type used for the lifetime of one unit of work.
    type Handle: PathStore + TreeStore + 'static;

    /// Acquires a fresh handle.
    async fn acquire(&self) -> StoreResult<Self::Handle>;
}
