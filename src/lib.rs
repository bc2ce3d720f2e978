#![warn(missing_docs)]
//! Recursive partitioning of persisted embedding collections into a centroid tree.

pub mod centroid;
pub mod controls;
pub mod item;
pub mod partition;
pub mod path;
pub mod runtime;
pub mod store;
pub mod vector_store;

pub use centroid::{CentroidSampler, DEFAULT_CENTROID_SAMPLE};
pub use controls::{ClusterArgs, ClusterControls, ControlsError, GroupFate};
pub use item::{EmbeddedItemRecord, Item, ItemId, TreeNode, EMBEDDING_DIM};
pub use partition::ContiguousPartitioner;
pub use path::{PathError, TreePath};
pub use runtime::{BuildReport, NodeOutcome, SubtreeFailure, TreeBuilder};
pub use store::{
    Backend, MemoryStore, PathStore, PgBackend, PgStore, PgTables, StoreError, StoreResult,
    TreeStore,
};
pub use vector_store::{StoreArgs, TableName};
