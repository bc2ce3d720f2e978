//! Tree addresses shared by items and tree nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Errors raised when converting raw branch values into a [`TreePath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// A stored branch value does not fit the `u16` branch range.
    #[error("branch value {0} is outside the supported range 0..=65535")]
    BranchOutOfRange(i64),
}

/// Immutable sequence of branch indices leading from the root to a node.
///
/// The root is the empty path. [`TreePath::child`] always allocates a fresh
/// value, so sibling paths never alias one another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreePath(Arc<[u16]>);

impl TreePath {
    /// The root path (empty sequence).
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds a path from explicit branch indices.
    pub fn from_branches<I>(branches: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        Self(branches.into_iter().collect())
    }

    /// Returns `true` for the empty root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of branches taken from the root.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Branch indices in root-to-node order.
    pub fn branches(&self) -> &[u16] {
        &self.0
    }

    /// Returns a new path with `branch` appended.
    pub fn child(&self, branch: u16) -> Self {
        let mut branches = Vec::with_capacity(self.0.len() + 1);
        branches.extend_from_slice(&self.0);
        branches.push(branch);
        Self(branches.into())
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, init) = self.0.split_last()?;
        Some(Self(init.into()))
    }

    /// Whether `prefix` is an ancestor of (or equal to) this path.
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Encodes the path for an `INTEGER[]` column.
    pub fn to_sql_array(&self) -> Vec<i32> {
        self.0.iter().map(|&branch| i32::from(branch)).collect()
    }

    /// Decodes an `INTEGER[]` column value.
    pub fn from_sql_array(values: &[i32]) -> Result<Self, PathError> {
        values
            .iter()
            .map(|&value| {
                u16::try_from(value).map_err(|_| PathError::BranchOutOfRange(i64::from(value)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from_branches)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for branch in self.0.iter() {
            write!(f, "/{branch}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_does_not_alias_parent_or_siblings() {
        let parent = TreePath::from_branches([1, 0]);
        let left = parent.child(0);
        let right = parent.child(1);

        assert_eq!(parent.branches(), &[1, 0]);
        assert_eq!(left.branches(), &[1, 0, 0]);
        assert_eq!(right.branches(), &[1, 0, 1]);
        assert_eq!(left.parent(), Some(parent.clone()));
        assert!(right.starts_with(&parent));
        assert!(!right.starts_with(&left));
    }

    #[test]
    fn root_formatting_and_depth() {
        let root = TreePath::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert_eq!(root.parent(), None);
        assert_eq!(root.to_string(), "/");
        assert_eq!(root.child(2).child(0).to_string(), "/2/0");
    }

    #[test]
    fn sql_array_rejects_negative_branches() {
        let path = TreePath::from_sql_array(&[0, 3, 1]).expect("valid branches");
        assert_eq!(path.to_sql_array(), vec![0, 3, 1]);
        assert_eq!(
            TreePath::from_sql_array(&[0, -1]),
            Err(PathError::BranchOutOfRange(-1))
        );
    }
}
