//! Binary-tree overlay topology.
//!
//! The tree is derived purely from an ordered id list, so every node can
//! compute the identical structure locally without any communication.
//! This determinism is the correctness foundation for the rest of the
//! protocol: combination order, connection targets, and broadcast fan-out
//! all follow from it.

use std::collections::{BTreeMap, HashSet};

use crate::error::{ArborError, Result};
use crate::types::NodeId;

/// One node's position in the tree overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: NodeId,
    /// `None` exactly for the root.
    pub parent: Option<NodeId>,
    /// 0 to 2 children, in a stable order used as the canonical
    /// combination and broadcast fan-out order.
    pub children: Vec<NodeId>,
    pub is_root: bool,
}

impl TreeNode {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// The full overlay: NodeId → TreeNode, with deterministic iteration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    nodes: BTreeMap<NodeId, TreeNode>,
    root: NodeId,
}

impl Tree {
    /// The root node.
    pub fn root(&self) -> &TreeNode {
        &self.nodes[&self.root]
    }

    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }

    fn fmt_subtree(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        id: NodeId,
        depth: usize,
    ) -> std::fmt::Result {
        writeln!(f, "{:indent$}{id}", "", indent = depth * 2)?;
        if let Some(node) = self.nodes.get(&id) {
            for &child in &node.children {
                self.fmt_subtree(f, child, depth + 1)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Tree {
    /// Renders the tree one node per line, indented by depth.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_subtree(f, self.root, 0)
    }
}

/// Build the binary tree for an ordered id sequence.
///
/// The sequence is treated as an implicit array-indexed binary tree:
/// index 0 is the root; for index `i`, children sit at `2i+1` and `2i+2`
/// and the parent at `(i-1)/2`. Identical input yields an identical tree
/// on every node.
///
/// Fails with a configuration error on an empty list or duplicate ids.
pub fn build_tree(ids: &[NodeId]) -> Result<Tree> {
    if ids.is_empty() {
        return Err(ArborError::config("cannot build a tree from an empty id list"));
    }

    let mut seen = HashSet::with_capacity(ids.len());
    for &id in ids {
        if !seen.insert(id) {
            return Err(ArborError::config(format!("duplicate node id {id} in id list")));
        }
    }

    let n = ids.len();
    let mut nodes = BTreeMap::new();
    for (i, &id) in ids.iter().enumerate() {
        let parent = if i == 0 { None } else { Some(ids[(i - 1) / 2]) };
        let mut children = Vec::with_capacity(2);
        for c in [2 * i + 1, 2 * i + 2] {
            if c < n {
                children.push(ids[c]);
            }
        }
        nodes.insert(
            id,
            TreeNode {
                id,
                parent,
                children,
                is_root: i == 0,
            },
        );
    }

    Ok(Tree { nodes, root: ids[0] })
}
