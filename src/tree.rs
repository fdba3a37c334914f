//! Immutable tree index: flat child→parent and parent→row-range mappings.
//!
//! The index is the layer's only view of the class hierarchy. It stores two
//! flat maps over dense node ids:
//!
//! - `parent` / `child_pos`: for every node, its parent and its position
//!   among that parent's children
//! - `row_offset` / `n_children`: for every internal node, the contiguous
//!   range of weight-matrix rows allocated to its children
//!
//! Node ids are 0-based `u32` internally. Construction tables and every id
//! crossing the crate boundary (targets, root) are 1-based, matching the
//! labeling convention of the hosting toolkit; the offset-by-one conversion
//! happens exactly once at each boundary.

use serde::{Deserialize, Serialize};

use crate::error::SoftmaxTreeError;

/// Internal (0-based) node identifier.
pub type NodeId = u32;

/// Sentinel for "no entry" in the flat maps.
const NO_NODE: u32 = u32::MAX;

// ============================================================================
// TreeIndexError
// ============================================================================

/// Construction and validation errors for [`TreeIndex`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeIndexError {
    /// The root id falls outside the node id space.
    #[error("root id {root} is out of range for {n_nodes} nodes")]
    InvalidRoot { root: i64, n_nodes: usize },

    /// The root has no children entry, so no traversal can terminate at it.
    #[error("root id {root} has no children entry")]
    RootWithoutChildren { root: i64 },

    /// A node id in a construction table is not a positive 1-based id.
    #[error("node id {id} is not a valid 1-based id")]
    InvalidNodeId { id: i64 },

    /// A child row references a parent outside the node id space.
    #[error("node {node} references parent {parent} which is out of range")]
    ParentOutOfRange { node: NodeId, parent: i64 },

    /// A child row references a parent that has no children entry.
    #[error("node {node} references parent {parent} which has no children entry")]
    MissingChildren { node: NodeId, parent: NodeId },

    /// A child's position does not fit inside its parent's child count.
    #[error("node {node} has child position {pos} outside its parent's {n_children} children")]
    InvalidChildPosition {
        node: NodeId,
        pos: i64,
        n_children: u32,
    },

    /// A children entry carries a non-positive row offset.
    #[error("parent {parent} has invalid weight-row range (offset {offset}, {n_children} children)")]
    InvalidRowRange {
        parent: NodeId,
        offset: i64,
        n_children: i64,
    },

    /// Two parents claim overlapping weight-row ranges.
    #[error("parents {a} and {b} have overlapping weight-row ranges")]
    RowRangeOverlap { a: NodeId, b: NodeId },

    /// Walking parents from `node` revisited nodes without reaching the root.
    #[error("cycle detected while walking from node {node} to the root")]
    CycleDetected { node: NodeId },

    /// A mapped node's parent chain dead-ends before the root.
    #[error("node {node} cannot reach the root (missing parent entry at node {stuck})")]
    UnreachableRoot { node: NodeId, stuck: NodeId },

    /// A node is listed as a child of more than one parent.
    #[error("node {node} appears as a child of more than one parent")]
    DuplicateChild { node: i64 },

    /// A parent appears in more than one children group.
    #[error("parent {parent} listed more than once")]
    DuplicateParent { parent: i64 },

    /// Persisted index tables disagree with each other.
    #[error("persisted index tables are inconsistent")]
    MismatchedTables,
}

// ============================================================================
// TreeIndex
// ============================================================================

/// Immutable flat tree mapping consumed by the traversal engine.
///
/// Constructed once per layer and never mutated. Nodes without a parent
/// entry are permitted at construction (the hosting toolkit may hand over
/// sparse tables); targeting one of them fails at traversal time with a
/// tree-integrity error. Use [`validate`](Self::validate) to reject such
/// tables eagerly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTreeIndex")]
pub struct TreeIndex {
    /// Parent id per node, `NO_NODE` where the table has no entry.
    parent: Box<[u32]>,
    /// 0-based position among the parent's children, parallel to `parent`.
    child_pos: Box<[u32]>,
    /// First weight row of a node's children, meaningful when `n_children > 0`.
    row_offset: Box<[u32]>,
    /// Child count per node; `0` marks a leaf (no children entry).
    n_children: Box<[u32]>,
    root: NodeId,
    n_rows: usize,
}

impl TreeIndex {
    /// Build an index from raw 1-based tables.
    ///
    /// Row `i` of either table describes node `i + 1`. `child_parent` rows
    /// are `(parent_id, child_position)` with non-positive values marking
    /// "no entry" (the root, or an orphan row). `parent_children` rows are
    /// `(row_offset, n_children)` with a non-positive count marking a leaf.
    ///
    /// Only cheap per-row range checks run here; cross-node properties
    /// (reachability, cycles, row-range overlap) are left to
    /// [`validate`](Self::validate), and traversal carries its own guards.
    pub fn from_tables(
        child_parent: &[(i64, i64)],
        parent_children: &[(i64, i64)],
        root_id: i64,
    ) -> Result<Self, TreeIndexError> {
        let n_nodes = child_parent.len().max(parent_children.len());

        let mut parent = vec![NO_NODE; n_nodes];
        let mut child_pos = vec![NO_NODE; n_nodes];
        let mut row_offset = vec![NO_NODE; n_nodes];
        let mut n_children = vec![0u32; n_nodes];
        let mut n_rows = 0usize;

        for (i, &(offset, count)) in parent_children.iter().enumerate() {
            if count <= 0 {
                continue; // leaf row
            }
            // Offsets and counts are stored as u32; the whole row range must
            // fit, not just survive the cast.
            let fits = offset >= 1
                && (offset - 1)
                    .checked_add(count)
                    .is_some_and(|end| end <= u32::MAX as i64);
            if !fits {
                return Err(TreeIndexError::InvalidRowRange {
                    parent: i as NodeId,
                    offset,
                    n_children: count,
                });
            }
            row_offset[i] = (offset - 1) as u32;
            n_children[i] = count as u32;
            n_rows = n_rows.max((offset - 1 + count) as usize);
        }

        for (i, &(p, pos)) in child_parent.iter().enumerate() {
            if p <= 0 {
                continue; // no parent entry
            }
            if p > n_nodes as i64 {
                return Err(TreeIndexError::ParentOutOfRange {
                    node: i as NodeId,
                    parent: p,
                });
            }
            let pi = (p - 1) as usize;
            if n_children[pi] == 0 {
                return Err(TreeIndexError::MissingChildren {
                    node: i as NodeId,
                    parent: pi as NodeId,
                });
            }
            if pos < 1 || pos > n_children[pi] as i64 {
                return Err(TreeIndexError::InvalidChildPosition {
                    node: i as NodeId,
                    pos,
                    n_children: n_children[pi],
                });
            }
            parent[i] = (p - 1) as u32;
            child_pos[i] = (pos - 1) as u32;
        }

        if root_id < 1 || root_id > n_nodes as i64 {
            return Err(TreeIndexError::InvalidRoot {
                root: root_id,
                n_nodes,
            });
        }
        let root = (root_id - 1) as NodeId;
        if n_children[root as usize] == 0 {
            return Err(TreeIndexError::RootWithoutChildren { root: root_id });
        }

        Ok(Self {
            parent: parent.into_boxed_slice(),
            child_pos: child_pos.into_boxed_slice(),
            row_offset: row_offset.into_boxed_slice(),
            n_children: n_children.into_boxed_slice(),
            root,
            n_rows,
        })
    }

    /// Build an index from explicit children lists, assigning weight rows in
    /// iteration order.
    ///
    /// `groups` holds `(parent_id, child_ids)` pairs, all ids 1-based. The
    /// first group's children get rows `0..len`, the next group continues
    /// from there, and so on. Convenient for tests and for toolkits that do
    /// not precompute row offsets.
    pub fn from_children(root_id: i64, groups: &[(i64, Vec<i64>)]) -> Result<Self, TreeIndexError> {
        let mut max_id = root_id;
        for (p, kids) in groups {
            max_id = max_id.max(*p);
            for &c in kids {
                max_id = max_id.max(c);
            }
        }
        if max_id < 1 {
            return Err(TreeIndexError::InvalidNodeId { id: max_id });
        }

        let n_nodes = max_id as usize;
        let mut child_parent = vec![(-1i64, -1i64); n_nodes];
        let mut parent_children = vec![(-1i64, -1i64); n_nodes];
        let mut next_row = 1i64;

        for (p, kids) in groups {
            if *p < 1 {
                return Err(TreeIndexError::InvalidNodeId { id: *p });
            }
            let pi = (*p - 1) as usize;
            if parent_children[pi].1 > 0 {
                return Err(TreeIndexError::DuplicateParent { parent: *p });
            }
            parent_children[pi] = (next_row, kids.len() as i64);
            for (j, &c) in kids.iter().enumerate() {
                if c < 1 {
                    return Err(TreeIndexError::InvalidNodeId { id: c });
                }
                let ci = (c - 1) as usize;
                if child_parent[ci].0 > 0 {
                    return Err(TreeIndexError::DuplicateChild { node: c });
                }
                child_parent[ci] = (*p, j as i64 + 1);
            }
            next_row += kids.len() as i64;
        }

        Self::from_tables(&child_parent, &parent_children, root_id)
    }

    /// Number of node ids in the index (including unmapped/orphan rows).
    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.parent.len()
    }

    /// Total weight/bias rows spanned by all children ranges.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Internal id of the configured root.
    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// External (1-based) id of the configured root.
    #[inline]
    pub fn root_id(&self) -> i64 {
        self.root as i64 + 1
    }

    /// Parent id and 0-based child position of `node`, if it has an entry.
    ///
    /// # Panics
    ///
    /// Panics if `node` is outside the node id space; resolve external ids
    /// through [`resolve`](Self::resolve) first.
    #[inline]
    pub fn parent_of(&self, node: NodeId) -> Option<(NodeId, usize)> {
        let p = self.parent[node as usize];
        (p != NO_NODE).then(|| (p, self.child_pos[node as usize] as usize))
    }

    /// Weight-row offset and child count of `node`, if it is internal.
    #[inline]
    pub fn children_of(&self, node: NodeId) -> Option<(usize, usize)> {
        let n = self.n_children[node as usize];
        (n > 0).then(|| (self.row_offset[node as usize] as usize, n as usize))
    }

    /// Whether `node` has no children entry.
    #[inline]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.n_children[node as usize] == 0
    }

    /// All mapped leaves: nodes with a parent entry but no children entry.
    pub fn leaves(&self) -> Vec<NodeId> {
        (0..self.n_nodes() as NodeId)
            .filter(|&n| self.is_leaf(n) && self.parent[n as usize] != NO_NODE)
            .collect()
    }

    /// Convert an external 1-based id to an internal node id.
    pub fn resolve(&self, id: i64) -> Result<NodeId, SoftmaxTreeError> {
        if id < 1 || id > self.n_nodes() as i64 {
            return Err(SoftmaxTreeError::UnknownNode { id });
        }
        Ok((id - 1) as NodeId)
    }

    /// Validate cross-node invariants: every mapped node reaches the root
    /// without cycling, and weight-row ranges are pairwise disjoint.
    ///
    /// Intended for debug checks and tests; constructors only perform cheap
    /// per-row checks, and the traversal engine carries its own guards.
    pub fn validate(&self) -> Result<(), TreeIndexError> {
        for start in 0..self.n_nodes() as NodeId {
            if self.parent[start as usize] == NO_NODE {
                continue;
            }
            let mut node = start;
            let mut hops = 0usize;
            loop {
                let Some((p, _)) = self.parent_of(node) else {
                    return Err(TreeIndexError::UnreachableRoot { node: start, stuck: node });
                };
                if p == self.root {
                    break;
                }
                hops += 1;
                if hops > self.n_nodes() {
                    return Err(TreeIndexError::CycleDetected { node: start });
                }
                node = p;
            }
        }

        let mut ranges: Vec<(usize, usize, NodeId)> = (0..self.n_nodes() as NodeId)
            .filter_map(|n| self.children_of(n).map(|(o, c)| (o, o + c, n)))
            .collect();
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            if w[1].0 < w[0].1 {
                return Err(TreeIndexError::RowRangeOverlap { a: w[0].2, b: w[1].2 });
            }
        }

        Ok(())
    }
}

// ============================================================================
// RawTreeIndex
// ============================================================================

/// Wire form of [`TreeIndex`]: the same fields, none of the invariants.
///
/// Deserialization lands here first, converts back to 1-based tables, and
/// re-runs the construction checks, so a hand-edited or corrupted persisted
/// index is rejected at load time instead of failing mid-traversal.
#[derive(Deserialize)]
struct RawTreeIndex {
    parent: Box<[u32]>,
    child_pos: Box<[u32]>,
    row_offset: Box<[u32]>,
    n_children: Box<[u32]>,
    root: NodeId,
    n_rows: usize,
}

impl TryFrom<RawTreeIndex> for TreeIndex {
    type Error = TreeIndexError;

    fn try_from(raw: RawTreeIndex) -> Result<Self, Self::Error> {
        let n_nodes = raw.parent.len();
        if raw.child_pos.len() != n_nodes
            || raw.row_offset.len() != n_nodes
            || raw.n_children.len() != n_nodes
        {
            return Err(TreeIndexError::MismatchedTables);
        }

        let child_parent: Vec<(i64, i64)> = (0..n_nodes)
            .map(|i| {
                if raw.parent[i] == NO_NODE {
                    (-1, -1)
                } else {
                    (raw.parent[i] as i64 + 1, raw.child_pos[i] as i64 + 1)
                }
            })
            .collect();
        let parent_children: Vec<(i64, i64)> = (0..n_nodes)
            .map(|i| {
                if raw.n_children[i] == 0 {
                    (-1, -1)
                } else {
                    (raw.row_offset[i] as i64 + 1, raw.n_children[i] as i64)
                }
            })
            .collect();

        let tree = Self::from_tables(&child_parent, &parent_children, raw.root as i64 + 1)?;
        if tree.n_rows != raw.n_rows {
            return Err(TreeIndexError::MismatchedTables);
        }
        Ok(tree)
    }
}

// ============================================================================
// Tests
// ============================================================================
