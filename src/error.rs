//! Runtime error taxonomy for the layer entry points.
//!
//! Three classes, all caller errors (none are recoverable at runtime):
//!
//! - shape violations: a batch array does not match the configured layout
//! - tree-integrity violations: the tree index is malformed or a node id
//!   falls outside it
//! - stale-state violations: a gradient pass replayed past the entries the
//!   last forward pass populated
//!
//! Construction-time checks have their own error type,
//! [`TreeIndexError`](crate::tree::TreeIndexError).

use crate::tree::NodeId;

/// Error returned by the layer entry points and the traversal engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SoftmaxTreeError {
    /// Input feature dimension differs from the configured `input_size`.
    #[error("invalid input size: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },

    /// A per-sample array does not match the batch size.
    #[error("{what} length {got} does not match batch size {expected}")]
    BatchSizeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// An external (1-based) node id has no row in the tree index.
    #[error("node id {id} is not in the tree index")]
    UnknownNode { id: i64 },

    /// A non-root node was reached that has no parent entry.
    #[error("non-root node {node} has no parent in tree")]
    NoParent { node: NodeId },

    /// Traversal visited more nodes than the index holds.
    #[error("cycle detected in tree index at node {node}")]
    Cycle { node: NodeId },

    /// A gradient pass replayed onto cache offsets the last forward pass
    /// never populated.
    #[error(
        "backward performed on different inputs than last forward \
         (need {required} cached entries, have {populated})"
    )]
    StaleCache { required: usize, populated: usize },
}
