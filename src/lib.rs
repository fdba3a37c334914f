//! softmax-tree: a hierarchical (tree-structured) softmax layer.
//!
//! Instead of one softmax over all `V` classes, classes sit at the leaves
//! of a pre-built tree and each prediction only evaluates the small
//! softmaxes on the leaf-to-root path, costing O(log V) on balanced trees.
//!
//! # Key Types
//!
//! - [`SoftmaxTree`] - the layer: parameters plus the three entry points
//!   (`update_output`, `update_grad_input`, `acc_grad_parameters`)
//! - [`TreeIndex`] - immutable flat tree mapping (child→parent and
//!   parent→weight-row range)
//! - [`SoftmaxTreeError`] - shape, tree-integrity, and stale-state failures
//!
//! # Example
//!
//! ```
//! use ndarray::array;
//! use softmax_tree::{SoftmaxTree, TreeIndex};
//!
//! // Root (id 1) has children {2, 3}; node 2 has children {4, 5}.
//! let tree = TreeIndex::from_children(1, &[(1, vec![2, 3]), (2, vec![4, 5])]).unwrap();
//! let mut layer = SoftmaxTree::<f64>::new(3, tree);
//!
//! let input = array![[1.0, 2.0, 3.0]];
//! let output = layer.update_output(input.view(), &[4]).unwrap();
//! assert!(output[0] < 0.0); // a log-probability
//!
//! let grad_input = layer
//!     .update_grad_input(input.view(), array![1.0].view(), &[4])
//!     .unwrap();
//! assert_eq!(grad_input.dim(), (1, 3));
//! ```

// Re-export approx traits for users who want to compare outputs
pub use approx;

pub mod cache;
pub mod error;
pub mod layer;
pub mod node;
pub mod testing;
pub mod traversal;
pub mod tree;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use cache::TraversalCache;
pub use error::SoftmaxTreeError;
pub use layer::SoftmaxTree;
pub use traversal::{PathStep, PathSteps};
pub use tree::{NodeId, TreeIndex, TreeIndexError};
