//! Leaf-to-root traversal: the forward, input-gradient, and
//! parameter-gradient walks.
//!
//! All three passes share one iterator over the child→parent chain
//! ([`PathSteps`]); the gradient passes replay the exact walk the forward
//! pass took, re-deriving cache offsets as they go. Traversal is iterative
//! pointer-chasing over the flat index maps; there is no recursion and no
//! per-node allocation beyond the shared scratch buffer.

use ndarray::linalg::general_mat_vec_mul;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, NdFloat};

use crate::cache::TraversalCache;
use crate::error::SoftmaxTreeError;
use crate::node::{evaluate_node, log_softmax_backward};
use crate::tree::{NodeId, TreeIndex};

// ============================================================================
// PathSteps
// ============================================================================

/// One node visit on the leaf→root walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// The internal node whose children are softmaxed at this step.
    pub parent: NodeId,
    /// Position of the traversed child among `parent`'s children.
    pub child_pos: usize,
    /// First weight/bias row of `parent`'s children.
    pub row_offset: usize,
    /// Number of children (softmax width) at this step.
    pub n_children: usize,
}

/// Iterator over the child→parent chain from a leaf to the tree root.
///
/// Yields one [`PathStep`] per visited internal node, bottom-up. Integrity
/// failures (missing parent entry, cycle) surface as errors mid-iteration
/// and end the walk; callers short-circuit with `?`.
pub struct PathSteps<'a> {
    tree: &'a TreeIndex,
    current: Option<NodeId>,
    hops: usize,
}

impl<'a> PathSteps<'a> {
    pub fn new(tree: &'a TreeIndex, leaf: NodeId) -> Self {
        Self {
            tree,
            current: Some(leaf),
            hops: 0,
        }
    }
}

impl<'a> Iterator for PathSteps<'a> {
    type Item = Result<PathStep, SoftmaxTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        if self.hops > self.tree.n_nodes() {
            self.current = None;
            return Some(Err(SoftmaxTreeError::Cycle { node }));
        }
        self.hops += 1;

        let Some((parent, child_pos)) = self.tree.parent_of(node) else {
            self.current = None;
            return Some(Err(SoftmaxTreeError::NoParent { node }));
        };
        // Constructors reject children whose parent has no children entry.
        let (row_offset, n_children) = self
            .tree
            .children_of(parent)
            .expect("referenced parent has a children entry");

        self.current = (parent != self.tree.root()).then_some(parent);

        Some(Ok(PathStep {
            parent,
            child_pos,
            row_offset,
            n_children,
        }))
    }
}

impl TreeIndex {
    /// Walk the child→parent chain from `leaf` to the configured root.
    pub fn path_from(&self, leaf: NodeId) -> PathSteps<'_> {
        PathSteps::new(self, leaf)
    }
}

// ============================================================================
// Forward
// ============================================================================

/// Forward walk for one sample: evaluate every node on the leaf→root path,
/// append both outputs to the cache, and sum the traversed children's
/// log-probabilities.
pub(crate) fn forward_sample<F: NdFloat>(
    tree: &TreeIndex,
    weight: ArrayView2<'_, F>,
    bias: ArrayView1<'_, F>,
    input: ArrayView1<'_, F>,
    leaf: NodeId,
    cache: &mut TraversalCache<F>,
) -> Result<F, SoftmaxTreeError> {
    let mut acc = F::zero();

    for step in tree.path_from(leaf) {
        let step = step?;
        let rows = step.row_offset..step.row_offset + step.n_children;

        let (linear, log_prob) = cache.push_node(step.n_children);
        evaluate_node(
            input,
            weight.slice(s![rows.clone(), ..]),
            bias.slice(s![rows]),
            linear,
            log_prob,
        );
        acc = acc + log_prob[step.child_pos];
    }

    Ok(acc)
}

// ============================================================================
// Backward (gradient w.r.t. input)
// ============================================================================

/// Backward walk for one sample: replay the forward path, turn each cached
/// log-softmax block into a logit gradient, and accumulate
/// `weight_sliceᵀ · grad` into the sample's input-gradient row.
///
/// `cursor` is the batch-wide cumulative cache offset; it advances exactly
/// as the forward pass did. Every cache read is stale-checked first.
pub(crate) fn backward_sample<F: NdFloat>(
    tree: &TreeIndex,
    weight: ArrayView2<'_, F>,
    leaf: NodeId,
    grad_output: F,
    cache: &TraversalCache<F>,
    cursor: &mut usize,
    scratch: &mut Vec<F>,
    mut grad_input: ArrayViewMut1<'_, F>,
) -> Result<(), SoftmaxTreeError> {
    for step in tree.path_from(leaf) {
        let step = step?;
        let log_prob = cache.node_log_probs(*cursor, step.n_children)?;
        *cursor += step.n_children;

        scratch.clear();
        scratch.resize(step.n_children, F::zero());
        log_softmax_backward(log_prob, step.child_pos, grad_output, scratch);

        let rows = step.row_offset..step.row_offset + step.n_children;
        let grad_at_node = ArrayView1::from(&scratch[..]);
        general_mat_vec_mul(
            F::one(),
            &weight.slice(s![rows, ..]).t(),
            &grad_at_node,
            F::one(),
            &mut grad_input,
        );
    }

    Ok(())
}

// ============================================================================
// Parameter gradients
// ============================================================================

/// Parameter-gradient walk for one sample: same replay and the same logit
/// gradient as [`backward_sample`], accumulated into the weight rows as a
/// scaled outer product with the input, and into the bias rows directly.
pub(crate) fn acc_grad_sample<F: NdFloat>(
    tree: &TreeIndex,
    leaf: NodeId,
    input: ArrayView1<'_, F>,
    grad_output: F,
    scale: F,
    cache: &TraversalCache<F>,
    cursor: &mut usize,
    scratch: &mut Vec<F>,
    grad_weight: &mut Array2<F>,
    grad_bias: &mut Array1<F>,
) -> Result<(), SoftmaxTreeError> {
    for step in tree.path_from(leaf) {
        let step = step?;
        let log_prob = cache.node_log_probs(*cursor, step.n_children)?;
        *cursor += step.n_children;

        scratch.clear();
        scratch.resize(step.n_children, F::zero());
        log_softmax_backward(log_prob, step.child_pos, grad_output, scratch);

        let rows = step.row_offset..step.row_offset + step.n_children;
        let mut weight_rows = grad_weight.slice_mut(s![rows.clone(), ..]);
        for (j, mut row) in weight_rows.outer_iter_mut().enumerate() {
            row.scaled_add(scale * scratch[j], &input);
        }
        let mut bias_rows = grad_bias.slice_mut(s![rows]);
        for (j, b) in bias_rows.iter_mut().enumerate() {
            *b = *b + scale * scratch[j];
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
