//! The hierarchical softmax layer: parameters, the per-call cache, and the
//! three entry points (`update_output`, `update_grad_input`,
//! `acc_grad_parameters`).
//!
//! The layer owns one weight row and one bias entry per child slot in the
//! tree; the [`TreeIndex`] says which contiguous row range belongs to which
//! internal node. One forward call processes a whole batch, one sample at a
//! time, and leaves the intermediate cache populated for the gradient
//! calls that follow.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, NdFloat};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::TraversalCache;
use crate::error::SoftmaxTreeError;
use crate::traversal::{acc_grad_sample, backward_sample, forward_sample};
use crate::tree::TreeIndex;

/// Tree-structured softmax classifier layer.
///
/// Computes per-sample log-probabilities of target leaves in O(depth)
/// instead of a dense softmax's O(n_classes). Weight shape is
/// `[n_rows, input_size]` where `n_rows` is the total number of child
/// slots; bias has one entry per row.
///
/// Gradient calls must follow a forward call on the same inputs: the
/// forward pass populates the intermediate cache the gradient passes
/// replay, and a mismatch fails with
/// [`StaleCache`](SoftmaxTreeError::StaleCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "F: Serialize",
    deserialize = "F: Deserialize<'de>"
))]
pub struct SoftmaxTree<F: NdFloat> {
    input_size: usize,
    tree: TreeIndex,
    weight: Array2<F>,
    bias: Array1<F>,
    grad_weight: Array2<F>,
    grad_bias: Array1<F>,
    #[serde(skip)]
    cache: TraversalCache<F>,
}

impl<F: NdFloat> SoftmaxTree<F> {
    /// Create a layer with zero-initialized parameters and gradients.
    pub fn new(input_size: usize, tree: TreeIndex) -> Self {
        let n_rows = tree.n_rows();
        Self {
            input_size,
            tree,
            weight: Array2::zeros((n_rows, input_size)),
            bias: Array1::zeros(n_rows),
            grad_weight: Array2::zeros((n_rows, input_size)),
            grad_bias: Array1::zeros(n_rows),
            cache: TraversalCache::new(),
        }
    }

    /// Re-initialize weights and biases uniformly in `±1/√input_size`.
    pub fn reset_with<R: Rng>(&mut self, rng: &mut R) {
        let stdv = F::one()
            / F::from(self.input_size)
                .expect("input size fits in the float type")
                .sqrt();
        for w in self.weight.iter_mut() {
            *w = F::from(rng.gen_range(-1.0..1.0f64))
                .expect("unit interval fits in the float type")
                * stdv;
        }
        for b in self.bias.iter_mut() {
            *b = F::from(rng.gen_range(-1.0..1.0f64))
                .expect("unit interval fits in the float type")
                * stdv;
        }
    }

    /// Configured input feature dimension.
    #[inline]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// The tree index this layer classifies over.
    #[inline]
    pub fn tree(&self) -> &TreeIndex {
        &self.tree
    }

    /// Weight matrix, one row per child slot.
    #[inline]
    pub fn weight(&self) -> &Array2<F> {
        &self.weight
    }

    /// Mutable weight access for optimizers and tests.
    #[inline]
    pub fn weight_mut(&mut self) -> &mut Array2<F> {
        &mut self.weight
    }

    /// Bias vector, one entry per child slot.
    #[inline]
    pub fn bias(&self) -> &Array1<F> {
        &self.bias
    }

    /// Mutable bias access for optimizers and tests.
    #[inline]
    pub fn bias_mut(&mut self) -> &mut Array1<F> {
        &mut self.bias
    }

    /// Accumulated weight gradients.
    #[inline]
    pub fn grad_weight(&self) -> &Array2<F> {
        &self.grad_weight
    }

    /// Accumulated bias gradients.
    #[inline]
    pub fn grad_bias(&self) -> &Array1<F> {
        &self.grad_bias
    }

    /// Zero the accumulated parameter gradients.
    pub fn zero_grad_parameters(&mut self) {
        self.grad_weight.fill(F::zero());
        self.grad_bias.fill(F::zero());
    }

    fn check_input(&self, input: &ArrayView2<'_, F>) -> Result<(), SoftmaxTreeError> {
        if input.ncols() != self.input_size {
            return Err(SoftmaxTreeError::InputSizeMismatch {
                expected: self.input_size,
                got: input.ncols(),
            });
        }
        Ok(())
    }

    fn check_batch(
        what: &'static str,
        expected: usize,
        got: usize,
    ) -> Result<(), SoftmaxTreeError> {
        if got != expected {
            return Err(SoftmaxTreeError::BatchSizeMismatch { what, expected, got });
        }
        Ok(())
    }

    /// Forward pass: per-sample log-probability of each target leaf.
    ///
    /// `input` is `[batch, input_size]`; `target` holds one 1-based leaf id
    /// per sample. Overwrites the intermediate cache for the whole batch.
    pub fn update_output(
        &mut self,
        input: ArrayView2<'_, F>,
        target: &[i64],
    ) -> Result<Array1<F>, SoftmaxTreeError> {
        self.check_input(&input)?;
        let batch = input.nrows();
        Self::check_batch("target", batch, target.len())?;

        self.cache.reset();
        let mut output = Array1::zeros(batch);
        for (i, &label) in target.iter().enumerate() {
            let leaf = self.tree.resolve(label)?;
            output[i] = forward_sample(
                &self.tree,
                self.weight.view(),
                self.bias.view(),
                input.row(i),
                leaf,
                &mut self.cache,
            )?;
        }
        Ok(output)
    }

    /// Backward pass: gradient of the summed output w.r.t. the input.
    ///
    /// Replays the walk of the last [`update_output`](Self::update_output)
    /// call; `grad_output` holds one upstream scalar per sample. Returns a
    /// `[batch, input_size]` gradient.
    pub fn update_grad_input(
        &self,
        input: ArrayView2<'_, F>,
        grad_output: ArrayView1<'_, F>,
        target: &[i64],
    ) -> Result<Array2<F>, SoftmaxTreeError> {
        self.check_input(&input)?;
        let batch = input.nrows();
        Self::check_batch("grad_output", batch, grad_output.len())?;
        Self::check_batch("target", batch, target.len())?;

        let mut grad_input = Array2::zeros(input.raw_dim());
        let mut cursor = 0usize;
        let mut scratch = Vec::new();
        for (i, &label) in target.iter().enumerate() {
            let leaf = self.tree.resolve(label)?;
            backward_sample(
                &self.tree,
                self.weight.view(),
                leaf,
                grad_output[i],
                &self.cache,
                &mut cursor,
                &mut scratch,
                grad_input.row_mut(i),
            )?;
        }
        Ok(grad_input)
    }

    /// Accumulate parameter gradients for the last forward batch.
    ///
    /// Adds `scale * grad_at_node ⊗ input` into the weight gradients and
    /// `scale * grad_at_node` into the bias gradients, for every node each
    /// sample visited. Gradients accumulate until
    /// [`zero_grad_parameters`](Self::zero_grad_parameters).
    pub fn acc_grad_parameters(
        &mut self,
        input: ArrayView2<'_, F>,
        grad_output: ArrayView1<'_, F>,
        target: &[i64],
        scale: F,
    ) -> Result<(), SoftmaxTreeError> {
        self.check_input(&input)?;
        let batch = input.nrows();
        Self::check_batch("grad_output", batch, grad_output.len())?;
        Self::check_batch("target", batch, target.len())?;

        let mut cursor = 0usize;
        let mut scratch = Vec::new();
        for (i, &label) in target.iter().enumerate() {
            let leaf = self.tree.resolve(label)?;
            acc_grad_sample(
                &self.tree,
                leaf,
                input.row(i),
                grad_output[i],
                scale,
                &self.cache,
                &mut cursor,
                &mut scratch,
                &mut self.grad_weight,
                &mut self.grad_bias,
            )?;
        }
        Ok(())
    }
}
