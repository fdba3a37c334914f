//! Per-call intermediate cache for the traversal engine.
//!
//! The forward pass appends one `n_children`-sized block per visited node,
//! batch-wide and in traversal order. The gradient passes re-derive the
//! same offsets by replaying the walk; every read is bounds-checked against
//! the populated length so a mismatched replay surfaces as a stale-state
//! error instead of reading garbage.
//!
//! The cache is reset (length to zero, capacity kept) at the start of every
//! forward call; it is never shared across layer instances or calls.

use num_traits::Zero;

use crate::error::SoftmaxTreeError;

/// Growable scratch holding every visited node's pre-softmax and
/// log-softmax outputs.
#[derive(Debug, Clone)]
pub struct TraversalCache<F> {
    linear: Vec<F>,
    log_prob: Vec<F>,
}

impl<F> Default for TraversalCache<F> {
    fn default() -> Self {
        Self {
            linear: Vec::new(),
            log_prob: Vec::new(),
        }
    }
}

impl<F: Copy + Zero> TraversalCache<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the previous call's contents, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.linear.clear();
        self.log_prob.clear();
    }

    /// Entries written by the forward pass since the last reset.
    #[inline]
    pub fn populated(&self) -> usize {
        self.log_prob.len()
    }

    /// Append one node's worth of entries and return the fresh linear and
    /// log-softmax slices for the evaluator to fill.
    pub fn push_node(&mut self, n_children: usize) -> (&mut [F], &mut [F]) {
        let start = self.log_prob.len();
        self.linear.resize(start + n_children, F::zero());
        self.log_prob.resize(start + n_children, F::zero());
        (&mut self.linear[start..], &mut self.log_prob[start..])
    }

    /// Cached log-softmax slice for one replayed node.
    ///
    /// `offset` is the cumulative entry count re-derived by the replaying
    /// pass; a range past the populated length means the replay does not
    /// match the preceding forward call.
    pub fn node_log_probs(
        &self,
        offset: usize,
        n_children: usize,
    ) -> Result<&[F], SoftmaxTreeError> {
        let required = offset + n_children;
        if required > self.log_prob.len() {
            return Err(SoftmaxTreeError::StaleCache {
                required,
                populated: self.log_prob.len(),
            });
        }
        Ok(&self.log_prob[offset..required])
    }

    /// All cached pre-softmax outputs, in traversal order.
    pub fn linear(&self) -> &[F] {
        &self.linear
    }

    /// All cached log-softmax outputs, in traversal order.
    pub fn log_probs(&self) -> &[F] {
        &self.log_prob
    }
}
