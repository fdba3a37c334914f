//! Per-node evaluation: affine projection plus numerically stable
//! log-softmax over one node's children, and the matching backward step.
//!
//! Both functions write into caller-provided slices so the traversal engine
//! can point them straight at the intermediate cache.

use ndarray::linalg::general_mat_vec_mul;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, NdFloat};

/// Evaluate one tree node: `linear = W · x + b`, then a log-softmax over
/// the node's children.
///
/// `weight` holds the `n_children` rows allocated to this node's children;
/// `linear` and `log_prob` must both have length `n_children`. The
/// log-softmax subtracts the row maximum before exponentiating, so large
/// logits cannot overflow.
pub fn evaluate_node<F: NdFloat>(
    input: ArrayView1<'_, F>,
    weight: ArrayView2<'_, F>,
    bias: ArrayView1<'_, F>,
    linear: &mut [F],
    log_prob: &mut [F],
) {
    debug_assert_eq!(weight.nrows(), linear.len());
    debug_assert_eq!(weight.ncols(), input.len());
    debug_assert_eq!(bias.len(), linear.len());
    debug_assert_eq!(log_prob.len(), linear.len());

    let mut out = ArrayViewMut1::from(&mut *linear);
    out.assign(&bias);
    general_mat_vec_mul(F::one(), &weight, &input, F::one(), &mut out);

    let max = linear.iter().cloned().fold(F::neg_infinity(), F::max);
    let mut sum = F::zero();
    for &v in linear.iter() {
        sum = sum + (v - max).exp();
    }
    let log_sum = max + sum.ln();

    for (o, &v) in log_prob.iter_mut().zip(linear.iter()) {
        *o = v - log_sum;
    }
}

/// Gradient of the selected log-softmax output w.r.t. the pre-softmax
/// logits: `grad[j] = -exp(log_prob[j]) * grad_output`, plus `grad_output`
/// at the selected child position.
///
/// Shared by the input-gradient and parameter-gradient passes so both use
/// the same derivation.
pub fn log_softmax_backward<F: NdFloat>(
    log_prob: &[F],
    child_pos: usize,
    grad_output: F,
    grad: &mut [F],
) {
    debug_assert_eq!(grad.len(), log_prob.len());
    debug_assert!(child_pos < log_prob.len());

    for (g, &lp) in grad.iter_mut().zip(log_prob.iter()) {
        *g = -lp.exp() * grad_output;
    }
    grad[child_pos] = grad[child_pos] + grad_output;
}
