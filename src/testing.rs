//! Shared fixtures for unit and integration tests: small synthetic trees
//! and layers with literal or seeded parameters.

use ndarray::NdFloat;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::layer::SoftmaxTree;
use crate::tree::TreeIndex;

/// Two-level tree used across the test suite.
///
/// Root (id 1) has children `{2, 3}`; node 2 is internal with children
/// `{4, 5}`; nodes 3, 4, 5 are leaves. Weight rows: root's children occupy
/// rows 0..2, node 2's children rows 2..4.
pub fn two_level_tree() -> TreeIndex {
    TreeIndex::from_children(1, &[(1, vec![2, 3]), (2, vec![4, 5])])
        .expect("valid fixture tree")
}

/// Three-level tree with mixed arity, for gradient and normalization
/// checks.
///
/// Root (id 1) has children `{2, 3, 4}`; node 2 has children `{5, 6}`;
/// node 4 has children `{7, 8, 9}`. Leaves: 3, 5, 6, 7, 8, 9. Total
/// weight rows: 8.
pub fn mixed_arity_tree() -> TreeIndex {
    TreeIndex::from_children(
        1,
        &[(1, vec![2, 3, 4]), (2, vec![5, 6]), (4, vec![7, 8, 9])],
    )
    .expect("valid fixture tree")
}

/// [`two_level_tree`] layer over 3 input features with literal parameters,
/// small enough to hand-derive expected outputs.
///
/// ```text
/// weight = [[0.1, 0.0, 0.0],     bias = [ 0.0,
///           [0.0, 0.1, 0.0],              0.1,
///           [0.0, 0.0, 0.1],              0.0,
///           [0.1, 0.1, 0.0]]             -0.1]
/// ```
pub fn two_level_layer<F: NdFloat>() -> SoftmaxTree<F> {
    let mut layer = SoftmaxTree::new(3, two_level_tree());

    #[rustfmt::skip]
    let weight = [
        0.1, 0.0, 0.0,
        0.0, 0.1, 0.0,
        0.0, 0.0, 0.1,
        0.1, 0.1, 0.0,
    ];
    let bias = [0.0, 0.1, 0.0, -0.1];

    for (dst, &src) in layer.weight_mut().iter_mut().zip(weight.iter()) {
        *dst = F::from(src).expect("literal fits any float width");
    }
    for (dst, &src) in layer.bias_mut().iter_mut().zip(bias.iter()) {
        *dst = F::from(src).expect("literal fits any float width");
    }
    layer
}

/// A layer over `tree` with seeded uniform parameters.
pub fn seeded_layer(tree: TreeIndex, input_size: usize, seed: u64) -> SoftmaxTree<f64> {
    let mut layer = SoftmaxTree::new(input_size, tree);
    let mut rng = StdRng::seed_from_u64(seed);
    layer.reset_with(&mut rng);
    layer
}
